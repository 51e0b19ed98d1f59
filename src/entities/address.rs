use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;
use validator::Validate;

use crate::store::{Entity, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1, message = "Shipping address street line is required"))]
    pub line1: String,
    pub line2: Option<String>,
    pub district: Option<String>,
    #[validate(length(min = 1, message = "Shipping address city is required"))]
    pub city: String,
    pub postal_code: Option<String>,
    pub country: String,
    /// National short address code (four letters, four digits).
    pub short_code: Option<String>,
    pub coordinates: Option<GeoPoint>,
}

impl Address {
    /// Lower-cased, trimmed city used for grouping and metro checks.
    pub fn city_key(&self) -> String {
        self.city.trim().to_lowercase()
    }

    pub fn one_line(&self) -> String {
        let mut parts = vec![self.line1.trim().to_string()];
        if let Some(district) = self.district.as_deref().filter(|d| !d.trim().is_empty()) {
            parts.push(district.trim().to_string());
        }
        parts.push(self.city.trim().to_string());
        if let Some(postal) = self.postal_code.as_deref().filter(|p| !p.trim().is_empty()) {
            parts.push(postal.trim().to_string());
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationMethod {
    AutoCodeLookup,
    CustomerConfirmed,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    AwaitingCustomer,
    Verified,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressVerification {
    pub id: Uuid,
    pub order_id: Uuid,
    pub short_code: Option<String>,
    pub customer_phone: String,
    pub original_address: Address,
    pub verified_address: Option<Address>,
    pub method: Option<VerificationMethod>,
    pub status: VerificationStatus,
    pub confirmation_message_id: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Entity for AddressVerification {
    const ENTITY_TYPE: EntityType = EntityType::AddressVerification;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Resolved short-code lookup, keyed by the normalised code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressCacheEntry {
    pub id: Uuid,
    pub short_code: String,
    pub address: Address,
    pub coordinates: GeoPoint,
    pub confidence: f64,
    pub hits: u32,
    pub flagged_for_review: bool,
    pub last_divergence_meters: Option<f64>,
    pub looked_up_at: DateTime<Utc>,
}

impl AddressCacheEntry {
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_uppercase()
    }

    pub fn id_for_code(code: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("address-code:{}", Self::normalize_code(code)).as_bytes(),
        )
    }
}

impl Entity for AddressCacheEntry {
    const ENTITY_TYPE: EntityType = EntityType::AddressCache;

    fn id(&self) -> Uuid {
        self.id
    }
}
