//! Contracts for the external collaborators the pipeline talks to.
//!
//! Only the request/response shapes matter to the core; concrete vendor
//! clients live outside this crate. [`memory`] provides deterministic
//! implementations for the CLI and tests.

pub mod memory;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::{Address, GeoPoint, Order};
use crate::errors::ServiceError;

/// Outbound text messaging (customer confirmations, tracking links, supervisor alerts).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Sends a text message and returns the provider's message id.
    async fn send_text(&self, phone: &str, body: &str) -> Result<String, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierOffer {
    pub courier: String,
    pub service_level: String,
    pub rate: Decimal,
    pub transit_days: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CourierRates: Send + Sync {
    async fn quote(&self, order: &Order, weight_kg: f64) -> Result<Vec<CourierOffer>, ServiceError>;

    /// Books the shipment with the chosen courier and returns its tracking number.
    async fn create_shipment(
        &self,
        order: &Order,
        offer: &CourierOffer,
    ) -> Result<String, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryLookup {
    pub found: bool,
    pub address: Option<Address>,
    pub coordinates: Option<GeoPoint>,
    pub confidence: f64,
}

impl RegistryLookup {
    pub fn not_found() -> Self {
        Self {
            found: false,
            address: None,
            coordinates: None,
            confidence: 0.0,
        }
    }
}

/// National short-address registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AddressRegistry: Send + Sync {
    async fn lookup(&self, short_code: &str) -> Result<RegistryLookup, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &Address) -> Result<GeoPoint, ServiceError>;

    /// Pairwise distances in kilometres, `origins x destinations`.
    async fn distance_matrix(
        &self,
        origins: &[GeoPoint],
        destinations: &[GeoPoint],
    ) -> Result<Vec<Vec<f64>>, ServiceError>;
}
