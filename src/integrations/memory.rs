use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal_macros::dec;

use super::{AddressRegistry, CourierOffer, CourierRates, Geocoder, MessagingClient, RegistryLookup};
use crate::entities::{Address, AddressCacheEntry, GeoPoint, Order};
use crate::errors::ServiceError;
use crate::services::geocoding::haversine_km;

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub message_id: String,
    pub phone: String,
    pub body: String,
}

/// Records every message instead of sending it. Can be told to fail.
#[derive(Debug, Default)]
pub struct InMemoryMessaging {
    sent: Mutex<Vec<SentMessage>>,
    failures_remaining: AtomicU32,
    next_id: AtomicU64,
}

impl InMemoryMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` sends fail with a transient provider error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn messages_to(&self, phone: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.phone == phone)
            .collect()
    }
}

#[async_trait]
impl MessagingClient for InMemoryMessaging {
    async fn send_text(&self, phone: &str, body: &str) -> Result<String, ServiceError> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ServiceError::ExternalServiceError(
                "messaging provider unavailable".to_string(),
            ));
        }

        let message_id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                message_id: message_id.clone(),
                phone: phone.to_string(),
                body: body.to_string(),
            });
        }
        Ok(message_id)
    }
}

/// Fixed rate card. Tracking numbers are the courier prefix plus a counter.
#[derive(Debug)]
pub struct StaticCourierRates {
    offers: Mutex<Vec<CourierOffer>>,
    next_tracking: AtomicU64,
}

impl StaticCourierRates {
    pub fn new(offers: Vec<CourierOffer>) -> Self {
        Self {
            offers: Mutex::new(offers),
            next_tracking: AtomicU64::new(1),
        }
    }

    /// Three domestic couriers: cheapest is slowest, fastest is dearest.
    pub fn domestic() -> Self {
        Self::new(vec![
            CourierOffer {
                courier: "aramex".into(),
                service_level: "standard".into(),
                rate: dec!(18.00),
                transit_days: 3,
            },
            CourierOffer {
                courier: "smsa".into(),
                service_level: "express".into(),
                rate: dec!(24.50),
                transit_days: 2,
            },
            CourierOffer {
                courier: "naqel".into(),
                service_level: "same_day".into(),
                rate: dec!(35.00),
                transit_days: 1,
            },
        ])
    }

    pub fn set_offers(&self, offers: Vec<CourierOffer>) {
        if let Ok(mut current) = self.offers.lock() {
            *current = offers;
        }
    }
}

#[async_trait]
impl CourierRates for StaticCourierRates {
    async fn quote(
        &self,
        _order: &Order,
        _weight_kg: f64,
    ) -> Result<Vec<CourierOffer>, ServiceError> {
        Ok(self.offers.lock().map(|o| o.clone()).unwrap_or_default())
    }

    async fn create_shipment(
        &self,
        _order: &Order,
        offer: &CourierOffer,
    ) -> Result<String, ServiceError> {
        let prefix: String = offer.courier.chars().take(3).collect::<String>().to_uppercase();
        let seq = self.next_tracking.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}{:08}", prefix, seq))
    }
}

/// Short-code registry backed by a map. Counts lookups so cache behaviour is observable.
#[derive(Debug, Default)]
pub struct InMemoryAddressRegistry {
    entries: DashMap<String, RegistryLookup>,
    lookups: AtomicUsize,
}

impl InMemoryAddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, code: &str, address: Address, coordinates: GeoPoint, confidence: f64) {
        self.entries.insert(
            AddressCacheEntry::normalize_code(code),
            RegistryLookup {
                found: true,
                address: Some(address),
                coordinates: Some(coordinates),
                confidence,
            },
        );
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressRegistry for InMemoryAddressRegistry {
    async fn lookup(&self, short_code: &str) -> Result<RegistryLookup, ServiceError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .entries
            .get(&AddressCacheEntry::normalize_code(short_code))
            .map(|entry| entry.clone())
            .unwrap_or_else(RegistryLookup::not_found))
    }
}

/// Resolves addresses to their own coordinates or, failing that, the city centre.
#[derive(Debug, Clone)]
pub struct CityCentroidGeocoder {
    centroids: HashMap<String, GeoPoint>,
}

impl Default for CityCentroidGeocoder {
    fn default() -> Self {
        let centroids = [
            ("riyadh", GeoPoint::new(24.7136, 46.6753)),
            ("jeddah", GeoPoint::new(21.4858, 39.1925)),
            ("dammam", GeoPoint::new(26.4207, 50.0888)),
            ("mecca", GeoPoint::new(21.3891, 39.8579)),
            ("medina", GeoPoint::new(24.5247, 39.5692)),
            ("khobar", GeoPoint::new(26.2172, 50.1971)),
            ("abha", GeoPoint::new(18.2164, 42.5053)),
        ]
        .into_iter()
        .map(|(city, point)| (city.to_string(), point))
        .collect();
        Self { centroids }
    }
}

#[async_trait]
impl Geocoder for CityCentroidGeocoder {
    async fn geocode(&self, address: &Address) -> Result<GeoPoint, ServiceError> {
        if let Some(point) = address.coordinates {
            return Ok(point);
        }
        self.centroids
            .get(&address.city_key())
            .copied()
            .ok_or_else(|| ServiceError::NotFound(format!("No coordinates for city {}", address.city)))
    }

    async fn distance_matrix(
        &self,
        origins: &[GeoPoint],
        destinations: &[GeoPoint],
    ) -> Result<Vec<Vec<f64>>, ServiceError> {
        Ok(origins
            .iter()
            .map(|o| destinations.iter().map(|d| haversine_km(*o, *d)).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messaging_fails_requested_number_of_times() {
        let messaging = InMemoryMessaging::new();
        messaging.fail_next(1);
        assert!(messaging.send_text("+966501", "hi").await.is_err());
        let id = messaging.send_text("+966501", "hi").await.unwrap();
        assert_eq!(id, "msg-1");
        assert_eq!(messaging.messages_to("+966501").len(), 1);
    }

    #[tokio::test]
    async fn registry_normalises_codes() {
        let registry = InMemoryAddressRegistry::new();
        let address = Address {
            line1: "King Fahd Rd 1200".into(),
            line2: None,
            district: Some("Olaya".into()),
            city: "Riyadh".into(),
            postal_code: Some("12211".into()),
            country: "SA".into(),
            short_code: Some("RRRD2929".into()),
            coordinates: None,
        };
        registry.insert("rrrd2929", address, GeoPoint::new(24.69, 46.68), 0.95);
        let hit = registry.lookup(" RRRD2929 ").await.unwrap();
        assert!(hit.found);
        assert!(!registry.lookup("XXXX0000").await.unwrap().found);
        assert_eq!(registry.lookup_count(), 2);
    }
}
