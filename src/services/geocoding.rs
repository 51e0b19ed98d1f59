use std::sync::Arc;

use tracing::{debug, instrument};

use crate::entities::{Address, GeoPoint};
use crate::errors::ServiceError;
use crate::integrations::Geocoder;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    haversine_km(a, b) * 1000.0
}

/// Length of the path that starts at `origin` and visits `points` in order.
pub fn path_distance_km(origin: GeoPoint, points: &[GeoPoint]) -> f64 {
    let mut total = 0.0;
    let mut current = origin;
    for point in points {
        total += haversine_km(current, *point);
        current = *point;
    }
    total
}

/// Greedy nearest-neighbour visiting order, as indices into `points`.
/// Ties keep the earlier point.
pub fn nearest_neighbor_order(origin: GeoPoint, points: &[GeoPoint]) -> Vec<usize> {
    let mut remaining: Vec<usize> = (0..points.len()).collect();
    let mut order = Vec::with_capacity(points.len());
    let mut current = origin;

    while !remaining.is_empty() {
        let mut best = 0;
        let mut best_distance = f64::MAX;
        for (slot, &index) in remaining.iter().enumerate() {
            let distance = haversine_km(current, points[index]);
            if distance < best_distance {
                best = slot;
                best_distance = distance;
            }
        }
        let index = remaining.remove(best);
        current = points[index];
        order.push(index);
    }
    order
}

/// A proposed visiting order for a set of addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct StopOrdering {
    /// Indices into the input slice, in visiting order.
    pub order: Vec<usize>,
    pub current_distance_km: f64,
    pub proposed_distance_km: f64,
}

/// Resolves addresses through a [`Geocoder`] and computes distances between them.
pub struct GeocodingService {
    geocoder: Arc<dyn Geocoder>,
}

impl GeocodingService {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { geocoder }
    }

    pub async fn geocode_address(&self, address: &Address) -> Result<GeoPoint, ServiceError> {
        self.geocoder.geocode(address).await
    }

    pub async fn calculate_distance(
        &self,
        from: &Address,
        to: &Address,
    ) -> Result<f64, ServiceError> {
        let from = self.geocoder.geocode(from).await?;
        let to = self.geocoder.geocode(to).await?;
        Ok(haversine_km(from, to))
    }

    /// Nearest-neighbour ordering of `stops` starting from `origin`.
    #[instrument(skip(self, stops), fields(stops = stops.len()))]
    pub async fn order_stops(
        &self,
        origin: GeoPoint,
        stops: &[Address],
    ) -> Result<StopOrdering, ServiceError> {
        let mut points = Vec::with_capacity(stops.len());
        for address in stops {
            points.push(self.geocoder.geocode(address).await?);
        }

        let order = nearest_neighbor_order(origin, &points);
        let proposed: Vec<GeoPoint> = order.iter().map(|&i| points[i]).collect();
        let ordering = StopOrdering {
            current_distance_km: path_distance_km(origin, &points),
            proposed_distance_km: path_distance_km(origin, &proposed),
            order,
        };
        debug!(
            current_km = ordering.current_distance_km,
            proposed_km = ordering.proposed_distance_km,
            "stop ordering computed"
        );
        Ok(ordering)
    }
}
