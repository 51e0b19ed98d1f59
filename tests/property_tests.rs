//! Property-based tests for the fulfillment core.
//!
//! Stock conservation, priority scoring and the pure routing and manifest
//! helpers are checked across generated inputs.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use saylogix::clock::ManualClock;
use saylogix::config::{DispatchConfig, OrderPolicyConfig};
use saylogix::entities::{GeoPoint, SkuQuantity};
use saylogix::services::dispatch::{is_past_cutoff, manifest_number};
use saylogix::services::geocoding::{nearest_neighbor_order, path_distance_km};
use saylogix::services::inventory::{AllocationOutcome, InventoryLedger};
use saylogix::services::orders::compute_priority;
use saylogix::store::InMemoryStore;

#[derive(Debug, Clone)]
enum StockOp {
    Allocate(u32),
    Release(u32),
}

fn stock_op_strategy() -> impl Strategy<Value = StockOp> {
    prop_oneof![
        (1u32..20).prop_map(StockOp::Allocate),
        (1u32..20).prop_map(StockOp::Release),
    ]
}

fn value_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..500_000, 0u32..100).prop_map(|(whole, cents)| Decimal::new(whole * 100 + cents as i64, 2))
}

fn point_strategy() -> impl Strategy<Value = GeoPoint> {
    (16.0f64..32.0, 36.0f64..56.0).prop_map(|(lat, lon)| GeoPoint::new(lat, lon))
}

// Property: allocation and release move stock between buckets without creating or losing any
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn allocate_and_release_conserve_stock(
        initial in 0i64..100,
        ops in prop::collection::vec(stock_op_strategy(), 1..30),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).unwrap()));
            let ledger = InventoryLedger::new(Arc::new(InMemoryStore::new()), clock);
            ledger.upsert_sku("SKU-P", "property sku", initial, None).await.unwrap();

            for op in ops {
                let before = ledger.get("SKU-P").await.unwrap().unwrap();
                match op {
                    StockOp::Allocate(qty) => {
                        let outcome = ledger.allocate(&[SkuQuantity::new("SKU-P", qty)]).await.unwrap();
                        let after = ledger.get("SKU-P").await.unwrap().unwrap();
                        match outcome {
                            AllocationOutcome::Allocated(_) => {
                                prop_assert!(before.available_quantity >= qty as i64);
                                prop_assert_eq!(after.reserved_quantity, before.reserved_quantity + qty as i64);
                            }
                            AllocationOutcome::StockShortage(_) => {
                                prop_assert!(before.available_quantity < qty as i64);
                                prop_assert_eq!(after.available_quantity, before.available_quantity);
                            }
                        }
                    }
                    StockOp::Release(qty) => {
                        ledger.release(&[SkuQuantity::new("SKU-P", qty)]).await.unwrap();
                    }
                }
                let after = ledger.get("SKU-P").await.unwrap().unwrap();
                prop_assert_eq!(after.available_quantity + after.reserved_quantity, initial);
                prop_assert!(after.available_quantity >= 0);
                prop_assert!(after.reserved_quantity >= 0);
            }
            Ok(())
        })?;
    }
}

// Property: priority depends only on value and city, and stays within bounds
proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn priority_is_deterministic_and_bounded(
        value in value_strategy(),
        city in prop_oneof!["Riyadh", "riyadh ", "JEDDAH", "Abha", "Tabuk", ""],
    ) {
        let policy = OrderPolicyConfig::default();

        let first = compute_priority(value, &city, &policy);
        let second = compute_priority(value, &city, &policy);

        prop_assert_eq!(first, second);
        prop_assert!(first.priority >= 1 && first.priority <= policy.base_priority);
        prop_assert_eq!(first.high_value, value > policy.high_value_threshold);
    }

    #[test]
    fn higher_value_never_lowers_urgency(value in value_strategy(), extra in value_strategy()) {
        let policy = OrderPolicyConfig::default();

        let base = compute_priority(value, "Dammam", &policy);
        let richer = compute_priority(value + extra, "Dammam", &policy);

        prop_assert!(richer.priority <= base.priority);
    }
}

// Property: stop ordering is a permutation that never beats itself by going longer
proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn nearest_neighbour_visits_every_stop_once(
        origin in point_strategy(),
        points in prop::collection::vec(point_strategy(), 0..12),
    ) {
        let order = nearest_neighbor_order(origin, &points);

        let mut sorted = order.clone();
        sorted.sort_unstable();
        prop_assert_eq!(sorted, (0..points.len()).collect::<Vec<_>>());

        let visited: Vec<GeoPoint> = order.iter().map(|&i| points[i]).collect();
        prop_assert!(path_distance_km(origin, &visited) >= 0.0);
        if let Some(&first) = order.first() {
            let nearest = points
                .iter()
                .map(|p| path_distance_km(origin, &[*p]))
                .fold(f64::MAX, f64::min);
            prop_assert!((path_distance_km(origin, &[points[first]]) - nearest).abs() < 1e-9);
        }
    }
}

// Property: manifest numbering and cutoff evaluation
proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn manifest_numbers_are_stable_and_padded(
        minutes in 0i64..(60 * 24 * 365),
        sequence in 1usize..1000,
    ) {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes);

        let number = manifest_number("aramex", now, 3, sequence);

        prop_assert!(number.starts_with("MNF-ARAMEX-"));
        prop_assert_eq!(number.len(), "MNF-ARAMEX-20260101-001".len());
        let expected_suffix = format!("{:03}", sequence);
        prop_assert!(number.ends_with(&expected_suffix));
        prop_assert_eq!(number, manifest_number("aramex", now, 3, sequence));
    }

    #[test]
    fn once_past_cutoff_the_rest_of_the_local_day_stays_past(minute in 0i64..(60 * 24)) {
        let config = DispatchConfig::default();
        // Local midnight in Riyadh.
        let midnight = Utc.with_ymd_and_hms(2026, 3, 9, 21, 0, 0).unwrap();

        let now = midnight + Duration::minutes(minute);
        let later = now + Duration::minutes(((60 * 24) - 1 - minute).min(30));

        if is_past_cutoff(now, &config) {
            prop_assert!(is_past_cutoff(later, &config));
        }
        prop_assert_eq!(is_past_cutoff(now, &config), minute >= 17 * 60);
    }
}
