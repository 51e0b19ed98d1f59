use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use futures::future::try_join_all;
use rust_decimal_macros::dec;
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::{info, warn};

use saylogix::clock::{Clock, ManualClock};
use saylogix::config::{self, AppConfig};
use saylogix::entities::{Address, BinLocation, Customer, DeliveryOutcome, GeoPoint, Order};
use saylogix::events::EventCode;
use saylogix::integrations::memory::{
    CityCentroidGeocoder, InMemoryAddressRegistry, InMemoryMessaging, StaticCourierRates,
};
use saylogix::metrics;
use saylogix::services::orders::{NewOrder, NewOrderItem};
use saylogix::services::reports::FulfillmentReport;
use saylogix::services::tracking::TrackingView;
use saylogix::store::InMemoryStore;
use saylogix::{Collaborators, FulfillmentSystem};

#[derive(Parser)]
#[command(name = "saylogix", about = "Saylogix fulfillment pipeline", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs orders from ingestion to delivery against in-memory collaborators.
    Simulate(SimulateArgs),
    /// Lists every event the pipeline can emit.
    Taxonomy,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(long, default_value_t = 3, help = "Number of orders to push through the pipeline")]
    orders: usize,
    #[arg(long, action = ArgAction::SetTrue, help = "Print Prometheus metrics after the run")]
    metrics: bool,
}

#[derive(Serialize)]
struct TaxonomyEntry {
    event_id: &'static str,
    event_type: &'static str,
    owner: String,
}

#[derive(Serialize)]
struct SimulationOutput {
    orders: Vec<TrackingView>,
    report: FulfillmentReport,
}

const SKUS: &[(&str, &str)] = &[
    ("SKU-TSHIRT", "Cotton T-shirt"),
    ("SKU-MUG", "Ceramic mug"),
    ("SKU-CAP", "Baseball cap"),
];

const DESTINATIONS: &[(&str, &str, &str, f64, f64)] = &[
    ("RRRD2929", "King Fahd Rd 1200", "Riyadh", 24.6937, 46.6853),
    ("JEDA3131", "Tahlia St 44", "Jeddah", 21.5433, 39.1728),
    ("RHMA4545", "Olaya St 210", "Riyadh", 24.7050, 46.6800),
];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(&config.log_level, config.log_json);

    match cli.command {
        Commands::Simulate(args) => simulate(config, args, cli.json).await,
        Commands::Taxonomy => taxonomy(cli.json),
    }
}

fn taxonomy(json: bool) -> Result<()> {
    let entries: Vec<TaxonomyEntry> = EventCode::iter()
        .map(|code| TaxonomyEntry {
            event_id: code.event_id(),
            event_type: code.event_type(),
            owner: code.owner().to_string(),
        })
        .collect();
    if json {
        return print_json(&entries);
    }
    for entry in entries {
        println!("{}  {:<40} {}", entry.event_id, entry.event_type, entry.owner);
    }
    Ok(())
}

fn address(line1: &str, city: &str, short_code: Option<&str>) -> Address {
    Address {
        line1: line1.to_string(),
        line2: None,
        district: None,
        city: city.to_string(),
        postal_code: None,
        country: "SA".to_string(),
        short_code: short_code.map(str::to_string),
        coordinates: None,
    }
}

fn sample_order(index: usize) -> NewOrder {
    let (code, line1, city, _, _) = DESTINATIONS[index % DESTINATIONS.len()];
    let (sku, name) = SKUS[index % SKUS.len()];
    NewOrder {
        channel: "salla".to_string(),
        channel_ref: format!("SALLA-{:05}", index + 1),
        customer: Customer {
            name: format!("Customer {}", index + 1),
            phone: format!("+96650{:07}", index + 1),
            email: None,
        },
        shipping_address: address(line1, city, Some(code)),
        billing_address: None,
        currency: "SAR".to_string(),
        items: vec![NewOrderItem {
            sku: sku.to_string(),
            name: name.to_string(),
            quantity: 1 + (index % 2) as u32,
            unit_price: dec!(149.00),
            weight_kg: Some(0.4),
        }],
    }
}

async fn simulate(config: AppConfig, args: SimulateArgs, json: bool) -> Result<()> {
    let start = Utc
        .with_ymd_and_hms(2026, 3, 10, 6, 0, 0)
        .single()
        .ok_or_else(|| anyhow!("invalid simulation start time"))?;
    let clock = Arc::new(ManualClock::new(start));

    let registry = Arc::new(InMemoryAddressRegistry::new());
    for (code, line1, city, lat, lon) in DESTINATIONS {
        registry.insert(code, address(line1, city, Some(*code)), GeoPoint::new(*lat, *lon), 0.95);
    }
    let collaborators = Collaborators {
        messaging: Arc::new(InMemoryMessaging::new()),
        courier_rates: Arc::new(StaticCourierRates::domestic()),
        address_registry: registry,
        geocoder: Arc::new(CityCentroidGeocoder::default()),
    };
    let system = FulfillmentSystem::new(config, Arc::new(InMemoryStore::new()), collaborators, clock.clone());

    for (aisle, (sku, description)) in SKUS.iter().enumerate() {
        let bin = BinLocation::new("A", aisle as u32 + 1, 1, "01");
        system
            .ledger
            .upsert_sku(sku, description, 500, Some(bin.clone()))
            .await
            .with_context(|| format!("failed to seed {}", sku))?;
        system.warehouse.add_bin(bin, 1_000).await?;
    }
    system.last_mile.register_driver("Faisal", "+966551000001").await?;
    system.last_mile.register_driver("Omar", "+966551000002").await?;

    let ingested: Vec<Order> = try_join_all((0..args.orders).map(|i| system.orders.ingest_order(sample_order(i))))
        .await
        .context("failed to ingest orders")?;
    info!(orders = ingested.len(), "orders ingested");

    clock.advance(Duration::minutes(45));
    for order in &ingested {
        fulfil_in_warehouse(&system, order).await?;
    }

    // Past the 17:00 local cutoff every staged order is manifested.
    let cutoff = start.date_naive().and_hms_opt(14, 5, 0).map(|t| Utc.from_utc_datetime(&t));
    clock.set(cutoff.ok_or_else(|| anyhow!("invalid cutoff time"))?);
    system.dispatch.run_cutoff_sweep().await?;

    let mut couriers: Vec<String> = ingested
        .iter()
        .filter_map(|o| o.courier_name().map(str::to_string))
        .collect();
    couriers.sort();
    couriers.dedup();
    let mut manifests = Vec::new();
    for courier in &couriers {
        manifests.extend(system.dispatch.manifests_for(courier).await?);
    }
    for manifest in &manifests {
        for member in &manifest.members {
            system
                .dispatch
                .scan_package(manifest.id, &member.tracking_number)
                .await
                .with_context(|| format!("scan of {} failed", member.saylogix_number))?;
        }
    }

    clock.advance(Duration::hours(16));
    for manifest in &manifests {
        for route in system.last_mile.routes_for_manifest(manifest.id).await? {
            if route.driver_id.is_none() {
                warn!(route = %route.route_number, "no driver for route, left planned");
                continue;
            }
            let route = system.last_mile.start_route(route.id).await?;
            for stop in &route.stops {
                clock.advance(Duration::minutes(25));
                system
                    .last_mile
                    .record_delivery(
                        route.id,
                        stop.order_id,
                        DeliveryOutcome::Delivered {
                            recipient_name: format!("Recipient of {}", stop.saylogix_number),
                            location: stop.address.coordinates.unwrap_or(GeoPoint::new(24.7136, 46.6753)),
                            photo_url: None,
                        },
                    )
                    .await?;
            }
        }
    }

    let mut views = Vec::with_capacity(ingested.len());
    for order in &ingested {
        views.push(system.tracking.track(order.id).await?);
    }
    let report = system.reports.fulfillment_report().await?;

    if json {
        print_json(&SimulationOutput { orders: views, report })?;
    } else {
        for view in &views {
            render_view(view);
        }
        render_report(&report);
    }
    if args.metrics {
        println!("{}", metrics::render());
    }
    info!(at = %clock.now(), "simulation finished");
    Ok(())
}

async fn fulfil_in_warehouse(system: &FulfillmentSystem, order: &Order) -> Result<()> {
    let pick = system
        .warehouse
        .picking_task_for(order.id)
        .await?
        .ok_or_else(|| anyhow!("order {} was not released to the warehouse", order.saylogix_number))?;
    system.warehouse.assign_picker(pick.id, "picker-1").await?;
    system.warehouse.start_picking(pick.id).await?;
    for line in &pick.lines {
        system.warehouse.scan_pick(pick.id, &line.sku, line.requested_quantity).await?;
    }

    let pack = system
        .warehouse
        .packing_task_for(order.id)
        .await?
        .ok_or_else(|| anyhow!("order {} has no packing task", order.saylogix_number))?;
    system.warehouse.assign_packer(pack.id, "packer-1").await?;
    system.warehouse.start_packing(pack.id).await?;
    for line in &pack.lines {
        system.warehouse.scan_pack(pack.id, &line.sku, line.requested_quantity).await?;
    }
    let label = format!("LBL-{}", order.saylogix_number);
    system.warehouse.capture_label(pack.id, 0.8, &label).await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_view(view: &TrackingView) {
    println!(
        "- Order {} • status {} • courier {} • tracking {}",
        view.saylogix_number,
        view.status,
        view.courier.as_deref().unwrap_or("-"),
        view.tracking_number.as_deref().unwrap_or("-"),
    );
    for entry in &view.timeline {
        println!(
            "    {:>4} {} {:<36} {}",
            entry.sequence,
            entry.event_id,
            entry.event_type,
            entry.timestamp.format("%H:%M")
        );
    }
}

fn render_report(report: &FulfillmentReport) {
    println!("Orders: {}", report.status.total_orders);
    for (status, count) in report.status.orders_by_status.iter().filter(|(_, c)| **c > 0) {
        println!("  {:<20} {}", status, count);
    }
    println!("Stage durations (minutes):");
    for stage in report.stage_durations.iter().filter(|s| s.samples > 0) {
        println!("  {:<14} {:>8.1} over {} orders", stage.stage, stage.average_minutes, stage.samples);
    }
    if !report.exceptions.open_by_category.is_empty() {
        println!("Open exceptions: {:?}", report.exceptions.open_by_category);
    }
}
