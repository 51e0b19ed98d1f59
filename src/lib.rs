//! Saylogix fulfillment core
//!
//! Event-driven orchestration of an e-commerce order from ingestion to
//! delivery. Each module reacts to events on a shared [`events::EventBus`]
//! and announces its own results there; none of them calls another directly.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod clock;
pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod integrations;
pub mod metrics;
pub mod retry;
pub mod services;
pub mod store;
pub mod system;

pub use system::{Collaborators, FulfillmentSystem};
