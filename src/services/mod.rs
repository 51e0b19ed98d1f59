// Shared order lifecycle rules
pub mod order_status;

// Stock ledger and outbound messaging
pub mod inventory;
pub mod notifications;

// Orchestration modules
pub mod address_verification;
pub mod dispatch;
pub mod last_mile;
pub mod orders;
pub mod warehouse;

// Read models
pub mod reports;
pub mod tracking;

// External Services
pub mod geocoding;
