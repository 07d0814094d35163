pub mod allocator;
pub mod authentication;
pub mod cancellation;
pub mod closer;
pub mod configuration;
pub mod domain;
pub mod errors;
pub mod guests;
pub mod ledger;
pub mod lifecycle;
pub mod notifier;
pub mod outbox;
pub mod promotion;
pub mod queue;
pub mod registrations;
pub mod routes;
pub mod session_state;
pub mod startup;
pub mod telemetry;
pub mod tx;
pub mod utils;
