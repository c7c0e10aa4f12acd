//! Meridian Gateway - HTTP surface and process lifecycle
//!
//! Assembles the subsystems, runs the startup sequence, and serves the
//! inbound API.

pub mod auth;
pub mod metrics;
pub mod routes;
pub mod startup;
pub mod state;

pub use routes::build_app;
pub use startup::{bootstrap, CheckStatus, FleetSpec, StartupReport};
pub use state::AppState;
