//! Standalone server for the OctoFHIR authentication flows.
//!
//! Loads [`AppConfig`], wires [`octofhir_authflow::AuthFlowServices`] with
//! in-memory stores and serves the flow router next to `/healthz`.

pub mod config;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use server::{app, build_app, build_services, run};
