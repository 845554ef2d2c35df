//! HTTP front end for the payment-gated lock controller.
//!
//! # Modules
//!
//! - [`config`]: environment configuration ([`ControllerConfig`](config::ControllerConfig))
//! - [`bootstrap`]: builds the [`AppState`](state::AppState) from a config
//! - [`routes`]: webhook, status, health, manual close and metrics endpoints
//! - [`error`]: HTTP mapping of core errors

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
