//! # courier-server
//!
//! A Courier node: configuration, client session pump, HTTP endpoints,
//! cluster listener and metrics around a [`tenvis_courier_core::Hub`].

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod pump;

pub use auth::{AuthError, Authenticator, TokenAuthenticator};
pub use config::Config;
pub use handlers::{build_hub, router, run_server, serve, AppState};
