//! Tollgate Kernel Library
//!
//! Dual sliding-window admission control: one limiter keyed by client
//! address, one by verified identity, in front of any axum router.
//! The main entry point for running the server is the `tollgate` binary.

pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod store;
pub mod sweeper;

pub use config::Config;
pub use middleware::protect;
pub use routes::build_router;
pub use state::AppState;
