//! HTTP transport via axum.

pub mod routes;
pub mod server;

pub use routes::{API_VERSION, ApiOptions, ApiResponse, routes};
pub use server::{ServerConfig, serve};
