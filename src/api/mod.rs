//! HTTP surface: controller operations, health, readiness and metrics

pub mod rest;
pub mod server;

pub use rest::{ApiErrorResponse, ApiState};
pub use server::{admin_router, router, AdminState, ApiServer, ApiServerConfig};
