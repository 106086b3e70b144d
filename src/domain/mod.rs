//! Domain layer - Port definitions for the storage cluster
//!
//! The controller only talks to the cluster through the traits defined here,
//! following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
