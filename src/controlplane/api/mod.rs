//! API Module
//!
//! REST surface of the pool service: pool lifecycle, membership, eviction,
//! health and metrics, plus the HTTP client the command line uses.

pub mod client;
pub mod server;
pub mod rest;

pub use client::*;
pub use server::*;
pub use rest::*;
