//! Control Plane Module
//!
//! The pool service and the surfaces around it: server-group and
//! revocation adapters, the REST API and its client.

pub mod service;
pub mod api;
pub mod backends;

pub use service::*;
pub use api::*;
pub use backends::*;
