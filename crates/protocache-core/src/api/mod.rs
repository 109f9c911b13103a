//! Transport layer for the rental back office REST API.
//!
//! The coordinator talks to the back office only through the
//! `ProtocolSource` trait; `ApiClient` is its HTTP implementation using
//! bearer token authentication.

pub mod client;
pub mod error;
pub mod source;

pub use client::ApiClient;
pub use error::ApiError;
pub use source::ProtocolSource;
