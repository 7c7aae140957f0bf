//! Remote transport abstraction for SyncedDB.
//!
//! The engine talks to its server through [`RemoteTransport`]. Available
//! transports:
//! - HTTP (reqwest)
//! - Mock (scripted, for tests)

pub mod http;
pub mod mock;
pub mod transport;

pub use http::HttpTransport;
pub use mock::MockTransport;
pub use transport::{Method, RemoteRequest, RemoteResponse, RemoteTransport};
