//! Remote API access
//!
//! - `client`: authenticated requests with retry
//! - `transport`: the HTTP seam and its reqwest implementation
//! - `types`: request/response bodies

pub mod client;
pub mod transport;
pub mod types;

pub use client::{ApiClient, Credentials, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use types::*;
