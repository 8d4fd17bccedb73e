//! Network plumbing for the offline layer.
//!
//! - `Transport`: the seam every outgoing request goes through
//! - `HttpClient`: reqwest-backed transport talking to the platform API
//! - `FetchInterceptor`: per-request strategy dispatch (network-first,
//!   cache-first, stale-while-revalidate)

pub mod client;
pub mod error;
pub mod interceptor;
pub mod types;

pub use client::{HttpClient, Transport};
pub use interceptor::FetchInterceptor;
pub use types::{FetchRequest, HttpResponse, RequestKey};
