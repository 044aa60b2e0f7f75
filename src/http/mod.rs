//! HTTP value types and the network capability.

mod client;
mod types;

pub use client::{resolve_url, Fetcher, HttpFetcher};
pub use types::{BodyEncoding, Method, Request, Response};
