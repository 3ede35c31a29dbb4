//! HTTP transport for queries and mutations.

mod fetcher;
mod transport;

pub use fetcher::{HttpClientConfig, HttpFetcher, HttpSettings, RawResponse, ReqwestFetcher};
pub use transport::{HttpTransport, RequestHandle, RequestId};
