//! GraphQL transport for Horizon Lattice.
//!
//! This crate executes GraphQL operations against a remote server:
//!
//! - **Queries and mutations** run over HTTP through an ordered
//!   [interceptor chain](interceptor) with retry, a normalized cache,
//!   header augmentation and automatic persisted queries.
//! - **Subscriptions** share one persistent WebSocket connection speaking
//!   the `graphql-transport-ws` protocol, with reconnection and
//!   re-subscription.
//! - **Certificate pinning** applies to both transports through a single
//!   [`TlsConfig`](tls::TlsConfig).
//!
//! # Example
//!
//! ```ignore
//! use horizon_lattice_graphql::{CachePolicy, GraphQLClient, Operation};
//!
//! let client = GraphQLClient::builder("https://api.example.com/graphql")
//!     .header("X-Client", "films")
//!     .persisted_queries(true)
//!     .build()?;
//!
//! // Served from the cache the second time.
//! let query = Operation::query("query FilmList { allFilms { films { __typename id title } } }");
//! let films = client.execute(query.clone()).await?;
//! let again = client.execute(query).await?;
//!
//! // Bypass the cache for one operation.
//! let fresh = client
//!     .execute(Operation::query("{ viewer { id } }").cache_policy(CachePolicy::NetworkOnly))
//!     .await?;
//! ```
//!
//! # Subscriptions
//!
//! ```ignore
//! let mut added = client.submit(Operation::subscription("subscription { filmAdded { id title } }"));
//! while let Some(result) = added.next().await {
//!     println!("{:?}", result?.data);
//! }
//! ```
//!
//! # Configuration files
//!
//! ```ignore
//! let client = ClientConfig::from_file("graphql.toml")?.builder()?.build()?;
//! ```
//!
//! # Logging
//!
//! Events are emitted with `tracing` under the targets in
//! [`logging::targets`].

pub mod cache;
mod client;
pub mod config;
mod error;
pub mod http;
pub mod interceptor;
pub mod logging;
mod operation;
mod response;
pub mod subscription;
pub mod tls;

pub use error::{Error, ErrorKind, Result};

// Re-export commonly used types at the crate root
pub use cache::CacheStore;
pub use client::{GraphQLClient, GraphQLClientBuilder, OperationHandle, ResultStream};
pub use config::ClientConfig;
pub use interceptor::{CachePolicy, HeaderSource, InterceptorChain, RetryConfig, Step};
pub use operation::{Operation, OperationKind};
pub use response::{
    GraphQLError, GraphQLLocation, GraphQLResponse, GraphQLResult, PathSegment, ResultSource,
};
pub use subscription::{ConnectionState, SubscriptionConfig, SubscriptionStream};
pub use tls::{CertificatePins, CertificateValidator, CertificateVerdict, TlsConfig};
