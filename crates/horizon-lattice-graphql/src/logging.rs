//! Tracing targets used by the GraphQL transport.
//!
//! The crate emits events through `tracing` and never installs a
//! subscriber. Filter by subsystem with the targets below:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_lattice_graphql::subscription=debug")
//!     .init();
//! ```

/// Target names for log filtering.
pub mod targets {
    /// Interceptor chain execution.
    pub const CHAIN: &str = "horizon_lattice_graphql::chain";
    /// HTTP transport and fetcher.
    pub const HTTP: &str = "horizon_lattice_graphql::http";
    /// WebSocket subscription transport.
    pub const SUBSCRIPTION: &str = "horizon_lattice_graphql::subscription";
    /// Normalized cache.
    pub const CACHE: &str = "horizon_lattice_graphql::cache";
    /// Certificate validation.
    pub const TLS: &str = "horizon_lattice_graphql::tls";
    /// Transport router.
    pub const CLIENT: &str = "horizon_lattice_graphql::client";
}
