//! GraphQL response types.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};

/// A GraphQL error returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// The error message.
    pub message: String,

    /// Locations in the document where the error occurred.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphQLLocation>,

    /// Path to the field that caused the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,

    /// Additional error metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    /// Create an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }

    /// The `extensions.code` value, if present.
    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref path) = self.path {
            write!(f, " (at ")?;
            for (i, segment) in path.iter().enumerate() {
                if i > 0 {
                    write!(f, ".")?;
                }
                match segment {
                    PathSegment::Field(name) => write!(f, "{}", name)?,
                    PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphQLError {}

/// A location in a GraphQL document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// A segment in an error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A field name.
    Field(String),
    /// An array index.
    Index(usize),
}

/// A GraphQL response as decoded from the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// The data returned by the operation.
    #[serde(default)]
    pub data: Option<Value>,

    /// Errors that occurred during execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,

    /// Additional response metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLResponse {
    /// Decode a response from a raw body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let response: Self = serde_json::from_slice(body)?;
        if response.data.is_none() && response.errors.is_empty() {
            return Err(Error::Parse(
                "Response contains neither data nor errors".into(),
            ));
        }
        Ok(response)
    }

    /// Whether the server reported that a persisted query hash is unknown.
    pub fn is_persisted_query_not_found(&self) -> bool {
        self.errors.iter().any(|e| {
            e.message == "PersistedQueryNotFound" || e.code() == Some("PERSISTED_QUERY_NOT_FOUND")
        })
    }
}

/// Where a [`GraphQLResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    /// Served from the normalized cache without a network call.
    Cache,
    /// Fetched from the server.
    Server,
}

/// The terminal outcome of a successful operation run.
///
/// Server-reported errors accompanying valid data are carried in
/// [`errors`](Self::errors); they are not failures.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQLResult {
    /// The data returned by the operation.
    pub data: Option<Value>,
    /// Partial errors reported by the server.
    pub errors: Vec<GraphQLError>,
    /// Response extensions.
    pub extensions: Option<Value>,
    /// Where this result came from.
    pub source: ResultSource,
}

impl GraphQLResult {
    /// Build a result from a wire response.
    pub fn from_response(response: GraphQLResponse, source: ResultSource) -> Self {
        Self {
            data: response.data,
            errors: response.errors,
            extensions: response.extensions,
            source,
        }
    }

    /// Build a cache-sourced result from resolved data.
    pub fn from_cache(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
            extensions: None,
            source: ResultSource::Cache,
        }
    }

    /// Check if the result contains errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Check if the result has data and no errors.
    pub fn is_success(&self) -> bool {
        self.data.is_some() && self.errors.is_empty()
    }

    /// Get raw data without parsing.
    pub fn raw_data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Parse the data as a specific type.
    ///
    /// Partial errors are ignored; use [`errors`](Self::errors) to inspect them.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            Some(data) => serde_json::from_value(data.clone()).map_err(|e| {
                Error::Parse(format!("Failed to deserialize GraphQL data: {}", e))
            }),
            None if self.has_errors() => Err(Error::GraphQL(self.errors.clone())),
            None => Err(Error::Parse("No data in GraphQL response".into())),
        }
    }

    /// Parse a top-level field from the data.
    ///
    /// ```ignore
    /// // { "data": { "allFilms": { "films": [...] } } }
    /// let films: FilmConnection = result.field("allFilms")?;
    /// ```
    pub fn field<T: DeserializeOwned>(&self, field: &str) -> Result<T> {
        match &self.data {
            Some(Value::Object(data)) => {
                let value = data.get(field).ok_or_else(|| {
                    Error::Parse(format!("Field '{}' not found in response", field))
                })?;
                serde_json::from_value(value.clone()).map_err(|e| {
                    Error::Parse(format!("Failed to deserialize field '{}': {}", field, e))
                })
            }
            Some(_) => Err(Error::Parse("Response data is not an object".into())),
            None if self.has_errors() => Err(Error::GraphQL(self.errors.clone())),
            None => Err(Error::Parse("No data in GraphQL response".into())),
        }
    }
}
