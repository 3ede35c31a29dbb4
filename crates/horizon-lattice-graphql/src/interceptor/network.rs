use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use crate::error::{Error, Result};
use crate::http::HttpFetcher;
use crate::logging::targets;
use crate::response::GraphQLResponse;

use super::{Flow, Request};

/// Sends the request body through an [`HttpFetcher`].
#[derive(Clone)]
pub struct NetworkFetch {
    fetcher: Arc<dyn HttpFetcher>,
    url: Url,
}

impl std::fmt::Debug for NetworkFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkFetch")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl NetworkFetch {
    /// Create the step for an endpoint.
    pub fn new(fetcher: Arc<dyn HttpFetcher>, url: Url) -> Self {
        Self { fetcher, url }
    }

    /// The endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(super) async fn process(&self, request: &mut Request) -> Result<Flow> {
        let body = Bytes::from(serde_json::to_vec(&request.body())?);

        tracing::debug!(
            target: targets::HTTP,
            url = %self.url,
            operation = request.operation().name().unwrap_or("<anonymous>"),
            attempt = request.attempt(),
            "Sending GraphQL request"
        );

        let response = self.fetcher.fetch(&self.url, &request.headers, body).await?;
        tracing::debug!(
            target: targets::HTTP,
            status = response.status,
            bytes = response.body.len(),
            "Received response"
        );
        request.response = Some(response);
        Ok(Flow::Proceed)
    }
}

/// Terminates the chain on a non-2xx status.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCheck;

impl StatusCheck {
    pub(super) fn process(&self, request: &mut Request) -> Result<Flow> {
        let response = request
            .response
            .as_ref()
            .ok_or_else(|| Error::Parse("No response to check".into()))?;

        if !response.is_success() {
            return Err(Error::Protocol {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(Flow::Proceed)
    }
}

/// Decodes the raw body into a [`GraphQLResponse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Parse;

impl Parse {
    pub(super) fn process(&self, request: &mut Request) -> Result<Flow> {
        let response = request
            .response
            .as_ref()
            .ok_or_else(|| Error::Parse("No response to parse".into()))?;

        request.parsed = Some(GraphQLResponse::from_slice(&response.body)?);
        Ok(Flow::Proceed)
    }
}
