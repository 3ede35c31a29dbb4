use std::collections::HashMap;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};

use crate::error::Result;

use super::{Flow, Request};

/// Supplies headers for outgoing requests and for the subscription
/// handshake payload.
///
/// Implemented for closures returning a map:
///
/// ```ignore
/// let source = || HashMap::from([("authorization".to_string(), token())]);
/// ```
pub trait HeaderSource: Send + Sync {
    /// Current headers to attach.
    fn headers(&self) -> HashMap<String, String>;
}

impl<F> HeaderSource for F
where
    F: Fn() -> HashMap<String, String> + Send + Sync,
{
    fn headers(&self) -> HashMap<String, String> {
        self()
    }
}

/// Adds headers from a [`HeaderSource`] without replacing existing ones.
#[derive(Clone)]
pub struct HeaderAugment {
    source: Arc<dyn HeaderSource>,
}

impl std::fmt::Debug for HeaderAugment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderAugment").finish_non_exhaustive()
    }
}

impl HeaderAugment {
    /// Create the step.
    pub fn new(source: Arc<dyn HeaderSource>) -> Self {
        Self { source }
    }

    pub(super) fn process(&self, request: &mut Request) -> Result<Flow> {
        for (name, value) in self.source.headers() {
            let name = HeaderName::try_from(name)?;
            if request.headers.contains_key(&name) {
                continue;
            }
            request.headers.insert(name, HeaderValue::try_from(value)?);
        }
        Ok(Flow::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::operation::Operation;

    fn source(pairs: &[(&str, &str)]) -> Arc<dyn HeaderSource> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(move || map.clone())
    }

    #[test]
    fn test_adds_missing_headers() {
        let step = HeaderAugment::new(source(&[("Authorization", "Bearer t")]));
        let mut request = Request::new(Arc::new(Operation::query("{ a }")), 1);

        step.process(&mut request).unwrap();
        assert_eq!(request.headers["authorization"], "Bearer t");
    }

    #[test]
    fn test_never_overwrites_existing_headers() {
        let step = HeaderAugment::new(source(&[("x-client", "source"), ("x-extra", "1")]));
        let mut request = Request::new(Arc::new(Operation::query("{ a }")), 1);
        request
            .headers
            .insert("x-client", HeaderValue::from_static("caller"));

        step.process(&mut request).unwrap();
        assert_eq!(request.headers["x-client"], "caller");
        assert_eq!(request.headers.get_all("x-client").iter().count(), 1);
        assert_eq!(request.headers["x-extra"], "1");
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let step = HeaderAugment::new(source(&[("bad header", "x")]));
        let mut request = Request::new(Arc::new(Operation::query("{ a }")), 1);
        assert!(matches!(step.process(&mut request), Err(Error::Config(_))));
    }
}
