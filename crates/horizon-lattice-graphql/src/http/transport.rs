//! Callback-based execution of queries and mutations.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::interceptor::InterceptorChain;
use crate::logging::targets;
use crate::operation::Operation;
use crate::response::GraphQLResult;

/// Unique identifier for an in-flight request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A handle to a pending request that can be cancelled.
#[derive(Clone)]
pub struct RequestHandle {
    /// The unique ID of this request.
    pub id: RequestId,
    cancel_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl RequestHandle {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = Self {
            id: RequestId::new(),
            cancel_tx: Arc::new(Mutex::new(Some(cancel_tx))),
        };
        (handle, cancel_rx)
    }

    /// Cancel the pending request.
    ///
    /// Returns `true` if the request was still pending. Once this returns
    /// `true` the completion callback will not run.
    pub fn cancel(&self) -> bool {
        if let Some(tx) = self.cancel_tx.lock().take() {
            let _ = tx.send(());
            true
        } else {
            false
        }
    }

    /// Check if the request is still pending.
    pub fn is_pending(&self) -> bool {
        self.cancel_tx.lock().is_some()
    }

    /// Claim completion; fails if the request was cancelled first.
    fn complete(&self) -> bool {
        self.cancel_tx.lock().take().is_some()
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Executes queries and mutations through an [`InterceptorChain`].
///
/// Cheaply cloneable; clones share the chain.
///
/// # Example
///
/// ```ignore
/// let handle = transport.execute(Operation::query("{ films { id } }"), |result| {
///     match result {
///         Ok(result) => println!("{:?}", result.data),
///         Err(err) => eprintln!("failed: {err}"),
///     }
/// });
///
/// // The callback never runs after a successful cancel.
/// handle.cancel();
/// ```
#[derive(Clone, Debug)]
pub struct HttpTransport {
    chain: Arc<InterceptorChain>,
}

impl HttpTransport {
    /// Create a transport over a chain.
    pub fn new(chain: InterceptorChain) -> Self {
        Self {
            chain: Arc::new(chain),
        }
    }

    /// The interceptor chain.
    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// Run `operation` through the chain and await its outcome.
    pub async fn send(&self, operation: impl Into<Arc<Operation>>) -> Result<GraphQLResult> {
        self.chain.run(operation.into()).await
    }

    /// Run `operation` on the tokio runtime and deliver the outcome to
    /// `callback` exactly once, unless the returned handle is cancelled
    /// first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute<F>(&self, operation: impl Into<Arc<Operation>>, callback: F) -> RequestHandle
    where
        F: FnOnce(Result<GraphQLResult>) + Send + 'static,
    {
        let operation = operation.into();
        let (handle, cancel_rx) = RequestHandle::new();
        let task_handle = handle.clone();
        let chain = self.chain.clone();

        tokio::spawn(async move {
            let id = task_handle.id;
            tokio::select! {
                result = chain.run(operation) => {
                    if task_handle.complete() {
                        callback(result);
                    } else {
                        tracing::debug!(target: targets::HTTP, ?id, "Dropping result of cancelled request");
                    }
                }
                Ok(()) = cancel_rx => {
                    tracing::debug!(target: targets::HTTP, ?id, "Request cancelled");
                }
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{Flow, Step};
    use crate::response::{GraphQLResponse, ResultSource};
    use serde_json::json;
    use std::time::Duration;

    fn immediate() -> HttpTransport {
        HttpTransport::new(InterceptorChain::new(vec![Step::custom("answer", |_| {
            Ok(Flow::Finish(GraphQLResult::from_response(
                GraphQLResponse {
                    data: Some(json!({"answer": 42})),
                    ..Default::default()
                },
                ResultSource::Server,
            )))
        })]))
    }

    #[tokio::test]
    async fn test_execute_invokes_callback_once() {
        let (tx, rx) = oneshot::channel();
        let handle = immediate().execute(Operation::query("{ answer }"), move |result| {
            let _ = tx.send(result);
        });

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.data, Some(json!({"answer": 42})));
        assert!(!handle.is_pending());
        assert!(!handle.cancel());
    }

    #[tokio::test]
    async fn test_cancelled_request_never_calls_back() {
        let transport = HttpTransport::new(InterceptorChain::new(vec![
            Step::RetryGuard(crate::interceptor::RetryGuard::new(
                crate::interceptor::RetryConfig {
                    max_retries: 100,
                    initial_delay_ms: 50,
                    max_delay_ms: 50,
                    backoff_multiplier: 1.0,
                },
            )),
            Step::custom("down", |_| Err(crate::Error::transport("unreachable"))),
        ]));

        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let handle = transport.execute(Operation::query("{ a }"), move |_| {
            *flag.lock() = true;
        });

        assert!(handle.is_pending());
        assert!(handle.cancel());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!*called.lock());
        assert!(!handle.cancel());
    }

    #[tokio::test]
    async fn test_send() {
        let result = immediate().send(Operation::query("{ answer }")).await.unwrap();
        assert!(result.is_success());
    }
}
