use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::response::GraphQLResult;

use super::connection::Command;

/// Identifies one caller-side subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub(crate) u64);

/// Cancels a subscription without owning its stream.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    commands: mpsc::UnboundedSender<Command>,
}

impl SubscriptionHandle {
    /// The subscription's identifier.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Stop the subscription. Its stream ends; other subscriptions on the
    /// same connection are unaffected.
    pub fn unsubscribe(&self) {
        let _ = self.commands.send(Command::Unsubscribe { subscriber: self.id });
    }
}

/// Results of one subscription.
///
/// Yields a result per server message. Ends when the server completes
/// the operation, after a terminal error, or after unsubscribing.
/// Dropping the stream unsubscribes.
pub struct SubscriptionStream {
    id: SubscriberId,
    receiver: mpsc::UnboundedReceiver<Result<GraphQLResult>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl SubscriptionStream {
    pub(crate) fn new(
        id: SubscriberId,
        receiver: mpsc::UnboundedReceiver<Result<GraphQLResult>>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            receiver,
            commands: Some(commands),
        }
    }

    /// The subscription's identifier.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receive the next result.
    pub async fn next(&mut self) -> Option<Result<GraphQLResult>> {
        self.receiver.recv().await
    }

    /// A handle that can stop this subscription from elsewhere.
    pub fn handle(&self) -> Option<SubscriptionHandle> {
        self.commands.as_ref().map(|commands| SubscriptionHandle {
            id: self.id,
            commands: commands.clone(),
        })
    }

    /// Stop the subscription. Results already queued are discarded.
    pub fn unsubscribe(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Unsubscribe { subscriber: self.id });
        }
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<GraphQLResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Unsubscribe { subscriber: self.id });
        }
    }
}

impl std::fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("id", &self.id)
            .field("active", &self.commands.is_some())
            .finish()
    }
}
