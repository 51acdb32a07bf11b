//! Per-session LISTEN/NOTIFY dispatch.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;

/// An asynchronous notification received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    /// Channel the notification was sent on.
    pub channel: String,
    /// Payload string, empty when NOTIFY was issued without one.
    pub payload: String,
    /// PID of the notifying backend.
    pub backend_pid: i32,
}

/// Channel-name to subscriber mapping for one session.
///
/// Registrations come from the facade before the matching LISTEN statement
/// is submitted, so the mapping is visible before the server can send
/// anything on that channel. Dispatch happens on the consumer task only.
/// Notifications are not backpressured; subscribers must keep up or buffer.
pub(crate) struct NotificationHub {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<Result<NotifyMessage, Error>>>>,
}

impl NotificationHub {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Whether any channel has a subscriber. Used to skip polling entirely.
    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Attach a subscriber to `channel`, replacing any previous one.
    pub(crate) fn register(&self, channel: &str) -> NotifyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(channel.to_string(), tx);
        NotifyStream { rx, done: false }
    }

    /// Detach `channel`, delivering `err` as the subscriber's terminal event.
    pub(crate) fn fail(&self, channel: &str, err: Error) {
        if let Some(tx) = self.listeners.lock().remove(channel) {
            let _ = tx.send(Err(err));
        }
    }

    /// Route one notification to its channel's subscriber. Notifications for
    /// unknown channels are logged and dropped, never raised as errors.
    pub(crate) fn dispatch(&self, message: NotifyMessage) {
        let mut listeners = self.listeners.lock();
        match listeners.get(&message.channel) {
            None => {
                warn!(channel = %message.channel, "notification for unknown channel");
            }
            Some(tx) => {
                debug!(channel = %message.channel, "got notification");
                if tx.send(Ok(message.clone())).is_err() {
                    debug!(channel = %message.channel, "subscriber gone, removing listener");
                    listeners.remove(&message.channel);
                }
            }
        }
    }
}

/// Stream of notifications for one channel. Ends with an `Err` item if the
/// LISTEN submission fails, and yields indefinitely otherwise.
pub struct NotifyStream {
    rx: mpsc::UnboundedReceiver<Result<NotifyMessage, Error>>,
    done: bool,
}

impl Stream for NotifyStream {
    type Item = Result<NotifyMessage, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let item = std::task::ready!(self.rx.poll_recv(cx));
        if matches!(item, Some(Err(_)) | None) {
            self.done = true;
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn message(channel: &str, payload: &str) -> NotifyMessage {
        NotifyMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
            backend_pid: 99,
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_registered_subscriber() {
        let hub = NotificationHub::new();
        let mut stream = hub.register("events");

        hub.dispatch(message("events", "hello"));

        let got = stream.next().await.unwrap().unwrap();
        assert_eq!(got.channel, "events");
        assert_eq!(got.payload, "hello");
    }

    #[tokio::test]
    async fn unknown_channel_is_dropped() {
        let hub = NotificationHub::new();
        let mut stream = hub.register("events");

        hub.dispatch(message("other", "lost"));
        hub.dispatch(message("events", "kept"));

        assert_eq!(stream.next().await.unwrap().unwrap().payload, "kept");
    }

    #[tokio::test]
    async fn fail_tears_down_with_error() {
        let hub = NotificationHub::new();
        let mut stream = hub.register("events");

        hub.fail("events", Error::SessionClosed);

        assert!(matches!(stream.next().await, Some(Err(Error::SessionClosed))));
        assert!(stream.next().await.is_none());
        assert!(hub.is_empty());
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let hub = NotificationHub::new();
        let stream = hub.register("events");
        drop(stream);

        hub.dispatch(message("events", "nobody home"));
        assert!(hub.is_empty());
    }

    #[test]
    fn empty_hub_short_circuits() {
        let hub = NotificationHub::new();
        assert!(hub.is_empty());
        hub.register("c");
        assert!(!hub.is_empty());
    }
}
