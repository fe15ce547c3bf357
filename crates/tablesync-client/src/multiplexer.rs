//! Request correlation and push routing for one connection.
//!
//! Every outbound request gets a fresh correlation id and a oneshot that
//! the reader task resolves when the matching response arrives. Update
//! pushes are routed by subscription id to the listener that asked for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tablesync_protocol::{Frame, PortId, Reply, Row, SubscriptionId, UpdateMode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::ClientError;

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub reply: Reply,
    /// Binary attachment, empty if none.
    pub binary: Bytes,
}

/// An update delivered to a view listener.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    /// Subscription (listener) the event was delivered to.
    pub subscription_id: SubscriptionId,
    /// Port the update was applied on.
    pub port_id: PortId,
    pub mode: UpdateMode,
    /// Row delta, in [`UpdateMode::Row`].
    pub rows: Option<Vec<Row>>,
    /// Columnar delta, in [`UpdateMode::Columnar`]; empty otherwise.
    pub data: Bytes,
}

/// Sending side of a listener's update channel.
#[derive(Debug, Clone)]
pub struct UpdateRoute {
    tx: mpsc::UnboundedSender<UpdateEvent>,
    active: Arc<AtomicBool>,
}

/// Receiving side of a listener's update channel.
///
/// Yields nothing once the subscription is removed or the connection is
/// torn down, even if events were still queued.
#[derive(Debug)]
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<UpdateEvent>,
    active: Arc<AtomicBool>,
}

impl UpdateRoute {
    /// Create a connected route and stream.
    #[must_use]
    pub fn channel() -> (UpdateRoute, UpdateStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        (
            UpdateRoute {
                tx,
                active: Arc::clone(&active),
            },
            UpdateStream { rx, active },
        )
    }

    fn deliver(&self, event: UpdateEvent) -> bool {
        self.active.load(Ordering::SeqCst) && self.tx.send(event).is_ok()
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl UpdateStream {
    /// Next event, or `None` once the listener is gone.
    pub async fn next(&mut self) -> Option<UpdateEvent> {
        let event = self.rx.recv().await?;
        self.is_active().then_some(event)
    }

    /// Next event if one is already queued.
    pub fn try_next(&mut self) -> Option<UpdateEvent> {
        let event = self.rx.try_recv().ok()?;
        self.is_active().then_some(event)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

type ResponseSender = oneshot::Sender<Result<Response, ClientError>>;

/// Receives the outcome of one request.
pub type ResponseReceiver = oneshot::Receiver<Result<Response, ClientError>>;

struct Pending {
    tx: ResponseSender,
    /// Registered the moment a subscription response arrives, so a push
    /// right behind it is not lost.
    route: Option<UpdateRoute>,
}

#[derive(Default)]
struct MuxState {
    closed: bool,
    pending: HashMap<u64, Pending>,
    subscriptions: HashMap<SubscriptionId, UpdateRoute>,
}

/// What [`Multiplexer::on_frame`] did with a frame.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Resolved a pending request.
    Resolved(u64),
    /// Delivered a push to a listener.
    Pushed(SubscriptionId),
    /// A push for a subscription that no longer exists.
    Dropped(SubscriptionId),
    /// The server ended a subscription; its listener was removed.
    Closed(SubscriptionId),
    /// A response nobody was waiting for.
    Violation(u64),
    /// Not a response or push; left to the caller.
    Unhandled(Frame),
}

/// Per-connection request and subscription tables.
pub struct Multiplexer {
    next_id: AtomicU64,
    state: Mutex<MuxState>,
}

impl Multiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(MuxState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a correlation id and record a pending request.
    ///
    /// `route` is registered as a subscription when the response carries a
    /// subscription id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] after disconnect.
    pub fn register_pending(
        &self,
        route: Option<UpdateRoute>,
    ) -> Result<(u64, ResponseReceiver), ClientError> {
        let mut state = self.state();
        if state.closed {
            return Err(ClientError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, Pending { tx, route });
        Ok((id, rx))
    }

    /// Forget a pending request whose frame could not be sent.
    pub fn cancel_pending(&self, id: u64) {
        self.state().pending.remove(&id);
    }

    /// Route an inbound frame.
    pub fn on_frame(&self, frame: Frame) -> Routed {
        match frame {
            Frame::Response { id, reply, binary } => {
                let mut state = self.state();
                let Some(pending) = state.pending.remove(&id) else {
                    warn!(id, "Response for unknown request, dropped");
                    return Routed::Violation(id);
                };

                if let (Reply::Subscription { subscription_id }, Some(route)) =
                    (&reply, pending.route)
                {
                    state.subscriptions.insert(*subscription_id, route);
                }
                drop(state);

                let response = Response {
                    reply,
                    binary: binary.into_bytes(),
                };
                // The caller may have given up waiting; that is fine.
                let _ = pending.tx.send(Ok(response));
                trace!(id, "Resolved request");
                Routed::Resolved(id)
            }

            Frame::Error { id, code, message } => {
                let Some(pending) = self.state().pending.remove(&id) else {
                    warn!(id, code = ?code, message = %message, "Error for unknown request, dropped");
                    return Routed::Violation(id);
                };

                debug!(id, code = ?code, "Request failed");
                let _ = pending.tx.send(Err(ClientError::Remote { code, message }));
                Routed::Resolved(id)
            }

            Frame::Update {
                subscription_id,
                port_id,
                mode,
                rows,
                binary,
            } => {
                let route = self.state().subscriptions.get(&subscription_id).cloned();
                let event = UpdateEvent {
                    subscription_id,
                    port_id,
                    mode,
                    rows,
                    data: binary.into_bytes(),
                };

                match route {
                    Some(route) if route.deliver(event) => Routed::Pushed(subscription_id),
                    _ => {
                        trace!(subscription = subscription_id, "Push for unknown subscription, dropped");
                        Routed::Dropped(subscription_id)
                    }
                }
            }

            Frame::SubscriptionClosed { subscription_id } => {
                if self.unregister_subscription(subscription_id) {
                    debug!(subscription = subscription_id, "Subscription closed by server");
                    Routed::Closed(subscription_id)
                } else {
                    Routed::Dropped(subscription_id)
                }
            }

            other => Routed::Unhandled(other),
        }
    }

    /// Route pushes for `id` to `route`.
    pub fn register_subscription(&self, id: SubscriptionId, route: UpdateRoute) {
        self.state().subscriptions.insert(id, route);
    }

    /// Stop routing pushes for `id`. Queued events are discarded.
    pub fn unregister_subscription(&self, id: SubscriptionId) -> bool {
        match self.state().subscriptions.remove(&id) {
            Some(route) => {
                route.deactivate();
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with [`ClientError::ConnectionClosed`] and
    /// drop every subscription. Returns how many requests were failed.
    pub fn on_disconnect(&self) -> usize {
        let (pending, subscriptions) = {
            let mut state = self.state();
            state.closed = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.subscriptions),
            )
        };

        for route in subscriptions.values() {
            route.deactivate();
        }

        let failed = pending.len();
        for (_, pending) in pending {
            if let Some(route) = &pending.route {
                route.deactivate();
            }
            let _ = pending.tx.send(Err(ClientError::ConnectionClosed));
        }

        debug!(
            failed,
            subscriptions = subscriptions.len(),
            "Multiplexer disconnected"
        );
        failed
    }

    /// Whether pushes for `id` still reach a listener.
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.state().subscriptions.contains_key(&id)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::ErrorCode;

    #[tokio::test]
    async fn test_response_resolves_matching_request() {
        let mux = Multiplexer::new();
        let (first, rx1) = mux.register_pending(None).unwrap();
        let (second, rx2) = mux.register_pending(None).unwrap();
        assert!(second > first);

        assert_eq!(
            mux.on_frame(Frame::response(second, Reply::Ok)),
            Routed::Resolved(second)
        );
        assert_eq!(rx2.await.unwrap().unwrap().reply, Reply::Ok);
        assert_eq!(mux.pending_count(), 1);

        mux.on_frame(Frame::error(first, ErrorCode::NotFound, "gone"));
        let err = rx1.await.unwrap().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "gone");
    }

    #[test]
    fn test_unknown_and_repeated_responses_are_dropped() {
        let mux = Multiplexer::new();
        let (id, _rx) = mux.register_pending(None).unwrap();

        assert_eq!(mux.on_frame(Frame::response(id, Reply::Ok)), Routed::Resolved(id));
        assert_eq!(mux.on_frame(Frame::response(id, Reply::Ok)), Routed::Violation(id));
        assert_eq!(mux.on_frame(Frame::response(99, Reply::Ok)), Routed::Violation(99));
    }

    #[test]
    fn test_subscription_registered_with_its_response() {
        let mux = Multiplexer::new();
        let (route, mut stream) = UpdateRoute::channel();
        let (id, _rx) = mux.register_pending(Some(route)).unwrap();

        mux.on_frame(Frame::response(id, Reply::Subscription { subscription_id: 4 }));
        assert_eq!(mux.on_frame(Frame::notify(4, 2)), Routed::Pushed(4));

        let event = stream.try_next().unwrap();
        assert_eq!(event.port_id, 2);
        assert_eq!(event.mode, UpdateMode::Notify);
    }

    #[test]
    fn test_push_after_unregister_is_dropped() {
        let mux = Multiplexer::new();
        let (route, mut stream) = UpdateRoute::channel();
        mux.register_subscription(1, route);

        mux.on_frame(Frame::notify(1, 0));
        assert!(mux.unregister_subscription(1));
        assert_eq!(mux.on_frame(Frame::notify(1, 0)), Routed::Dropped(1));

        // The event queued before removal is not handed out either.
        assert!(stream.try_next().is_none());
        assert!(!mux.unregister_subscription(1));
    }

    #[tokio::test]
    async fn test_server_closed_subscription_ends_stream() {
        let mux = Multiplexer::new();
        let (route, mut stream) = UpdateRoute::channel();
        mux.register_subscription(5, route);
        assert_eq!(mux.on_frame(Frame::notify(5, 0)), Routed::Pushed(5));

        assert_eq!(mux.on_frame(Frame::subscription_closed(5)), Routed::Closed(5));
        assert!(!mux.is_subscribed(5));
        assert!(!stream.is_active());
        assert_eq!(stream.next().await, None);

        assert_eq!(mux.on_frame(Frame::subscription_closed(5)), Routed::Dropped(5));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_everything() {
        let mux = Multiplexer::new();
        let (_, rx1) = mux.register_pending(None).unwrap();
        let (_, rx2) = mux.register_pending(None).unwrap();
        let (route, mut stream) = UpdateRoute::channel();
        mux.register_subscription(1, route);

        assert_eq!(mux.on_disconnect(), 2);
        assert!(matches!(rx1.await.unwrap(), Err(ClientError::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::ConnectionClosed)));
        assert!(stream.next().await.is_none());
        assert_eq!(mux.subscription_count(), 0);

        assert!(matches!(
            mux.register_pending(None),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_other_frames_are_left_to_caller() {
        let mux = Multiplexer::new();
        let frame = Frame::pong(Some(1));
        assert_eq!(mux.on_frame(frame.clone()), Routed::Unhandled(frame));
    }
}
