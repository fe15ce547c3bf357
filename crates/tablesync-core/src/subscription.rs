//! Subscription records and the index that finds them.
//!
//! A subscription ties a view to a connection. Delivery is a send on the
//! connection's unbounded sink, so a slow peer never stalls the broadcaster.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tablesync_protocol::{Frame, PortId, Row, SubscriptionId, UpdateMode, ViewId};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::SyncError;

/// Delta carried by a notification.
#[derive(Debug, Clone)]
pub enum DeltaPayload {
    /// No delta, the subscriber only learns that the view changed.
    None,
    /// Row delta, shared between subscribers of the same view.
    Rows(Arc<Vec<Row>>),
    /// Columnar delta.
    Columnar(Bytes),
    /// Terminal push: the host cancelled the subscription.
    Closed,
}

/// A push queued for one subscription.
#[derive(Debug)]
pub struct UpdateNotification {
    pub subscription_id: SubscriptionId,
    pub port_id: PortId,
    pub payload: DeltaPayload,
    active: Arc<AtomicBool>,
}

impl UpdateNotification {
    /// False once the subscription was cancelled; the push must then be dropped.
    /// A [`DeltaPayload::Closed`] push stays live so the peer learns of it.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.payload, DeltaPayload::Closed) || self.active.load(Ordering::SeqCst)
    }

    /// Convert into an update frame.
    #[must_use]
    pub fn into_frame(self) -> Frame {
        match self.payload {
            DeltaPayload::None => Frame::notify(self.subscription_id, self.port_id),
            DeltaPayload::Rows(rows) => {
                let rows = Arc::try_unwrap(rows).unwrap_or_else(|shared| (*shared).clone());
                Frame::row_update(self.subscription_id, self.port_id, rows)
            }
            DeltaPayload::Columnar(data) => {
                Frame::columnar_update(self.subscription_id, self.port_id, data)
            }
            DeltaPayload::Closed => Frame::subscription_closed(self.subscription_id),
        }
    }
}

/// Where a connection receives its pushes.
pub type UpdateSink = mpsc::UnboundedSender<UpdateNotification>;

/// An active subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    view_id: ViewId,
    connection: String,
    mode: UpdateMode,
    sink: UpdateSink,
    active: Arc<AtomicBool>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    #[must_use]
    pub fn connection(&self) -> &str {
        &self.connection
    }

    #[must_use]
    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Queue a push. Returns `false` if the subscription is cancelled or its
    /// connection is gone.
    pub fn deliver(&self, port_id: PortId, payload: DeltaPayload) -> bool {
        if !self.is_active() {
            return false;
        }

        let notification = UpdateNotification {
            subscription_id: self.id,
            port_id,
            payload,
            active: Arc::clone(&self.active),
        };
        self.sink.send(notification).is_ok()
    }

    /// Tell the connection this subscription ended. Pushes still queued
    /// behind it are dropped.
    fn close(&self) {
        self.cancel();
        let notification = UpdateNotification {
            subscription_id: self.id,
            port_id: 0,
            payload: DeltaPayload::Closed,
            active: Arc::clone(&self.active),
        };
        // Connection already gone.
        let _ = self.sink.send(notification);
    }
}

/// Subscriptions by id, by view, and by connection.
#[derive(Debug)]
pub struct SubscriptionIndex {
    next_id: AtomicU64,
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,
    by_view: DashMap<ViewId, DashSet<SubscriptionId>>,
    by_connection: DashMap<String, DashSet<SubscriptionId>>,
    max_per_connection: usize,
}

impl SubscriptionIndex {
    #[must_use]
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            by_view: DashMap::new(),
            by_connection: DashMap::new(),
            max_per_connection,
        }
    }

    /// Subscribe `connection` to a view.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has too many subscriptions.
    pub fn subscribe(
        &self,
        view_id: ViewId,
        connection: &str,
        mode: UpdateMode,
        sink: UpdateSink,
    ) -> Result<Arc<Subscription>, SyncError> {
        let conn_subs = self.by_connection.entry(connection.to_string()).or_default();
        if conn_subs.len() >= self.max_per_connection {
            return Err(SyncError::MaxSubscriptionsReached);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            view_id,
            connection: connection.to_string(),
            mode,
            sink,
            active: Arc::new(AtomicBool::new(true)),
        });

        conn_subs.insert(id);
        drop(conn_subs);
        self.by_view.entry(view_id).or_default().insert(id);
        self.subscriptions.insert(id, Arc::clone(&subscription));

        debug!(
            subscription = id,
            view = view_id,
            connection = %connection,
            mode = ?mode,
            "Subscribed"
        );

        Ok(subscription)
    }

    /// Cancel a subscription owned by `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SubscriptionNotFound`] if the id is unknown or
    /// belongs to another connection.
    pub fn unsubscribe(&self, id: SubscriptionId, connection: &str) -> Result<(), SyncError> {
        let owned = self
            .subscriptions
            .get(&id)
            .is_some_and(|s| s.connection() == connection);
        if !owned {
            return Err(SyncError::SubscriptionNotFound(id));
        }

        self.remove(id);
        debug!(subscription = id, connection = %connection, "Unsubscribed");
        Ok(())
    }

    /// Active subscriptions on a view, oldest first.
    #[must_use]
    pub fn for_view(&self, view_id: ViewId) -> Vec<Arc<Subscription>> {
        let ids: Vec<SubscriptionId> = match self.by_view.get(&view_id) {
            Some(set) => set.iter().map(|id| *id).collect(),
            None => return Vec::new(),
        };

        let mut subs: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.subscriptions.get(&id).map(|s| Arc::clone(s.value())))
            .collect();
        subs.sort_by_key(|s| s.id());
        subs
    }

    /// Drop every subscription on a view and notify each subscriber that
    /// its subscription is closed. Returns how many were removed.
    pub fn remove_view(&self, view_id: ViewId) -> usize {
        let Some((_, ids)) = self.by_view.remove(&view_id) else {
            return 0;
        };

        let ids: Vec<SubscriptionId> = ids.into_iter().collect();
        for &id in &ids {
            if let Some(subscription) = self.remove(id) {
                subscription.close();
            }
        }
        trace!(view = view_id, removed = ids.len(), "Removed view subscriptions");
        ids.len()
    }

    /// Drop every subscription of a connection. Returns how many were removed.
    pub fn remove_connection(&self, connection: &str) -> usize {
        let Some((_, ids)) = self.by_connection.remove(connection) else {
            return 0;
        };

        let ids: Vec<SubscriptionId> = ids.into_iter().collect();
        for &id in &ids {
            self.remove(id);
        }
        debug!(connection = %connection, removed = ids.len(), "Removed connection subscriptions");
        ids.len()
    }

    fn remove(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let (_, subscription) = self.subscriptions.remove(&id)?;
        subscription.cancel();

        if let Some(set) = self.by_view.get(&subscription.view_id) {
            set.remove(&id);
        }
        if let Some(set) = self.by_connection.get(subscription.connection()) {
            set.remove(&id);
        }
        self.by_view
            .remove_if(&subscription.view_id, |_, set| set.is_empty());
        self.by_connection
            .remove_if(subscription.connection(), |_, set| set.is_empty());

        Some(subscription)
    }

    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&id).map(|s| Arc::clone(s.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            subscriptions: self.subscriptions.len(),
            views: self.by_view.len(),
            connections: self.by_connection.len(),
        }
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

/// Subscription index statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Active subscriptions.
    pub subscriptions: usize,
    /// Views with at least one subscription.
    pub views: usize,
    /// Connections with at least one subscription.
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_and_deliver() {
        let index = SubscriptionIndex::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = index.subscribe(7, "conn-1", UpdateMode::Row, tx).unwrap();
        assert_eq!(index.for_view(7).len(), 1);

        assert!(sub.deliver(0, DeltaPayload::None));
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.subscription_id, sub.id());
        assert!(notification.is_live());
        assert_eq!(notification.into_frame(), Frame::notify(sub.id(), 0));
    }

    #[test]
    fn test_unsubscribe_cancels_queued_pushes() {
        let index = SubscriptionIndex::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = index.subscribe(1, "conn-1", UpdateMode::Notify, tx).unwrap();
        sub.deliver(0, DeltaPayload::None);

        index.unsubscribe(sub.id(), "conn-1").unwrap();
        assert!(!rx.try_recv().unwrap().is_live());
        assert!(!sub.deliver(0, DeltaPayload::None));
        assert!(index.is_empty());
        assert_eq!(index.stats().views, 0);
    }

    #[test]
    fn test_unsubscribe_requires_owner() {
        let index = SubscriptionIndex::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let sub = index.subscribe(1, "conn-1", UpdateMode::Notify, tx).unwrap();
        assert_eq!(
            index.unsubscribe(sub.id(), "conn-2"),
            Err(SyncError::SubscriptionNotFound(sub.id()))
        );
        assert_eq!(
            index.unsubscribe(99, "conn-1"),
            Err(SyncError::SubscriptionNotFound(99))
        );
    }

    #[test]
    fn test_remove_view_and_connection() {
        let index = SubscriptionIndex::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        index.subscribe(1, "a", UpdateMode::Row, tx.clone()).unwrap();
        index.subscribe(1, "b", UpdateMode::Row, tx.clone()).unwrap();
        index.subscribe(2, "a", UpdateMode::Row, tx).unwrap();

        assert_eq!(index.remove_view(1), 2);
        assert_eq!(index.for_view(1).len(), 0);
        assert_eq!(index.len(), 1);

        assert_eq!(index.remove_connection("a"), 1);
        assert!(index.is_empty());
        assert_eq!(
            index.stats(),
            SubscriptionStats {
                subscriptions: 0,
                views: 0,
                connections: 0
            }
        );
    }

    #[test]
    fn test_remove_view_sends_closed_push() {
        let index = SubscriptionIndex::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = index.subscribe(4, "a", UpdateMode::Row, tx).unwrap();
        sub.deliver(1, DeltaPayload::None);
        index.remove_view(4);

        let stale = rx.try_recv().unwrap();
        assert!(!stale.is_live());

        let closed = rx.try_recv().unwrap();
        assert!(closed.is_live());
        assert_eq!(closed.into_frame(), Frame::subscription_closed(sub.id()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_per_connection_limit() {
        let index = SubscriptionIndex::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();

        index.subscribe(1, "a", UpdateMode::Row, tx.clone()).unwrap();
        assert!(matches!(
            index.subscribe(2, "a", UpdateMode::Row, tx),
            Err(SyncError::MaxSubscriptionsReached)
        ));
    }

    #[test]
    fn test_closed_sink_reports_drop() {
        let index = SubscriptionIndex::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = index.subscribe(1, "a", UpdateMode::Row, tx).unwrap();
        drop(rx);

        assert!(!sub.deliver(0, DeltaPayload::Rows(Arc::new(Vec::new()))));
    }
}
