//! Remote view handle and update listeners.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tablesync_protocol::{Reply, Request, Row, SubscriptionId, UpdateMode, ViewId};
use tracing::debug;

use crate::client::Client;
use crate::error::ClientError;
use crate::multiplexer::{UpdateEvent, UpdateRoute, UpdateStream};

/// Identifies a listener registered with [`ViewHandle::on_update`].
pub type ListenerId = SubscriptionId;

/// A view on the server.
///
/// Clones share their listener set.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    client: Client,
    id: ViewId,
    table: String,
    listeners: Arc<Mutex<HashSet<ListenerId>>>,
}

impl ViewHandle {
    pub(crate) fn new(client: Client, id: ViewId, table: String) -> Self {
        Self {
            client,
            id,
            table,
            listeners: Arc::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Name of the table this view was made from.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Snapshot of the view as rows.
    ///
    /// # Errors
    ///
    /// Fails if the view was deleted or its table ejected.
    pub async fn to_json(&self) -> Result<Vec<Row>, ClientError> {
        let request = Request::ViewToJson { view_id: self.id };
        match self.client.call(request).await?.reply {
            Reply::Rows { rows } => Ok(rows),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Snapshot of the view as a columnar block.
    ///
    /// # Errors
    ///
    /// Fails if the view was deleted or its table ejected.
    pub async fn to_columnar(&self) -> Result<Bytes, ClientError> {
        let request = Request::ViewToColumnar { view_id: self.id };
        let response = self.client.call(request).await?;
        match response.reply {
            Reply::Columnar => Ok(response.binary),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// # Errors
    ///
    /// Fails if the view was deleted or its table ejected.
    pub async fn num_rows(&self) -> Result<u64, ClientError> {
        let request = Request::ViewNumRows { view_id: self.id };
        match self.client.call(request).await?.reply {
            Reply::Size { size } => Ok(size),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Subscribe and receive updates as a stream.
    ///
    /// # Errors
    ///
    /// Fails if the view is gone.
    pub async fn updates(&self, mode: UpdateMode) -> Result<(ListenerId, UpdateStream), ClientError> {
        let (route, stream) = UpdateRoute::channel();
        let request = Request::Subscribe {
            view_id: self.id,
            mode,
        };

        match self.client.call_with(request, Bytes::new(), Some(route)).await?.reply {
            Reply::Subscription { subscription_id } => {
                self.listeners().insert(subscription_id);
                Ok((subscription_id, stream))
            }
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Call `callback` for every update to this view.
    ///
    /// The callback runs on its own task, one event at a time, in delivery
    /// order. It is never called again once the listener is removed, the
    /// server closes the subscription, or the connection closes.
    ///
    /// # Errors
    ///
    /// Fails if the view is gone.
    pub async fn on_update<F>(&self, mut callback: F, mode: UpdateMode) -> Result<ListenerId, ClientError>
    where
        F: FnMut(UpdateEvent) + Send + 'static,
    {
        let (id, mut stream) = self.updates(mode).await?;

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                callback(event);
            }
            debug!(listener = id, "Listener finished");
        });
        Ok(id)
    }

    /// Remove a listener. No update reaches it after this returns.
    ///
    /// # Errors
    ///
    /// Fails with a not-found error if the server does not know the listener.
    pub async fn remove_update(&self, listener: ListenerId) -> Result<(), ClientError> {
        self.listeners().remove(&listener);
        self.client.multiplexer().unregister_subscription(listener);

        let request = Request::Unsubscribe {
            subscription_id: listener,
        };
        match self.client.call(request).await?.reply {
            Reply::Ok => Ok(()),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Delete the view on the server. Its listeners stop immediately.
    ///
    /// # Errors
    ///
    /// Fails if the view is already gone.
    pub async fn delete(&self) -> Result<(), ClientError> {
        let listeners: Vec<_> = self.listeners().drain().collect();
        for id in listeners {
            self.client.multiplexer().unregister_subscription(id);
        }

        let request = Request::ViewDelete { view_id: self.id };
        match self.client.call(request).await?.reply {
            Reply::Ok => Ok(()),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Live listeners registered through this handle and its clones.
    ///
    /// Listeners the server closed, because the view was deleted or its
    /// table ejected, no longer count.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        let mux = self.client.multiplexer();
        let mut listeners = self.listeners();
        listeners.retain(|id| mux.is_subscribed(*id));
        listeners.len()
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashSet<ListenerId>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
