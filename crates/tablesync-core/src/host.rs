//! The table host: one per process, shared by every session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tablesync_protocol::{
    PortId, Row, Schema, SubscriptionId, TableOptions, UpdateMode, ViewConfig, ViewId,
};
use tracing::{debug, info, warn};

use crate::broadcast::{broadcast, BroadcastReport};
use crate::engine::{DataEngine, EngineTable, MemoryEngine, TableData, TableInit};
use crate::error::SyncError;
use crate::registry::{validate_table_name, Registry};
use crate::subscription::{SubscriptionIndex, SubscriptionStats, UpdateSink};
use crate::table::{HostedTable, HostedView};

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Maximum number of hosted tables.
    pub max_tables: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_tables: 10_000,
            max_subscriptions_per_connection: 1_000,
        }
    }
}

/// Hosts tables and views and fans updates out to subscribers.
///
/// Updates to one table are serialized by that table's writer lock, which
/// is held until every resulting push has been queued. Unrelated tables
/// never contend.
pub struct Host {
    engine: Arc<dyn DataEngine>,
    registry: Registry,
    subscriptions: SubscriptionIndex,
    next_view_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Host {
    /// Create a host backed by [`MemoryEngine`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Arc::new(MemoryEngine::new()), HostConfig::default())
    }

    /// Create a host with a custom engine and configuration.
    #[must_use]
    pub fn with_config(engine: Arc<dyn DataEngine>, config: HostConfig) -> Self {
        info!("Creating host with config: {:?}", config);
        Self {
            engine,
            registry: Registry::new(config.max_tables),
            subscriptions: SubscriptionIndex::new(config.max_subscriptions_per_connection),
            next_view_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Host an existing engine table under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NameConflict`] if the name is already hosted.
    pub fn host_table(&self, name: &str, table: Box<dyn EngineTable>) -> Result<(), SyncError> {
        if self.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        self.registry.host(name, table)?;
        info!(table = %name, "Table hosted");
        Ok(())
    }

    /// Create a table through the engine and host it.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the engine rejects `init`.
    pub fn create_table(
        &self,
        name: &str,
        init: TableInit,
        options: TableOptions,
    ) -> Result<(), SyncError> {
        validate_table_name(name).map_err(SyncError::InvalidName)?;
        if self.registry.contains(name) {
            return Err(SyncError::NameConflict(name.to_string()));
        }

        let table = self.engine.create(init, options)?;
        self.host_table(name, table)
    }

    /// Eject a table, its views, and their subscriptions.
    ///
    /// Waits for an in-flight update to finish its broadcast. Once this
    /// returns, nothing more is pushed for the table and the name can be
    /// hosted again.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] if no such table is hosted.
    pub async fn eject_table(&self, name: &str) -> Result<(), SyncError> {
        let table = self.registry.remove(name)?;
        table.mark_ejected();

        let _state = table.lock().await;

        let views = table.drain_views();
        let mut cancelled = 0;
        for view in &views {
            cancelled += self.drop_view(view);
        }

        info!(
            table = %name,
            views = views.len(),
            subscriptions = cancelled,
            "Table ejected"
        );
        Ok(())
    }

    /// Hosted table names, in hosting order.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Resolve a hosted table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] if no such table is hosted.
    pub fn open_table(&self, name: &str) -> Result<Arc<HostedTable>, SyncError> {
        self.registry.lookup(name)
    }

    /// Number of rows in a table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] if no such table is hosted.
    pub async fn size(&self, name: &str) -> Result<usize, SyncError> {
        let table = self.registry.lookup(name)?;
        let state = table.lock().await;
        Ok(state.engine.size())
    }

    /// Schema of a table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] if no such table is hosted.
    pub async fn schema(&self, name: &str) -> Result<Schema, SyncError> {
        let table = self.registry.lookup(name)?;
        let state = table.lock().await;
        Ok(state.engine.schema())
    }

    /// Allocate a port on a table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] if no such table is hosted.
    pub async fn make_port(&self, name: &str) -> Result<PortId, SyncError> {
        let table = self.registry.lookup(name)?;
        let mut state = table.lock().await;
        if table.is_ejected() {
            return Err(SyncError::TableNotFound(name.to_string()));
        }

        let port = state.ports.allocate();
        debug!(table = %name, port, "Allocated port");
        Ok(port)
    }

    /// Apply `data` on `port` and push the resulting deltas.
    ///
    /// Subscribers whose delta cannot be computed are skipped and counted in
    /// the report; the update itself still succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the table or port is unknown, or the engine
    /// rejects the data. Nothing is broadcast in that case.
    pub async fn update(
        &self,
        name: &str,
        data: TableData,
        port: PortId,
    ) -> Result<BroadcastReport, SyncError> {
        let table = self.registry.lookup(name)?;
        let mut state = table.lock().await;
        if table.is_ejected() {
            return Err(SyncError::TableNotFound(name.to_string()));
        }
        if !state.ports.contains(port) {
            return Err(SyncError::PortNotFound {
                table: name.to_string(),
                port,
            });
        }

        let changes = state.engine.update(data, port)?;
        let report = broadcast(&table, &self.subscriptions, &changes);

        if report.failed > 0 {
            warn!(table = %name, port, failed = report.failed, "Some deltas could not be computed");
        }
        Ok(report)
    }

    /// Create a view on a table. `owner` ties its lifetime to a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is unknown or the engine rejects the
    /// configuration.
    pub async fn make_view(
        &self,
        name: &str,
        config: ViewConfig,
        owner: Option<&str>,
    ) -> Result<ViewId, SyncError> {
        let table = self.registry.lookup(name)?;
        let state = table.lock().await;
        if table.is_ejected() {
            return Err(SyncError::TableNotFound(name.to_string()));
        }

        let engine = state.engine.view(&config)?;
        let id = self.next_view_id.fetch_add(1, Ordering::Relaxed);
        let view = Arc::new(HostedView::new(
            id,
            &table,
            owner.map(str::to_string),
            config,
            engine,
        ));

        table.add_view(Arc::clone(&view));
        self.registry.insert_view(view);
        debug!(table = %name, view = id, "Created view");
        Ok(id)
    }

    /// Delete a view and its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ViewNotFound`] if the view is unknown.
    pub fn delete_view(&self, id: ViewId) -> Result<(), SyncError> {
        let view = self.registry.view(id)?;
        if let Some(table) = view.table() {
            table.remove_view(id);
        }
        let cancelled = self.drop_view(&view);
        debug!(view = id, subscriptions = cancelled, "Deleted view");
        Ok(())
    }

    fn drop_view(&self, view: &HostedView) -> usize {
        view.mark_deleted();
        self.registry.remove_view(view.id());
        self.subscriptions.remove_view(view.id())
    }

    /// Serialize a view as rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the view is unknown or the engine fails.
    pub fn view_to_json(&self, id: ViewId) -> Result<Vec<Row>, SyncError> {
        Ok(self.registry.view(id)?.engine().to_json()?)
    }

    /// Serialize a view as a columnar block.
    ///
    /// # Errors
    ///
    /// Returns an error if the view is unknown or the engine fails.
    pub fn view_to_columnar(&self, id: ViewId) -> Result<Bytes, SyncError> {
        Ok(self.registry.view(id)?.engine().to_columnar()?)
    }

    /// Number of rows in a view.
    ///
    /// # Errors
    ///
    /// Returns an error if the view is unknown or the engine fails.
    pub fn view_num_rows(&self, id: ViewId) -> Result<usize, SyncError> {
        Ok(self.registry.view(id)?.engine().num_rows()?)
    }

    /// Subscribe `connection` to updates of a view.
    ///
    /// # Errors
    ///
    /// Returns an error if the view is unknown or limits are exceeded.
    pub fn subscribe(
        &self,
        view_id: ViewId,
        connection: &str,
        mode: UpdateMode,
        sink: UpdateSink,
    ) -> Result<SubscriptionId, SyncError> {
        let view = self.registry.view(view_id)?;
        let subscription = self.subscriptions.subscribe(view_id, connection, mode, sink)?;

        // The view may have been deleted between the lookup and the insert.
        if view.is_deleted() {
            let _ = self.subscriptions.unsubscribe(subscription.id(), connection);
            return Err(SyncError::ViewNotFound(view_id));
        }

        Ok(subscription.id())
    }

    /// Cancel a subscription owned by `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SubscriptionNotFound`] if it does not exist.
    pub fn unsubscribe(&self, id: SubscriptionId, connection: &str) -> Result<(), SyncError> {
        self.subscriptions.unsubscribe(id, connection)
    }

    /// Release everything a closed connection owned: its subscriptions and
    /// the views it created.
    pub fn remove_connection(&self, connection: &str) {
        let subscriptions = self.subscriptions.remove_connection(connection);

        let views = self.registry.views_owned_by(connection);
        for &id in &views {
            // Already gone if its table was ejected concurrently.
            let _ = self.delete_view(id);
        }

        debug!(
            connection = %connection,
            subscriptions,
            views = views.len(),
            "Released connection resources"
        );
    }

    /// Eject every table and refuse new ones.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let names = self.registry.names();
        for name in &names {
            if let Err(e) = self.eject_table(name).await {
                debug!(table = %name, error = %e, "Table already ejected");
            }
        }
        info!(tables = names.len(), "Host shut down");
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> HostStats {
        HostStats {
            tables: self.registry.table_count(),
            views: self.registry.view_count(),
            subscriptions: self.subscriptions.stats(),
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("registry", &self.registry)
            .field("subscriptions", &self.subscriptions)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Host statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStats {
    pub tables: usize,
    pub views: usize,
    pub subscriptions: SubscriptionStats,
}
