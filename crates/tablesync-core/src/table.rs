//! Hosted tables, their ports, and their views.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tablesync_protocol::{PortId, ViewConfig, ViewId, DEFAULT_PORT};
use tokio::sync::{Mutex, MutexGuard};

use crate::engine::{EngineTable, EngineView};

/// Per-table port allocator.
///
/// Port 0 exists implicitly. Allocated ids only grow and are never reused
/// while the table lives.
#[derive(Debug)]
pub struct PortManager {
    next: PortId,
}

impl PortManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: DEFAULT_PORT + 1,
        }
    }

    /// Allocate a fresh port id.
    pub fn allocate(&mut self) -> PortId {
        let port = self.next;
        self.next += 1;
        port
    }

    /// Whether `port` is the default port or was allocated earlier.
    #[must_use]
    pub fn contains(&self, port: PortId) -> bool {
        port < self.next
    }

    /// Number of allocated ports, not counting the default one.
    #[must_use]
    pub fn allocated(&self) -> usize {
        (self.next - DEFAULT_PORT - 1) as usize
    }
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable state of a hosted table, guarded by its writer lock.
pub(crate) struct TableState {
    pub(crate) engine: Box<dyn EngineTable>,
    pub(crate) ports: PortManager,
}

/// A table hosted under a unique name.
pub struct HostedTable {
    name: String,
    /// Hosting order, used to list names.
    seq: u64,
    /// Writer lock. Held for the whole of an update and its broadcast.
    state: Mutex<TableState>,
    views: DashMap<ViewId, Arc<HostedView>>,
    ejected: AtomicBool,
}

impl HostedTable {
    pub(crate) fn new(name: impl Into<String>, seq: u64, engine: Box<dyn EngineTable>) -> Self {
        Self {
            name: name.into(),
            seq,
            state: Mutex::new(TableState {
                engine,
                ports: PortManager::new(),
            }),
            views: DashMap::new(),
            ejected: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().await
    }

    #[must_use]
    pub fn is_ejected(&self) -> bool {
        self.ejected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ejected(&self) {
        self.ejected.store(true, Ordering::SeqCst);
    }

    /// Number of live views.
    #[must_use]
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Snapshot of the live views, in creation order.
    #[must_use]
    pub fn views(&self) -> Vec<Arc<HostedView>> {
        let mut views: Vec<_> = self.views.iter().map(|v| Arc::clone(v.value())).collect();
        views.sort_by_key(|v| v.id());
        views
    }

    pub(crate) fn add_view(&self, view: Arc<HostedView>) {
        self.views.insert(view.id(), view);
    }

    pub(crate) fn remove_view(&self, id: ViewId) -> Option<Arc<HostedView>> {
        self.views.remove(&id).map(|(_, v)| v)
    }

    /// Remove and return every view.
    pub(crate) fn drain_views(&self) -> Vec<Arc<HostedView>> {
        let ids: Vec<ViewId> = self.views.iter().map(|v| *v.key()).collect();
        ids.into_iter().filter_map(|id| self.remove_view(id)).collect()
    }
}

impl std::fmt::Debug for HostedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedTable")
            .field("name", &self.name)
            .field("seq", &self.seq)
            .field("views", &self.views.len())
            .field("ejected", &self.is_ejected())
            .finish_non_exhaustive()
    }
}

/// A view derived from a hosted table.
pub struct HostedView {
    id: ViewId,
    table: Weak<HostedTable>,
    table_name: String,
    /// Connection that created the view, if it was created remotely.
    owner: Option<String>,
    config: ViewConfig,
    engine: Box<dyn EngineView>,
    deleted: AtomicBool,
}

impl HostedView {
    pub(crate) fn new(
        id: ViewId,
        table: &Arc<HostedTable>,
        owner: Option<String>,
        config: ViewConfig,
        engine: Box<dyn EngineView>,
    ) -> Self {
        Self {
            id,
            table: Arc::downgrade(table),
            table_name: table.name().to_string(),
            owner,
            config,
            engine,
            deleted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> ViewId {
        self.id
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub(crate) fn table(&self) -> Option<Arc<HostedTable>> {
        self.table.upgrade()
    }

    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    #[must_use]
    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &dyn EngineView {
        self.engine.as_ref()
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for HostedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedView")
            .field("id", &self.id)
            .field("table", &self.table_name)
            .field("owner", &self.owner)
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}
