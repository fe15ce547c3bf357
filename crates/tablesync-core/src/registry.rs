//! Process-wide registry of hosted tables and views.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tablesync_protocol::ViewId;
use tracing::debug;

use crate::engine::EngineTable;
use crate::error::SyncError;
use crate::table::{HostedTable, HostedView};

/// Maximum table name length.
pub const MAX_TABLE_NAME_LENGTH: usize = 256;

/// Validate a table name.
///
/// # Errors
///
/// Returns an error describing why the name is invalid.
pub fn validate_table_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Table name cannot be empty");
    }
    if name.len() > MAX_TABLE_NAME_LENGTH {
        return Err("Table name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Table name contains control characters");
    }
    Ok(())
}

/// Tables by name, views by id.
#[derive(Debug)]
pub struct Registry {
    tables: DashMap<String, Arc<HostedTable>>,
    views: DashMap<ViewId, Arc<HostedView>>,
    next_seq: AtomicU64,
    max_tables: usize,
}

impl Registry {
    #[must_use]
    pub fn new(max_tables: usize) -> Self {
        Self {
            tables: DashMap::new(),
            views: DashMap::new(),
            next_seq: AtomicU64::new(0),
            max_tables,
        }
    }

    /// Host `engine` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NameConflict`] if the name is taken.
    pub fn host(
        &self,
        name: &str,
        engine: Box<dyn EngineTable>,
    ) -> Result<Arc<HostedTable>, SyncError> {
        validate_table_name(name).map_err(SyncError::InvalidName)?;

        if self.tables.len() >= self.max_tables {
            return Err(SyncError::TooManyTables);
        }

        match self.tables.entry(name.to_string()) {
            Entry::Occupied(_) => Err(SyncError::NameConflict(name.to_string())),
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let table = Arc::new(HostedTable::new(name, seq, engine));
                slot.insert(Arc::clone(&table));
                debug!(table = %name, "Hosted table");
                Ok(table)
            }
        }
    }

    /// Whether `name` is hosted.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Resolve a table by name.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] if no such table is hosted.
    pub fn lookup(&self, name: &str) -> Result<Arc<HostedTable>, SyncError> {
        self.tables
            .get(name)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| SyncError::TableNotFound(name.to_string()))
    }

    /// Unregister a table. Its views are left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] if no such table is hosted.
    pub fn remove(&self, name: &str) -> Result<Arc<HostedTable>, SyncError> {
        self.tables
            .remove(name)
            .map(|(_, t)| t)
            .ok_or_else(|| SyncError::TableNotFound(name.to_string()))
    }

    /// Hosted names in hosting order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut tables: Vec<(u64, String)> = self
            .tables
            .iter()
            .map(|t| (t.seq(), t.key().clone()))
            .collect();
        tables.sort_unstable();
        tables.into_iter().map(|(_, name)| name).collect()
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn insert_view(&self, view: Arc<HostedView>) {
        self.views.insert(view.id(), view);
    }

    /// Resolve a live view.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ViewNotFound`] if the view is unknown or deleted.
    pub fn view(&self, id: ViewId) -> Result<Arc<HostedView>, SyncError> {
        self.views
            .get(&id)
            .map(|v| Arc::clone(v.value()))
            .filter(|v| !v.is_deleted())
            .ok_or(SyncError::ViewNotFound(id))
    }

    pub fn remove_view(&self, id: ViewId) -> Option<Arc<HostedView>> {
        self.views.remove(&id).map(|(_, v)| v)
    }

    /// Ids of the views created by `connection`.
    #[must_use]
    pub fn views_owned_by(&self, connection: &str) -> Vec<ViewId> {
        self.views
            .iter()
            .filter(|v| v.owner() == Some(connection))
            .map(|v| *v.key())
            .collect()
    }

    #[must_use]
    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}
