//! Turns one applied update into per-subscriber pushes.

use std::sync::Arc;

use bytes::Bytes;
use tablesync_protocol::{Row, UpdateMode};
use tracing::{trace, warn};

use crate::engine::{ChangeSet, EngineError};
use crate::subscription::{DeltaPayload, SubscriptionIndex};
use crate::table::{HostedTable, HostedView};

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Pushes queued.
    pub notified: usize,
    /// Deltas the engine failed to compute. Their subscribers were skipped.
    pub failed: usize,
    /// Pushes refused because the subscription or its connection was gone.
    pub dropped: usize,
}

/// Push `changes` to every subscriber of every view of `table`.
///
/// Must run under the table's writer lock so pushes for one table are
/// queued in the order its updates were applied.
pub(crate) fn broadcast(
    table: &HostedTable,
    subscriptions: &SubscriptionIndex,
    changes: &ChangeSet,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    for view in table.views() {
        let subscribers = subscriptions.for_view(view.id());
        if subscribers.is_empty() {
            continue;
        }

        let mut deltas = Deltas::default();
        for subscription in subscribers {
            let payload = match subscription.mode() {
                UpdateMode::Notify => Some(DeltaPayload::None),
                UpdateMode::Row => deltas.rows(&view, changes).map(DeltaPayload::Rows),
                UpdateMode::Columnar => deltas.columnar(&view, changes).map(DeltaPayload::Columnar),
            };

            let Some(payload) = payload else {
                continue;
            };

            if subscription.deliver(changes.port, payload) {
                report.notified += 1;
            } else {
                report.dropped += 1;
            }
        }
        report.failed += deltas.failed;
    }

    trace!(
        table = %table.name(),
        port = changes.port,
        notified = report.notified,
        failed = report.failed,
        dropped = report.dropped,
        "Broadcast update"
    );

    report
}

/// Deltas of one view, each computed at most once.
///
/// `Some(None)` records a failed computation so it is not retried for the
/// next subscriber of the same view.
#[derive(Default)]
struct Deltas {
    rows: Option<Option<Arc<Vec<Row>>>>,
    columnar: Option<Option<Bytes>>,
    failed: usize,
}

impl Deltas {
    fn rows(&mut self, view: &HostedView, changes: &ChangeSet) -> Option<Arc<Vec<Row>>> {
        if self.rows.is_none() {
            let delta = view.engine().delta_json(changes).map(Arc::new);
            self.rows = Some(self.settle(delta, view, UpdateMode::Row));
        }
        self.rows.clone().flatten()
    }

    fn columnar(&mut self, view: &HostedView, changes: &ChangeSet) -> Option<Bytes> {
        if self.columnar.is_none() {
            let delta = view.engine().delta_columnar(changes);
            self.columnar = Some(self.settle(delta, view, UpdateMode::Columnar));
        }
        self.columnar.clone().flatten()
    }

    fn settle<T>(
        &mut self,
        result: Result<T, EngineError>,
        view: &HostedView,
        mode: UpdateMode,
    ) -> Option<T> {
        match result {
            Ok(delta) => Some(delta),
            Err(e) => {
                warn!(
                    view = view.id(),
                    table = %view.table_name(),
                    mode = ?mode,
                    error = %e.cause(),
                    "Failed to compute delta"
                );
                self.failed += 1;
                None
            }
        }
    }
}
