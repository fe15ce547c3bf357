//! # tablesync-core
//!
//! Table hosting and update fan-out for tablesync.
//!
//! This crate provides the server-side building blocks:
//!
//! - **Engine** - The data engine boundary and an in-memory implementation
//! - **Registry** - Hosted tables by name, views by id
//! - **Ports** - Per-table writer stream identifiers
//! - **Subscriptions** - Which connection listens to which view
//! - **Host** - Ties them together and broadcasts deltas on update
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Session   │────▶│    Host     │────▶│   Registry   │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!        ▲                   │                    │
//!        │                   ▼                    ▼
//!        │            ┌─────────────┐     ┌──────────────┐
//!        └────────────│ Broadcaster │◀────│ HostedTable  │
//!      UpdateSink     └─────────────┘     │  + ports     │
//!                                         │  + views     │
//!                                         └──────────────┘
//! ```

mod broadcast;
pub mod engine;
pub mod error;
pub mod host;
pub mod registry;
pub mod subscription;
pub mod table;

pub use broadcast::BroadcastReport;
pub use engine::{
    ChangeSet, DataEngine, EngineError, EngineTable, EngineView, MemoryEngine, TableData,
    TableInit,
};
pub use error::SyncError;
pub use host::{Host, HostConfig, HostStats};
pub use registry::Registry;
pub use subscription::{
    DeltaPayload, Subscription, SubscriptionIndex, SubscriptionStats, UpdateNotification,
    UpdateSink,
};
pub use table::{HostedTable, HostedView, PortManager};
