//! # tablesync-client
//!
//! Async client for a tablesync host.
//!
//! A [`Client`] owns one connection. Tables and views on the server are
//! reached through [`TableHandle`] and [`ViewHandle`]; every call suspends
//! until the server answers or the connection dies, and server errors come
//! back with the server's message unchanged.
//!
//! ```rust,ignore
//! use tablesync_client::Client;
//! use tablesync_protocol::{UpdateMode, ViewConfig};
//!
//! let client = Client::connect("ws://127.0.0.1:8080/ws").await?;
//! let table = client.open_table("prices").await?;
//! let view = table.view(ViewConfig::default()).await?;
//!
//! view.on_update(|event| println!("update on port {}", event.port_id), UpdateMode::Row)
//!     .await?;
//! println!("{:?}", view.to_json().await?);
//! ```

pub mod client;
pub mod error;
pub mod keepalive;
pub mod multiplexer;
pub mod table;
pub mod view;

pub use client::{Client, ClientConfig, TableSource};
pub use error::ClientError;
pub use keepalive::Keepalive;
pub use multiplexer::{Multiplexer, Response, Routed, UpdateEvent, UpdateRoute, UpdateStream};
pub use table::{Payload, TableHandle};
pub use view::{ListenerId, ViewHandle};
