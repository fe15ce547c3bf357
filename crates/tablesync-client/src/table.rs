//! Remote table handle.

use bytes::Bytes;
use tablesync_protocol::{PortId, Reply, Request, Row, Schema, ViewConfig, DEFAULT_PORT};

use crate::client::Client;
use crate::error::ClientError;
use crate::view::ViewHandle;

/// Data applied by [`TableHandle::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Rows(Vec<Row>),
    /// A columnar block in the engine's encoding.
    Columnar(Bytes),
}

impl From<Vec<Row>> for Payload {
    fn from(rows: Vec<Row>) -> Self {
        Payload::Rows(rows)
    }
}

impl From<Row> for Payload {
    fn from(row: Row) -> Self {
        Payload::Rows(vec![row])
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Columnar(data)
    }
}

/// A table hosted on the server, addressed by name.
#[derive(Debug, Clone)]
pub struct TableHandle {
    client: Client,
    name: String,
}

impl TableHandle {
    pub(crate) fn new(client: Client, name: String) -> Self {
        Self { client, name }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a view of this table. An empty config selects everything.
    ///
    /// # Errors
    ///
    /// Fails with the engine's `Abort(): ...` message if the config refers
    /// to unknown columns.
    pub async fn view(&self, config: ViewConfig) -> Result<ViewHandle, ClientError> {
        let request = Request::MakeView {
            table: self.name.clone(),
            config,
        };
        match self.client.call(request).await?.reply {
            Reply::View { view_id } => Ok(ViewHandle::new(
                self.client.clone(),
                view_id,
                self.name.clone(),
            )),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Apply `payload` on the default port.
    ///
    /// # Errors
    ///
    /// Fails if the engine rejects the payload; nothing is applied then.
    pub async fn update(&self, payload: impl Into<Payload>) -> Result<(), ClientError> {
        self.update_on(payload, DEFAULT_PORT).await
    }

    /// Apply `payload` on `port`.
    ///
    /// # Errors
    ///
    /// Fails if the engine rejects the payload or the port was never
    /// allocated.
    pub async fn update_on(
        &self,
        payload: impl Into<Payload>,
        port: PortId,
    ) -> Result<(), ClientError> {
        let (rows, binary) = match payload.into() {
            Payload::Rows(rows) => (Some(rows), Bytes::new()),
            Payload::Columnar(data) => (None, data),
        };

        let request = Request::Update {
            table: self.name.clone(),
            port_id: port,
            rows,
        };
        match self.client.call_with(request, binary, None).await?.reply {
            Reply::Ok => Ok(()),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Allocate a new port.
    ///
    /// # Errors
    ///
    /// Fails if the table is gone.
    pub async fn make_port(&self) -> Result<PortId, ClientError> {
        let request = Request::MakePort {
            table: self.name.clone(),
        };
        match self.client.call(request).await?.reply {
            Reply::Port { port_id } => Ok(port_id),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// Number of rows.
    ///
    /// # Errors
    ///
    /// Fails if the table is gone.
    pub async fn size(&self) -> Result<u64, ClientError> {
        let request = Request::TableSize {
            table: self.name.clone(),
        };
        match self.client.call(request).await?.reply {
            Reply::Size { size } => Ok(size),
            other => Err(ClientError::unexpected(other)),
        }
    }

    /// # Errors
    ///
    /// Fails if the table is gone.
    pub async fn schema(&self) -> Result<Schema, ClientError> {
        let request = Request::TableSchema {
            table: self.name.clone(),
        };
        match self.client.call(request).await?.reply {
            Reply::Schema { schema } => Ok(schema),
            other => Err(ClientError::unexpected(other)),
        }
    }
}
