//! End-to-end tests: a server and real clients, over the in-memory transport
//! and over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tablesync_client::{Client, ClientConfig, Payload, TableSource, UpdateEvent};
use tablesync_core::{TableData, TableInit};
use tablesync_protocol::{ColumnType, ErrorCode, Row, SchemaColumn, TableOptions, UpdateMode, ViewConfig};
use tablesync_server::{Config, Server};
use tablesync_transport::{MemoryConnector, MemoryTransport};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn rows(value: serde_json::Value) -> Vec<Row> {
    serde_json::from_value(value).unwrap()
}

enum Connect {
    Memory(MemoryConnector),
    WebSocket(String),
}

struct Harness {
    server: Server,
    connect: Connect,
}

impl Harness {
    async fn memory() -> Self {
        let server = Server::new(Config::default());
        let (transport, connector) = MemoryTransport::new();

        let serving = server.clone();
        tokio::spawn(async move { serving.serve_transport(Arc::new(transport)).await });

        Self {
            server,
            connect: Connect::Memory(connector),
        }
    }

    async fn websocket() -> Self {
        let server = Server::new(Config::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        Self {
            server,
            connect: Connect::WebSocket(url),
        }
    }

    async fn client(&self) -> Client {
        match &self.connect {
            Connect::Memory(connector) => {
                Client::new(Box::new(connector.connect().unwrap()), ClientConfig::default())
                    .await
                    .unwrap()
            }
            Connect::WebSocket(url) => Client::connect(url).await.unwrap(),
        }
    }

    fn host_table(&self, name: &str, data: Vec<Row>) {
        self.server
            .host()
            .create_table(name, TableInit::Rows(data), TableOptions::default())
            .unwrap();
    }

    async fn update(&self, name: &str, data: Vec<Row>) {
        self.server
            .host()
            .update(name, TableData::Rows(data), 0)
            .await
            .unwrap();
    }

    async fn eject_table(&self, name: &str) {
        self.server.host().eject_table(name).await.unwrap();
    }
}

/// Forward listener events into a channel the test can await.
fn collector() -> (
    impl FnMut(UpdateEvent) + Send + 'static,
    mpsc::UnboundedReceiver<UpdateEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |event| {
            let _ = tx.send(event);
        },
        rx,
    )
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<UpdateEvent>) -> UpdateEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("listener ended")
}

async fn sends_initial_data_on_open(h: Harness) {
    let data = rows(json!([{"x": 1}]));
    h.host_table("test", data.clone());

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();
    assert_eq!(view.to_json().await.unwrap(), data);

    client.terminate();
    h.eject_table("test").await;
}

async fn passes_back_errors_from_server(h: Harness) {
    let data = rows(json!([{"x": 1}]));
    h.host_table("test", data.clone());

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();

    let err = table.view(ViewConfig::with_columns(["z"])).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Abort(): Invalid column 'z' found in View columns.\n"
    );
    assert_eq!(err.code(), Some(ErrorCode::Validation));

    // The failed call leaves the connection usable.
    let view = table.view(ViewConfig::default()).await.unwrap();
    assert_eq!(view.to_json().await.unwrap(), data);

    client.terminate();
    h.eject_table("test").await;
}

async fn sends_initial_data_to_multiple_clients(h: Harness) {
    let data = rows(json!([{"x": 1}]));
    h.host_table("test", data.clone());

    let client_1 = h.client().await;
    let client_2 = h.client().await;
    let table_1 = client_1.open_table("test").await.unwrap();
    let table_2 = client_2.open_table("test").await.unwrap();

    // One client's bad request does not disturb the other.
    let err = table_1.view(ViewConfig::with_columns(["z"])).await.unwrap_err();
    assert!(err.is_validation());

    let view_1 = table_1.view(ViewConfig::default()).await.unwrap();
    let view_2 = table_2.view(ViewConfig::default()).await.unwrap();
    let data_1 = view_1.to_json().await.unwrap();
    let data_2 = view_2.to_json().await.unwrap();

    client_1.terminate();
    client_2.terminate();

    assert_eq!(data_1, data);
    assert_eq!(data_2, data);
    h.eject_table("test").await;
}

async fn sends_updates_on_subscribe(h: Harness) {
    let data = rows(json!([{"x": 1}]));
    h.host_table("test", data.clone());

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();

    let (callback, mut events) = collector();
    view.on_update(callback, UpdateMode::Notify).await.unwrap();
    assert_eq!(view.to_json().await.unwrap(), data);

    h.update("test", rows(json!([{"x": 2}]))).await;

    let event = next_event(&mut events).await;
    assert_eq!(event.port_id, 0);
    assert_eq!(event.mode, UpdateMode::Notify);
    assert_eq!(
        view.to_json().await.unwrap(),
        rows(json!([{"x": 1}, {"x": 2}]))
    );
    // Exactly once: a second push would have arrived before that response.
    assert!(events.try_recv().is_err());

    h.eject_table("test").await;
    client.terminate();
}

async fn updates_with_columnar_payloads(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();

    let snapshot = table.view(ViewConfig::default()).await.unwrap();
    let block = snapshot.to_columnar().await.unwrap();
    assert!(!block.is_empty());

    table.update(Payload::Columnar(block.clone())).await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();
    assert_eq!(
        view.to_json().await.unwrap(),
        rows(json!([{"x": 1}, {"x": 1}]))
    );

    table.update(block.clone()).await.unwrap();
    table.update(block).await.unwrap();
    assert_eq!(view.num_rows().await.unwrap(), 4);
    assert_eq!(table.size().await.unwrap(), 4);

    client.terminate();
    h.eject_table("test").await;
}

async fn tags_updates_with_their_port(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    // A subscriber inside the server process.
    let host = Arc::clone(h.server.host());
    let local_view = host
        .make_view("test", ViewConfig::default(), None)
        .await
        .unwrap();
    let block = host.view_to_columnar(local_view).unwrap();
    let (sink, mut local) = mpsc::unbounded_channel();
    host.subscribe(local_view, "local", UpdateMode::Row, sink)
        .unwrap();

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();
    let (callback, mut events) = collector();
    view.on_update(callback, UpdateMode::Columnar).await.unwrap();

    let mut last = 0;
    for _ in 0..5 {
        let port = table.make_port().await.unwrap();
        assert!(port > last);
        last = port;
    }
    let update_port = table.make_port().await.unwrap();
    assert!(update_port > last);

    table
        .update_on(Payload::Columnar(block), update_port)
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.port_id, update_port);
    assert_eq!(event.mode, UpdateMode::Columnar);
    assert!(!event.data.is_empty());

    let notification = tokio::time::timeout(WAIT, local.recv()).await.unwrap().unwrap();
    assert_eq!(notification.port_id, update_port);

    // Unknown ports are rejected.
    let err = table
        .update_on(rows(json!([{"x": 3}])), update_port + 100)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    client.terminate();
    h.eject_table("test").await;
}

async fn delivers_same_port_updates_in_order(h: Harness) {
    h.host_table("test", rows(json!([{"x": 0}])));

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();
    let (callback, mut events) = collector();
    view.on_update(callback, UpdateMode::Row).await.unwrap();

    for x in 1..=20 {
        table.update(rows(json!([{"x": x}]))).await.unwrap();
    }

    for x in 1..=20 {
        let event = next_event(&mut events).await;
        assert_eq!(event.rows, Some(rows(json!([{"x": x}]))));
    }

    client.terminate();
    h.eject_table("test").await;
}

async fn removed_listener_stops_receiving(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();

    let (kept, mut kept_events) = collector();
    let (removed, mut removed_events) = collector();
    view.on_update(kept, UpdateMode::Notify).await.unwrap();
    let listener = view.on_update(removed, UpdateMode::Notify).await.unwrap();
    assert_eq!(view.listener_count(), 2);

    view.remove_update(listener).await.unwrap();
    assert_eq!(view.listener_count(), 1);
    h.update("test", rows(json!([{"x": 2}]))).await;

    next_event(&mut kept_events).await;
    // The removed listener's task has ended without seeing the update.
    assert!(tokio::time::timeout(WAIT, removed_events.recv())
        .await
        .unwrap()
        .is_none());

    // Removing it again is reported by the server.
    assert!(view.remove_update(listener).await.unwrap_err().is_not_found());

    client.terminate();
    h.eject_table("test").await;
}

async fn eject_ends_subscriptions(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    let client = h.client().await;
    let other = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();
    let (callback, mut events) = collector();
    view.on_update(callback, UpdateMode::Row).await.unwrap();

    other.eject_table("test").await.unwrap();

    let ended = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("listener still running after eject");
    assert!(ended.is_none());
    assert_eq!(view.listener_count(), 0);

    let err = client.open_table("test").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(view.to_json().await.unwrap_err().is_not_found());
    assert!(table.update(rows(json!([{"x": 2}]))).await.is_err());
    assert!(client.get_hosted_table_names().await.unwrap().is_empty());

    // The name is free again at once, and the old listener stays silent.
    h.host_table("test", rows(json!([{"x": 5}])));
    h.update("test", rows(json!([{"x": 6}]))).await;
    let reopened = client.open_table("test").await.unwrap();
    assert_eq!(reopened.size().await.unwrap(), 2);
    assert!(events.try_recv().is_err());

    client.terminate();
    other.terminate();
    h.eject_table("test").await;
}

async fn host_side_eject_closes_listeners(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();
    let (callback, mut events) = collector();
    view.on_update(callback, UpdateMode::Row).await.unwrap();
    let (_, mut stream) = view.updates(UpdateMode::Notify).await.unwrap();
    assert_eq!(view.listener_count(), 2);

    h.eject_table("test").await;

    let ended = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("listener still running after eject");
    assert!(ended.is_none());
    let ended = tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("stream still open after eject");
    assert!(ended.is_none());
    assert_eq!(view.listener_count(), 0);
    assert!(client.is_connected());

    client.terminate();
}

async fn hosts_tables_remotely(h: Harness) {
    let client = h.client().await;

    let rows_table = client
        .host_table("rows", TableSource::Rows(rows(json!([{"a": 1, "b": "x"}]))), TableOptions::default())
        .await
        .unwrap();
    let schema_table = client
        .host_table(
            "schema",
            TableSource::Schema(vec![
                SchemaColumn::new("a", ColumnType::Integer),
                SchemaColumn::new("b", ColumnType::String),
            ]),
            TableOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        client.get_hosted_table_names().await.unwrap(),
        vec!["rows", "schema"]
    );
    assert_eq!(rows_table.schema().await.unwrap(), schema_table.schema().await.unwrap());
    assert_eq!(schema_table.size().await.unwrap(), 0);

    let block = rows_table
        .view(ViewConfig::default())
        .await
        .unwrap()
        .to_columnar()
        .await
        .unwrap();
    let columnar_table = client
        .host_table("columnar", TableSource::Columnar(block), TableOptions::default())
        .await
        .unwrap();
    assert_eq!(columnar_table.size().await.unwrap(), 1);

    let err = client
        .host_table("rows", TableSource::Rows(rows(json!([{"a": 2}]))), TableOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NameConflict));

    // Bad data is rejected and nothing changes.
    let err = rows_table
        .update(rows(json!([{"c": 1}])))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().starts_with("Abort(): "));
    assert_eq!(rows_table.size().await.unwrap(), 1);

    client.eject_table("schema").await.unwrap();
    assert!(client.eject_table("schema").await.unwrap_err().is_not_found());
    client.terminate();
}

async fn views_close_with_their_connection(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    let view = table.view(ViewConfig::default()).await.unwrap();
    view.on_update(|_| {}, UpdateMode::Row).await.unwrap();
    assert_eq!(h.server.host().stats().views, 1);

    client.terminate();
    tokio::time::timeout(WAIT, async {
        while h.server.host().stats().views > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.server.host().stats().subscriptions.subscriptions, 0);
    assert_eq!(h.server.host().table_names(), vec!["test"]);
}

async fn gets_hosted_table_names(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    let client = h.client().await;
    assert_eq!(client.get_hosted_table_names().await.unwrap(), vec!["test"]);

    client.terminate();
    h.eject_table("test").await;
}

async fn stops_keepalive_on_server_shutdown(h: Harness) {
    h.host_table("test", rows(json!([{"x": 1}])));

    let client = h.client().await;
    let table = client.open_table("test").await.unwrap();
    assert_eq!(table.size().await.unwrap(), 1);
    assert!(client.keepalive_active());

    h.server.shutdown().await;

    tokio::time::timeout(WAIT, async {
        while client.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!client.keepalive_active());
    assert!(matches!(
        table.size().await,
        Err(tablesync_client::ClientError::ConnectionClosed)
    ));
    assert!(h.server.host().table_names().is_empty());
}

macro_rules! over_both_transports {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::Harness;
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(Harness::memory().await).await;
                }
            )*
        }

        mod websocket {
            use super::Harness;
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(Harness::websocket().await).await;
                }
            )*
        }
    };
}

over_both_transports!(
    sends_initial_data_on_open,
    passes_back_errors_from_server,
    sends_initial_data_to_multiple_clients,
    sends_updates_on_subscribe,
    updates_with_columnar_payloads,
    tags_updates_with_their_port,
    delivers_same_port_updates_in_order,
    removed_listener_stops_receiving,
    eject_ends_subscriptions,
    host_side_eject_closes_listeners,
    hosts_tables_remotely,
    views_close_with_their_connection,
    gets_hosted_table_names,
    stops_keepalive_on_server_shutdown,
);
