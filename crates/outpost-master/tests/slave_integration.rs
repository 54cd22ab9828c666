#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests over a real TLS listener: pairing over HTTPS, then a
//! slave WebSocket authenticated by the issued client certificate.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use outpost_crypto::{CA_CERT_FILE, CA_KEY_FILE, CaOptions, CertificateAuthority, generate_csr};
use outpost_master::app::Master;
use outpost_master::config::MasterConfig;
use outpost_master::router::RelayError;
use outpost_master::server::HeartbeatMonitor;
use outpost_master::storage::SlaveStore;
use outpost_master::tls::client_tls_config;
use outpost_master::upstream::NoUpstream;
use outpost_proto::{Envelope, MessageType, ToolCallPayload};

type SlaveSocket = WebSocketStream<TlsStream<TcpStream>>;

static CA_DIR: OnceLock<tempfile::TempDir> = OnceLock::new();

/// Generate the CA once and copy it into each test's data dir.
fn seed_ca(data_dir: &Path) {
    let dir = CA_DIR.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        CertificateAuthority::load_or_generate(dir.path(), CaOptions { key_bits: 2048 }).unwrap();
        dir
    });
    for file in [CA_CERT_FILE, CA_KEY_FILE] {
        std::fs::copy(dir.path().join(file), data_dir.join(file)).unwrap();
    }
}

struct Harness {
    master: Arc<Master>,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    _data_dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        seed_ca(data_dir.path());
        let mut config = MasterConfig::with_data_dir(data_dir.path().to_path_buf());
        config.server_names = vec!["localhost".into()];
        config.relay_timeout = Duration::from_secs(5);
        config.handshake_timeout = Duration::from_secs(2);
        config.ca_key_bits = 2048;

        let master = Arc::new(
            Master::open(config, Arc::new(NoUpstream), Arc::new(NoUpstream))
                .await
                .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let serving = Arc::clone(&master);
        tokio::spawn(async move { serving.serve(listener, shutdown_rx).await.unwrap() });

        Self {
            master,
            addr,
            shutdown,
            _data_dir: data_dir,
        }
    }

    fn ca_pem(&self) -> String {
        self.master.state.ca.ca_cert_pem().to_string()
    }

    async fn tls(&self, config: Arc<ClientConfig>) -> TlsStream<TcpStream> {
        let tcp = TcpStream::connect(self.addr).await.unwrap();
        TlsConnector::from(config)
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap()
    }

    /// One HTTP/1.1 request over TLS without a client certificate.
    async fn http(&self, method: &str, path: &str, body: Option<&Value>) -> (u16, Value) {
        let mut stream = self
            .tls(client_tls_config(&self.ca_pem(), None).unwrap())
            .await;
        let body = body.map(Value::to_string).unwrap_or_default();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        let _ = stream.read_to_end(&mut raw).await;
        let raw = String::from_utf8(raw).unwrap();
        let status = raw
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        let (_, body) = raw.split_once("\r\n\r\n").unwrap();
        (status, serde_json::from_str(body).unwrap_or(Value::Null))
    }

    async fn connect(&self, cert_pem: &str, key_pem: &str) -> Result<SlaveSocket, tungstenite::Error> {
        let tls = client_tls_config(&self.ca_pem(), Some((cert_pem, key_pem))).unwrap();
        let stream = self.tls(tls).await;
        tokio_tungstenite::client_async("wss://localhost/slave/connect", stream)
            .await
            .map(|(socket, _)| socket)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct Credentials {
    cert_pem: String,
    key_pem: String,
}

/// Pair `hostname` over HTTPS and approve it as the operator would.
async fn pair(harness: &Harness, hostname: &str) -> Credentials {
    let csr = generate_csr(hostname).unwrap();
    let (status, body) = harness
        .http(
            "POST",
            "/pair",
            Some(&json!({"hostname": hostname, "csr": csr.csr_pem, "platform": "darwin"})),
        )
        .await;
    assert_eq!(status, 200);
    let code = body["pairing_code"].as_str().unwrap().to_string();

    harness
        .master
        .state
        .pairing
        .approve(hostname, &code)
        .await
        .unwrap();

    let (status, body) = harness.http("GET", &format!("/pair/{code}"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], json!("approved"));
    assert_eq!(body["ca_cert"].as_str().unwrap(), harness.ca_pem());

    Credentials {
        cert_pem: body["certificate"].as_str().unwrap().to_string(),
        key_pem: csr.key_pem,
    }
}

async fn send(socket: &mut SlaveSocket, envelope: &Envelope) {
    socket
        .send(Message::Text(envelope.to_json().unwrap()))
        .await
        .unwrap();
}

/// Next envelope from the master, or `None` once the socket closes.
async fn recv(socket: &mut SlaveSocket) -> Option<Envelope> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap();
        match frame {
            Some(Ok(Message::Text(text))) => return Some(Envelope::from_json(&text).unwrap()),
            Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

async fn register(socket: &mut SlaveSocket, hostname: &str) {
    let register = Envelope::new(
        MessageType::Register,
        "reg-1",
        json!({
            "hostname": hostname,
            "version": "1.4.0",
            "tools": [{"name": "search_files", "description": "Search files"}],
        }),
    );
    send(socket, &register).await;

    let ack = recv(socket).await.unwrap();
    assert_eq!(ack.kind(), Some(MessageType::Response));
    assert_eq!(ack.id, "reg-1");
    assert_eq!(ack.data["status"], json!("registered"));

    let tools = recv(socket).await.unwrap();
    assert_eq!(tools.kind(), Some(MessageType::MasterTools));
}

#[tokio::test]
async fn pair_connect_and_relay_tool_call() {
    let harness = Harness::start().await;
    let creds = pair(&harness, "workstation").await;

    let mut socket = harness.connect(&creds.cert_pem, &creds.key_pem).await.unwrap();
    register(&mut socket, "workstation").await;

    let registry = &harness.master.state.registry;
    assert!(registry.is_connected("workstation").await);
    let tools = registry.tools("workstation").await.unwrap();
    assert_eq!(tools[0].name, "search_files");

    let manager = harness.master.manager();
    let call = tokio::spawn(async move {
        let mut arguments = Map::new();
        arguments.insert("pattern".into(), json!("*.rs"));
        manager
            .call_tool("workstation_search_files", arguments)
            .await
    });

    let request = recv(&mut socket).await.unwrap();
    assert_eq!(request.kind(), Some(MessageType::ToolCall));
    assert!(request.id.starts_with("workstation-"));
    let payload: ToolCallPayload = request.payload().unwrap();
    assert_eq!(payload.tool, "search_files");
    assert_eq!(payload.arguments["pattern"], json!("*.rs"));

    let reply = Envelope::new(
        MessageType::Response,
        request.id,
        json!({"success": true, "result": {"files": ["main.rs"]}}),
    );
    send(&mut socket, &reply).await;

    let result = call.await.unwrap().unwrap();
    assert_eq!(result, json!({"files": ["main.rs"]}));

    let stored = harness
        .master
        .db
        .get_slave_server_by_host_id("workstation")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.platform, "darwin");
    assert_eq!(stored.reported_version, "1.4.0");
}

#[tokio::test]
async fn revoked_slave_is_closed_and_refused() {
    let harness = Harness::start().await;
    let creds = pair(&harness, "workstation").await;
    let mut socket = harness.connect(&creds.cert_pem, &creds.key_pem).await.unwrap();
    register(&mut socket, "workstation").await;

    // Revoked through the store, as the offline CLI does from another process.
    let db = &harness.master.db;
    let serial = db
        .get_slave_server_by_host_id("workstation")
        .await
        .unwrap()
        .unwrap()
        .cert_serial;
    db.revoke_slave_credential("workstation", &serial, "compromised")
        .await
        .unwrap();

    let state = &harness.master.state;
    let monitor = HeartbeatMonitor::new(
        Arc::clone(&state.registry),
        state.relay.clone(),
        Arc::clone(&state.store),
        Duration::from_secs(120),
    );
    let report = monitor.sweep().await;
    assert_eq!(report.revoked, vec!["workstation".to_string()]);
    assert!(recv(&mut socket).await.is_none());
    assert!(!state.registry.is_connected("workstation").await);

    match harness.connect(&creds.cert_pem, &creds.key_pem).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn call_to_disconnected_slave_fails() {
    let harness = Harness::start().await;
    let creds = pair(&harness, "workstation").await;
    let mut socket = harness.connect(&creds.cert_pem, &creds.key_pem).await.unwrap();
    register(&mut socket, "workstation").await;

    let relay = harness.master.state.relay.clone();
    let call = tokio::spawn(async move {
        relay
            .call_tool("workstation", "search_files", Map::new())
            .await
    });
    let request = recv(&mut socket).await.unwrap();
    assert_eq!(request.kind(), Some(MessageType::ToolCall));

    socket.close(None).await.unwrap();
    drop(socket);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RelayError::Disconnected(_)), "{err:?}");
    assert!(harness.master.state.relay.pending().is_empty());

    let err = harness
        .master
        .state
        .relay
        .call_tool("workstation", "search_files", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotConnected(_)));
}

#[tokio::test]
async fn reconnect_fails_calls_sent_on_replaced_connection() {
    let harness = Harness::start().await;
    let creds = pair(&harness, "workstation").await;
    let mut first = harness.connect(&creds.cert_pem, &creds.key_pem).await.unwrap();
    register(&mut first, "workstation").await;

    let relay = harness.master.state.relay.clone();
    let call = tokio::spawn(async move {
        relay
            .call_tool("workstation", "search_files", Map::new())
            .await
    });
    let request = recv(&mut first).await.unwrap();
    assert_eq!(request.kind(), Some(MessageType::ToolCall));

    let mut second = harness.connect(&creds.cert_pem, &creds.key_pem).await.unwrap();
    register(&mut second, "workstation").await;

    // Fails well before the five second relay timeout.
    let err = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RelayError::Disconnected(_)), "{err:?}");
    assert!(harness.master.state.relay.pending().is_empty());
    assert!(harness.master.state.registry.is_connected("workstation").await);
    assert!(recv(&mut first).await.is_none());
}

#[tokio::test]
async fn silent_connection_is_closed_after_handshake_window() {
    let harness = Harness::start().await;
    let creds = pair(&harness, "workstation").await;
    let mut socket = harness.connect(&creds.cert_pem, &creds.key_pem).await.unwrap();

    // No register within the two-second window.
    let heartbeat = Envelope::new(MessageType::Heartbeat, "hb", Value::Null);
    send(&mut socket, &heartbeat).await;
    assert!(recv(&mut socket).await.is_none());
    assert!(!harness.master.state.registry.is_connected("workstation").await);
}

#[tokio::test]
async fn connect_without_certificate_is_unauthorized() {
    let harness = Harness::start().await;
    let stream = harness
        .tls(client_tls_config(&harness.ca_pem(), None).unwrap())
        .await;
    match tokio_tungstenite::client_async("wss://localhost/slave/connect", stream).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
}
