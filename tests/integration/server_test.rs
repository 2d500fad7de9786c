// tests/integration/server_test.rs

//! Session server: login pipelines, echo handling, listeners and sweeps.

use crate::integration::fixtures::{
    DTU_PASSWORD, OTHER_TOKEN, TEST_PASSWORD, TEST_TOKEN, TEST_USER,
};
use crate::integration::test_helpers::{RunningServer, running_transport};
use async_trait::async_trait;
use linkcore::config::{Config, ServerMode};
use linkcore::connection::{AccountHandshake, Connection, ConnectionOptions, HslTransport};
use linkcore::core::errors::codes;
use linkcore::core::protocol::alien::{STATUS_PACKET_LENGTH, decode_status};
use linkcore::core::protocol::{AlienLoginPacket, LoginStatus, SelfCheckProtocol};
use linkcore::core::LinkError;
use linkcore::server::{Session, SessionListener, ServerSettings, build_server};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionListener for Recorder {
    async fn on_connected(&self, session: &Session) {
        let who = session.device_id().unwrap_or("-").to_string();
        self.events.lock().push(format!("connected:{who}"));
    }

    async fn on_message(&self, _session: &Session, payload: &[u8]) {
        self.events
            .lock()
            .push(format!("message:{}", payload.len()));
    }

    async fn on_disconnected(&self, _session: &Session) {
        self.events.lock().push("disconnected".to_string());
    }
}

fn hsl_config(accounts: &[(&str, &str)]) -> Config {
    let mut config = Config::default();
    config.server.token = TEST_TOKEN;
    config.server.accounts = accounts
        .iter()
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .collect();
    config
}

fn alien_config() -> Config {
    let mut config = Config::default();
    config.server.mode = ServerMode::Alien;
    config.alien.password = DTU_PASSWORD.to_string();
    config.alien.forbidden = vec!["BANNED".to_string()];
    config
}

fn hsl_client(server: &RunningServer, token: uuid::Uuid) -> Connection<HslTransport> {
    Connection::new(server.endpoint(), HslTransport::new(token), running_transport())
}

fn account_handshake(password: &str) -> Arc<AccountHandshake> {
    Arc::new(AccountHandshake::new(
        SelfCheckProtocol::new(TEST_TOKEN).with_receive_timeout(Some(Duration::from_secs(5))),
        TEST_USER,
        password,
    ))
}

async fn alien_login(server: &RunningServer, device: &str, password: &str) -> (TcpStream, LoginStatus) {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let packet = AlienLoginPacket::new(device, password).encode().unwrap();
    stream.write_all(&packet).await.unwrap();
    let mut status = [0u8; STATUS_PACKET_LENGTH];
    stream.read_exact(&mut status).await.unwrap();
    (stream, decode_status(&status).unwrap())
}

async fn assert_closed_by_server(stream: &mut TcpStream) {
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server did not close the socket");
    assert!(matches!(read, Ok(0) | Err(_)), "got {read:?}");
}

#[tokio::test]
async fn hsl_server_echoes_envelopes() {
    let server = build_server(&hsl_config(&[]), running_transport());
    let recorder = Arc::new(Recorder::default());
    server.listeners().register(recorder.clone());
    let server = RunningServer::start(server).await;

    let client = hsl_client(&server, TEST_TOKEN);
    client.connect_server().await.unwrap();
    assert_eq!(client.read_string(7, "hello").await.unwrap(), "hello");
    assert_eq!(
        client.read_bytes(8, &[1, 2, 3]).await.unwrap().as_ref(),
        &[1, 2, 3]
    );
    server.wait_for_sessions(1).await;

    client.connect_close().await.unwrap();
    server.wait_for_sessions(0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = recorder.events.lock().clone();
    assert_eq!(events.first().map(String::as_str), Some("connected:-"));
    assert_eq!(events.last().map(String::as_str), Some("disconnected"));
    assert_eq!(events.iter().filter(|e| e.starts_with("message:")).count(), 2);
    server.stop().await;
}

#[tokio::test]
async fn hsl_server_drops_peers_with_the_wrong_token() {
    let server = RunningServer::start(build_server(&hsl_config(&[]), running_transport())).await;

    let client = hsl_client(&server, OTHER_TOKEN);
    let err = client.read_string(1, "hello").await.unwrap_err();
    assert!(err.is_connection_error(), "got {err:?}");
    server.wait_for_sessions(0).await;
    server.stop().await;
}

#[tokio::test]
async fn account_login_accepts_valid_credentials() {
    let server = RunningServer::start(build_server(
        &hsl_config(&[(TEST_USER, TEST_PASSWORD)]),
        running_transport(),
    ))
    .await;

    let client = hsl_client(&server, TEST_TOKEN).with_handshake(account_handshake(TEST_PASSWORD));
    client.connect_server().await.unwrap();
    server.wait_for_sessions(1).await;

    let sessions = server.server.store().snapshot();
    assert_eq!(sessions[0].meta().username.as_deref(), Some(TEST_USER));
    assert_eq!(client.read_string(0, "after login").await.unwrap(), "after login");

    client.connect_close().await.unwrap();
    server.wait_for_sessions(0).await;
    server.stop().await;
}

#[tokio::test]
async fn account_login_rejects_bad_credentials() {
    let server = RunningServer::start(build_server(
        &hsl_config(&[(TEST_USER, TEST_PASSWORD)]),
        running_transport(),
    ))
    .await;

    let client = hsl_client(&server, TEST_TOKEN).with_handshake(account_handshake("guess"));
    let err = client.connect_server().await.unwrap_err();
    assert!(
        matches!(err, LinkError::Application { code, .. } if code == codes::LOGIN_REJECTED),
        "got {err:?}"
    );
    assert!(client.is_in_error());
    assert!(server.server.store().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn client_config_drives_account_login() {
    let config = hsl_config(&[(TEST_USER, TEST_PASSWORD)]);
    let server = RunningServer::start(build_server(&config, running_transport())).await;

    let mut client_config = config.client.clone();
    client_config.persistent = true;
    client_config.username = TEST_USER.to_string();
    client_config.password = TEST_PASSWORD.to_string();
    let client = hsl_client(&server, TEST_TOKEN).with_client_config(&client_config);
    assert!(client.is_persistent());
    assert_eq!(client.options(), &ConnectionOptions::from(&client_config));

    assert_eq!(client.read_string(0, "lazy login").await.unwrap(), "lazy login");
    server.wait_for_sessions(1).await;
    let sessions = server.server.store().snapshot();
    assert_eq!(sessions[0].meta().username.as_deref(), Some(TEST_USER));

    client_config.password = "guess".to_string();
    let rejected = hsl_client(&server, TEST_TOKEN).with_client_config(&client_config);
    let err = rejected.connect_server().await.unwrap_err();
    assert!(
        matches!(err, LinkError::Application { code, .. } if code == codes::LOGIN_REJECTED),
        "got {err:?}"
    );

    client.connect_close().await.unwrap();
    server.wait_for_sessions(0).await;
    server.stop().await;
}

#[tokio::test]
async fn client_config_without_username_skips_login() {
    let config = hsl_config(&[(TEST_USER, TEST_PASSWORD)]);
    let server = RunningServer::start(build_server(&config, running_transport())).await;

    let client = hsl_client(&server, TEST_TOKEN).with_client_config(&config.client);
    assert!(!client.is_persistent());
    // The server requires an account, so skipping the login gets the socket dropped.
    assert!(client.read_string(0, "anonymous").await.is_err());
    assert!(server.server.store().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn alien_login_statuses() {
    let server = build_server(&alien_config(), running_transport());
    let recorder = Arc::new(Recorder::default());
    server.listeners().register(recorder.clone());
    let server = RunningServer::start(server).await;

    let (mut online, status) = alien_login(&server, "DTU-0001", DTU_PASSWORD).await;
    assert_eq!(status, LoginStatus::Success);
    server.wait_for_sessions(1).await;

    let (mut duplicate, status) = alien_login(&server, "DTU-0001", DTU_PASSWORD).await;
    assert_eq!(status, LoginStatus::DuplicateLogin);
    assert_closed_by_server(&mut duplicate).await;

    let (mut wrong, status) = alien_login(&server, "DTU-0002", "000000").await;
    assert_eq!(status, LoginStatus::BadPassword);
    assert_closed_by_server(&mut wrong).await;

    let (mut banned, status) = alien_login(&server, "BANNED", DTU_PASSWORD).await;
    assert_eq!(status, LoginStatus::Forbidden);
    assert_closed_by_server(&mut banned).await;

    online.write_all(b"\x01\x03\x00\x00\x00\x02").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.server.store().len(), 1);
    drop(online);
    server.wait_for_sessions(0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = recorder.events.lock().clone();
    assert_eq!(events, vec!["connected:DTU-0001", "message:6", "disconnected"]);
    server.stop().await;
}

#[tokio::test]
async fn malformed_alien_packet_is_dropped() {
    let server = RunningServer::start(build_server(&alien_config(), running_transport())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&[0u8; 28]).await.unwrap();
    assert_closed_by_server(&mut stream).await;
    assert!(server.server.store().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn heartbeat_sweep_closes_silent_sessions() {
    let server = build_server(&alien_config(), running_transport()).with_settings(ServerSettings {
        heartbeat_timeout: Some(Duration::from_millis(200)),
        ..ServerSettings::default()
    });
    let server = RunningServer::start(server).await;

    let (mut quiet, _) = alien_login(&server, "DTU-0009", DTU_PASSWORD).await;
    server.wait_for_sessions(1).await;
    assert_eq!(server.server.sweep_heartbeats(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.server.sweep_heartbeats(), 1);
    assert_closed_by_server(&mut quiet).await;
    server.wait_for_sessions(0).await;
    server.stop().await;
}

#[tokio::test]
async fn session_limit_refuses_extra_peers() {
    let server = build_server(&alien_config(), running_transport()).with_settings(ServerSettings {
        max_sessions: 1,
        ..ServerSettings::default()
    });
    let server = RunningServer::start(server).await;

    let (_first, status) = alien_login(&server, "DTU-0001", DTU_PASSWORD).await;
    assert_eq!(status, LoginStatus::Success);
    server.wait_for_sessions(1).await;

    let mut second = TcpStream::connect(server.addr).await.unwrap();
    assert_closed_by_server(&mut second).await;
    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let server = RunningServer::start(build_server(&alien_config(), running_transport())).await;
    let (mut stream, _) = alien_login(&server, "DTU-0001", DTU_PASSWORD).await;
    server.wait_for_sessions(1).await;

    let store = server.server.store().clone();
    server.stop().await;
    assert!(store.is_empty());
    assert_closed_by_server(&mut stream).await;
}

#[tokio::test]
async fn options_follow_client_config() {
    let mut config = Config::default();
    config.client.receive_timeout_ms = -1;
    config.client.persistent = true;
    let options = ConnectionOptions::from(&config.client);
    assert_eq!(options.receive_timeout, None);
    assert!(options.persistent);
    assert_eq!(options.connect_timeout, Duration::from_secs(10));
}
