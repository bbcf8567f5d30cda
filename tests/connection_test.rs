//! Integration tests for the SSH front end over real sockets

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{pkt, MemorySink};
use gitspy::error::SessionError;
use gitspy::relay::ByteSink;
use gitspy::session::{ExitStatus, UpstreamConnector, UpstreamSession};
use gitspy::{Config, ConnectionManager};
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::time::timeout;

const CLIENT_REQUEST: &[u8] = b"0032want 0123456789abcdef0123456789abcdef01234567\n00000009done\n";

/// Replies once the client has sent everything.
struct ScriptedUpstream {
    response: Vec<u8>,
    exit: ExitStatus,
    commands: Mutex<Vec<String>>,
    received: Arc<MemorySink>,
}

impl ScriptedUpstream {
    fn new(response: Vec<u8>, exit: ExitStatus) -> Arc<Self> {
        Arc::new(Self {
            response,
            exit,
            commands: Mutex::new(Vec::new()),
            received: Arc::new(MemorySink::new()),
        })
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedUpstream {
    async fn start(&self, command: &str) -> Result<UpstreamSession, SessionError> {
        self.commands.lock().unwrap().push(command.to_string());

        let (mut stdout_tx, stdout_rx) = tokio::io::duplex(1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let received = Arc::clone(&self.received);
        let response = self.response.clone();
        let exit = self.exit.clone();

        tokio::spawn(async move {
            while !received.is_closed() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            let _ = stdout_tx.write_all(&response).await;
            drop(stdout_tx);
            let _ = exit_tx.send(exit);
        });

        Ok(UpstreamSession {
            stdin: Arc::clone(&self.received) as Arc<dyn ByteSink>,
            stdout: Box::new(stdout_rx),
            stderr: Box::new(std::io::Cursor::new(b"remote: Counting objects: 1\n".to_vec())),
            exit: exit_rx,
        })
    }
}

struct TestClient;

#[async_trait]
impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn test_config(allowed_users: &[&str]) -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.server.auth_rejection_time = Duration::from_millis(10);
    config.server.allowed_users = allowed_users.iter().map(|u| u.to_string()).collect();
    config
}

async fn start_server(config: Config, upstream: Arc<dyn UpstreamConnector>) -> SocketAddr {
    let host_key = KeyPair::generate_ed25519().unwrap();
    let mut manager = ConnectionManager::new(Arc::new(config), host_key, upstream);

    let addr = manager.bind().await.unwrap();
    assert_eq!(manager.get_bind_addr(), Some(addr));

    tokio::spawn(async move {
        if let Err(e) = manager.start().await {
            eprintln!("Server error: {}", e);
        }
    });
    addr
}

async fn connect(addr: SocketAddr, user: &str) -> client::Handle<TestClient> {
    let mut handle = client::connect(Arc::new(client::Config::default()), addr, TestClient)
        .await
        .unwrap();
    assert!(handle.authenticate_password(user, "secret").await.unwrap());
    handle
}

/// Wait for the Success/Failure reply to the last request.
async fn next_reply(channel: &mut Channel<client::Msg>) -> bool {
    loop {
        match timeout(Duration::from_secs(5), channel.wait()).await.expect("no reply") {
            Some(ChannelMsg::Success) => return true,
            Some(ChannelMsg::Failure) => return false,
            Some(_) => continue,
            None => panic!("channel closed before the request was answered"),
        }
    }
}

#[derive(Debug, Default)]
struct Received {
    data: Vec<u8>,
    exit_status: Option<u32>,
    eof: bool,
}

/// Read until the server closes the channel.
async fn drain(channel: &mut Channel<client::Msg>) -> Received {
    let mut received = Received::default();
    loop {
        match timeout(Duration::from_secs(5), channel.wait()).await.expect("channel was not closed") {
            Some(ChannelMsg::Data { data }) => received.data.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => received.exit_status = Some(exit_status),
            Some(ChannelMsg::Eof) => received.eof = true,
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    received
}

fn upload_pack_response() -> Vec<u8> {
    let mut wire = pkt(b"0123456789abcdef0123456789abcdef01234567 HEAD\n");
    wire.extend_from_slice(b"0000");
    wire.extend(pkt(b"NAK\n"));
    wire.extend_from_slice(b"PACK\x00\x00\x00\x02");
    wire
}

#[tokio::test]
async fn test_upload_pack_over_ssh() {
    let upstream = ScriptedUpstream::new(upload_pack_response(), ExitStatus::Code(0));
    let addr = start_server(test_config(&[]), Arc::clone(&upstream) as Arc<dyn UpstreamConnector>).await;

    let handle = connect(addr, "alice").await;
    let mut channel = handle.channel_open_session().await.unwrap();

    // Rejected, but the channel stays usable.
    channel.exec(true, "git-receive-pack 'org/repo.git'").await.unwrap();
    assert!(!next_reply(&mut channel).await);

    channel.exec(true, "git-upload-pack 'org/repo.git'").await.unwrap();
    assert!(next_reply(&mut channel).await);

    channel.data(CLIENT_REQUEST).await.unwrap();
    channel.eof().await.unwrap();

    let received = drain(&mut channel).await;
    assert_eq!(received.data, upload_pack_response());
    assert_eq!(received.exit_status, Some(0));
    assert!(received.eof);

    assert_eq!(
        *upstream.commands.lock().unwrap(),
        vec!["git-upload-pack 'org/repo.git'".to_string()]
    );
    assert_eq!(upstream.received.contents(), CLIENT_REQUEST);
}

#[tokio::test]
async fn test_remote_failure_status_reaches_client() {
    let mut response = pkt(b"ERR repository not found");
    response.extend_from_slice(b"0000");
    let upstream = ScriptedUpstream::new(response.clone(), ExitStatus::Code(128));
    let addr = start_server(test_config(&[]), upstream).await;

    let handle = connect(addr, "alice").await;
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "git-upload-pack 'missing.git'").await.unwrap();
    assert!(next_reply(&mut channel).await);
    channel.eof().await.unwrap();

    let received = drain(&mut channel).await;
    assert_eq!(received.data, response);
    assert_eq!(received.exit_status, Some(128));
}

#[tokio::test]
async fn test_allowed_users_restricts_login() {
    let upstream = ScriptedUpstream::new(Vec::new(), ExitStatus::Code(0));
    let addr = start_server(test_config(&["alice"]), upstream).await;

    let mut handle = client::connect(Arc::new(client::Config::default()), addr, TestClient)
        .await
        .unwrap();

    assert!(!handle.authenticate_password("mallory", "secret").await.unwrap());
    assert!(handle.authenticate_password("alice", "secret").await.unwrap());
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let upstream = ScriptedUpstream::new(Vec::new(), ExitStatus::Code(0));
    let mut manager = ConnectionManager::new(
        Arc::new(test_config(&[])),
        KeyPair::generate_ed25519().unwrap(),
        upstream,
    );

    assert!(manager.get_bind_addr().is_none());
    manager.bind().await.unwrap();
    assert!(manager.get_bind_addr().is_some());
    assert_eq!(manager.get_active_connections(), 0);

    manager.initiate_shutdown();
    assert!(manager.is_shutting_down());

    let result = timeout(Duration::from_secs(2), manager.start()).await;
    assert!(result.expect("accept loop kept running after shutdown").is_ok());
}
