//! SSH server handler for one client connection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::SshInboundChannel;
use crate::protocol::constants::{REQUEST_ENV, REQUEST_SHELL, REQUEST_SUBSYSTEM};
use crate::protocol::ChannelRequest;
use crate::session::{SessionController, SessionSettings, UpstreamConnector};

/// Requests a channel may queue before its controller picks them up.
const REQUEST_QUEUE_DEPTH: usize = 16;

/// Handles SSH events for a single client connection.
///
/// Every session channel gets its own [`SessionController`]; channel
/// requests are forwarded to it and answered with its decision.
pub struct ConnectionHandler {
    connection_id: String,
    peer_addr: SocketAddr,
    connector: Arc<dyn UpstreamConnector>,
    settings: SessionSettings,
    allowed_users: Arc<Vec<String>>,
    channels: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,
}

impl ConnectionHandler {
    pub fn new(
        connection_id: String,
        peer_addr: SocketAddr,
        connector: Arc<dyn UpstreamConnector>,
        settings: SessionSettings,
        allowed_users: Arc<Vec<String>>,
    ) -> Self {
        Self {
            connection_id,
            peer_addr,
            connector,
            settings,
            allowed_users,
            channels: HashMap::new(),
        }
    }

    fn check_user(&self, user: &str, method: &str) -> Auth {
        if self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == user) {
            info!(connection_id = %self.connection_id, user, method, "Client logged in");
            Auth::Accept
        } else {
            warn!(connection_id = %self.connection_id, user, method, "Rejected login for unknown user");
            Auth::Reject {
                proceed_with_methods: None,
            }
        }
    }

    /// Queue `request` for the channel's controller and reply once it has
    /// decided. A request the controller never looks at gets no reply.
    fn forward_request(
        &self,
        id: ChannelId,
        request: ChannelRequest,
        reply: tokio::sync::oneshot::Receiver<bool>,
        session: &mut Session,
    ) {
        let kind = request.kind().to_string();
        let queued = match self.channels.get(&id) {
            Some(requests) => requests.try_send(request).is_ok(),
            None => false,
        };

        if !queued {
            debug!(connection_id = %self.connection_id, channel = ?id, kind = %kind, "Channel not taking requests");
            let _ = session.channel_failure(id);
            return;
        }

        let handle = session.handle();
        tokio::spawn(answer_request(handle, id, reply));
    }
}

async fn answer_request(handle: Handle, id: ChannelId, reply: tokio::sync::oneshot::Receiver<bool>) {
    match reply.await {
        Ok(true) => {
            let _ = handle.channel_success(id).await;
        }
        Ok(false) => {
            let _ = handle.channel_failure(id).await;
        }
        Err(_) => {}
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.check_user(user, "password"))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check_user(user, "publickey"))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let session_id = Uuid::new_v4().to_string();
        info!(
            connection_id = %self.connection_id,
            session_id = %session_id,
            channel = ?id,
            peer = %self.peer_addr,
            "New session channel"
        );

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let inbound = SshInboundChannel::new(
            channel,
            session.handle(),
            requests_rx,
            self.settings.pipe_capacity,
        );
        let controller = SessionController::new(
            session_id,
            inbound,
            Arc::clone(&self.connector),
            self.settings.clone(),
        );

        tokio::spawn(controller.run());
        self.channels.insert(id, requests_tx);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (request, reply) = ChannelRequest::exec(data);
        self.forward_request(channel, request, reply, session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (request, reply) = ChannelRequest::with_strings(
            REQUEST_ENV,
            &[variable_name.as_bytes(), variable_value.as_bytes()],
        );
        self.forward_request(channel, request, reply, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (request, reply) = ChannelRequest::new(REQUEST_SHELL, bytes::Bytes::new());
        self.forward_request(channel, request, reply, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (request, reply) = ChannelRequest::with_strings(REQUEST_SUBSYSTEM, &[name.as_bytes()]);
        self.forward_request(channel, request, reply, session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channels.remove(&channel).is_some() {
            debug!(connection_id = %self.connection_id, channel = ?channel, "Client closed channel");
        }
        Ok(())
    }
}
