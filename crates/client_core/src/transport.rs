use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ActorId, ConversationId, TenantId},
    error::ApiError,
    protocol::ClientFrame,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, StatusCode},
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::SyncSettings,
    error::SyncError,
    events::{decode_frame, DecodedFrame, PushEvent},
};

#[derive(Clone)]
pub struct Credentials {
    pub actor_id: ActorId,
    pub display_name: String,
    pub tenant_id: TenantId,
    pub bearer: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("actor_id", &self.actor_id)
            .field("display_name", &self.display_name)
            .field("tenant_id", &self.tenant_id)
            .field("bearer", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted; only an explicit reconnect leaves this state.
    Offline,
    AuthRejected,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Push(PushEvent),
    ServerError(ApiError),
}

#[derive(Debug, Error)]
pub enum ChannelConnectError {
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("channel unreachable: {0}")]
    Unreachable(String),
}

/// One live channel. Frames written to `outbound` are serialized by the
/// connector; raw text frames arrive on `inbound`. The channel is gone once
/// `inbound` yields `None`.
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    pub io_tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, credentials: &Credentials) -> Result<ChannelLink, ChannelConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.reconnect_max_attempts.max(1),
            base_delay: settings.reconnect_base_delay,
            max_delay: settings.reconnect_max_delay,
        }
    }

    /// Delay before the given 1-based attempt: base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

struct SessionInner {
    credentials: Option<Credentials>,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    io_tasks: Vec<JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
    rooms: BTreeSet<ConversationId>,
    /// Bumped by every `connect` and `disconnect`; attempts from an older
    /// epoch must not install a link or touch the state.
    epoch: u64,
}

enum InstallError {
    Superseded,
    Closed(String),
}

impl SessionInner {
    fn release_link(&mut self) {
        self.outbound = None;
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct TransportSession {
    connector: Arc<dyn ChannelConnector>,
    policy: ReconnectPolicy,
    inner: Mutex<SessionInner>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn ChannelConnector>, policy: ReconnectPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            policy,
            inner: Mutex::new(SessionInner {
                credentials: None,
                outbound: None,
                io_tasks: Vec::new(),
                driver: None,
                rooms: BTreeSet::new(),
                epoch: 0,
            }),
            state,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Opens the channel and announces identity and rooms. Any previous
    /// channel is torn down first, which also covers credential rotation.
    pub async fn connect(self: &Arc<Self>, credentials: Credentials) -> Result<(), SyncError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if let Some(driver) = inner.driver.take() {
                driver.abort();
            }
            inner.release_link();
            inner.credentials = Some(credentials.clone());
            inner.epoch += 1;
            self.set_state(ConnectionState::Connecting);
            inner.epoch
        };

        let inbound = self.establish(&credentials, false, epoch).await?;
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return Err(SyncError::ConnectCancelled);
        }
        inner.driver = Some(tokio::spawn(Arc::clone(self).drive(credentials, inbound, epoch)));
        Ok(())
    }

    /// Reconnects with the credentials of the last `connect` call.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), SyncError> {
        let credentials = self
            .inner
            .lock()
            .await
            .credentials
            .clone()
            .ok_or(SyncError::NotConnected)?;
        self.connect(credentials).await
    }

    /// Tears the channel down immediately. Room subscriptions are kept and
    /// reissued by the next `connect`.
    /// Any connect still in progress is cancelled.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.epoch += 1;
        if let Some(driver) = inner.driver.take() {
            driver.abort();
        }
        inner.release_link();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Fire-and-forget. Nothing is queued while the channel is down.
    pub async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), SyncError> {
        self.send_frame(ClientFrame::Emit {
            event: event.to_string(),
            payload,
        })
        .await
    }

    pub async fn send_typing(
        &self,
        conversation_id: &ConversationId,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        self.emit(
            "typing",
            serde_json::json!({
                "conversation_id": conversation_id,
                "is_typing": is_typing,
            }),
        )
        .await
    }

    /// Records the room and joins it now if connected. Returns whether the
    /// join frame went out immediately.
    pub async fn subscribe_room(&self, conversation_id: ConversationId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.rooms.insert(conversation_id.clone());
        Self::send_locked(&inner, ClientFrame::JoinRoom { conversation_id }).is_ok()
    }

    pub async fn unsubscribe_room(&self, conversation_id: &ConversationId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.rooms.remove(conversation_id) {
            return false;
        }
        Self::send_locked(
            &inner,
            ClientFrame::LeaveRoom {
                conversation_id: conversation_id.clone(),
            },
        )
        .is_ok()
    }

    pub async fn rooms(&self) -> Vec<ConversationId> {
        self.inner.lock().await.rooms.iter().cloned().collect()
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<(), SyncError> {
        let inner = self.inner.lock().await;
        Self::send_locked(&inner, frame)
    }

    fn send_locked(inner: &SessionInner, frame: ClientFrame) -> Result<(), SyncError> {
        let outbound = inner.outbound.as_ref().ok_or(SyncError::NotConnected)?;
        outbound.send(frame).map_err(|_| SyncError::NotConnected)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "transport state changed");
            let _ = self.events.send(TransportEvent::StateChanged(state));
        }
    }

    /// Sets `state` only while `epoch` is still the current one.
    async fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        let inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return false;
        }
        self.set_state(state);
        true
    }

    /// Runs the bounded attempt loop. On a fresh connect the first attempt is
    /// immediate; on reconnect every attempt waits for its backoff delay.
    async fn establish(
        &self,
        credentials: &Credentials,
        reconnecting: bool,
        epoch: u64,
    ) -> Result<mpsc::UnboundedReceiver<String>, SyncError> {
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=self.policy.max_attempts {
            if reconnecting || attempt > 1 {
                if !self
                    .transition(epoch, ConnectionState::Reconnecting { attempt })
                    .await
                {
                    return Err(SyncError::ConnectCancelled);
                }
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }
            if self.inner.lock().await.epoch != epoch {
                return Err(SyncError::ConnectCancelled);
            }

            let link = match self.connector.open(credentials).await {
                Ok(link) => link,
                Err(ChannelConnectError::Rejected(reason)) => {
                    return Err(if self.fail_auth(epoch, &reason).await {
                        SyncError::TransportAuth(reason)
                    } else {
                        SyncError::ConnectCancelled
                    });
                }
                Err(ChannelConnectError::Unreachable(reason)) => {
                    warn!(attempt, max_attempts = self.policy.max_attempts, "channel connect failed: {reason}");
                    last_error = reason;
                    continue;
                }
            };

            match self.install(link, credentials, epoch).await {
                Ok(inbound) => {
                    info!(
                        actor_id = %credentials.actor_id,
                        tenant_id = %credentials.tenant_id,
                        attempt,
                        "channel connected"
                    );
                    return Ok(inbound);
                }
                Err(InstallError::Superseded) => {
                    debug!(attempt, "connect attempt superseded, link dropped");
                    return Err(SyncError::ConnectCancelled);
                }
                Err(InstallError::Closed(reason)) => {
                    warn!(attempt, "channel closed during handshake: {reason}");
                    last_error = reason;
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Err(SyncError::ConnectCancelled);
            }
            inner.release_link();
            inner.driver.take();
            self.set_state(ConnectionState::Offline);
        }
        error!(
            attempts = self.policy.max_attempts,
            "channel offline after exhausting reconnect attempts"
        );
        Err(SyncError::TransportConnect {
            attempts: self.policy.max_attempts,
            reason: last_error,
        })
    }

    /// Announces identity and reissues every room subscription on a new link.
    async fn install(
        &self,
        link: ChannelLink,
        credentials: &Credentials,
        epoch: u64,
    ) -> Result<mpsc::UnboundedReceiver<String>, InstallError> {
        let ChannelLink {
            outbound,
            inbound,
            io_tasks,
        } = link;
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            for task in io_tasks {
                task.abort();
            }
            return Err(InstallError::Superseded);
        }
        inner.release_link();

        let mut frames = vec![ClientFrame::Identify {
            actor_id: credentials.actor_id.clone(),
            display_name: credentials.display_name.clone(),
            tenant_id: credentials.tenant_id.clone(),
        }];
        frames.extend(inner.rooms.iter().map(|conversation_id| ClientFrame::JoinRoom {
            conversation_id: conversation_id.clone(),
        }));
        for frame in frames {
            if outbound.send(frame).is_err() {
                for task in io_tasks {
                    task.abort();
                }
                return Err(InstallError::Closed("link writer is gone".into()));
            }
        }

        inner.outbound = Some(outbound);
        inner.io_tasks = io_tasks;
        self.set_state(ConnectionState::Connected);
        Ok(inbound)
    }

    /// Tears the link down for good. Returns false when `epoch` was already
    /// superseded and nothing was touched.
    async fn fail_auth(&self, epoch: u64, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return false;
        }
        inner.release_link();
        inner.driver.take();
        self.set_state(ConnectionState::AuthRejected);
        error!("channel authentication rejected: {reason}");
        true
    }

    async fn drive(
        self: Arc<Self>,
        credentials: Credentials,
        mut inbound: mpsc::UnboundedReceiver<String>,
        epoch: u64,
    ) {
        loop {
            while let Some(text) = inbound.recv().await {
                match decode_frame(&text, &credentials.tenant_id) {
                    Ok(DecodedFrame::Push(event)) => {
                        let _ = self.events.send(TransportEvent::Push(event));
                    }
                    Ok(DecodedFrame::AuthRejected(reason)) => {
                        self.fail_auth(epoch, &reason).await;
                        return;
                    }
                    Ok(DecodedFrame::ServerError(api_error)) if api_error.is_auth() => {
                        self.fail_auth(epoch, &api_error.message).await;
                        return;
                    }
                    Ok(DecodedFrame::ServerError(api_error)) => {
                        warn!("server reported error on channel: {api_error}");
                        let _ = self.events.send(TransportEvent::ServerError(api_error));
                    }
                    Ok(DecodedFrame::ForeignTenant(_)) => {}
                    Err(err) => warn!("ignoring undecodable frame: {err}"),
                }
            }

            {
                let mut inner = self.inner.lock().await;
                if inner.epoch != epoch {
                    return;
                }
                inner.release_link();
            }
            info!("channel closed, reconnecting");
            match self.establish(&credentials, true, epoch).await {
                Ok(next) => inbound = next,
                Err(err) => {
                    debug!("channel driver stopped: {err}");
                    return;
                }
            }
        }
    }
}

/// WebSocket implementation of the channel. The endpoint is `<server>/ws`
/// with the scheme switched to `ws`/`wss`, authenticated by bearer header.
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    pub fn channel_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(anyhow!("server_url must start with http:// or https://")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive channel url from {}", self.server_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot be a base"))?
            .pop_if_empty()
            .push("ws");
        Ok(url)
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn open(&self, credentials: &Credentials) -> Result<ChannelLink, ChannelConnectError> {
        let url = self
            .channel_url()
            .map_err(|err| ChannelConnectError::Unreachable(err.to_string()))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelConnectError::Unreachable(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.bearer))
            .map_err(|_| ChannelConnectError::Rejected("bearer credential is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(WsError::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                return Err(ChannelConnectError::Rejected(format!(
                    "handshake returned {}",
                    response.status()
                )));
            }
            Err(err) => {
                return Err(ChannelConnectError::Unreachable(format!(
                    "failed to connect websocket {url}: {err}"
                )))
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(err) => {
                        error!("failed to serialize client frame: {err}");
                        continue;
                    }
                };
                if ws_writer.send(WsMessage::Text(json)).await.is_err() {
                    debug!("websocket send failed, channel closed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(ChannelLink {
            outbound,
            inbound,
            io_tasks: vec![writer, reader],
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
