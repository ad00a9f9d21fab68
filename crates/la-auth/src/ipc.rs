//! Cross-process access to an orchestrator.
//!
//! A backend process owns the [`AuthorizationOrchestrator`]; other processes
//! talk to it with newline-delimited JSON frames over any byte stream (a pipe,
//! a Unix socket, the child's stdin/stdout). Channels are namespaced by client
//! id so several clients can share one transport.
//!
//! ```text
//! -> {"kind":"request","id":1,"channel":"loopauth.desktop-app/getAccessToken"}
//! <- {"kind":"notification","channel":"loopauth.desktop-app/accessTokenChanged","payload":"Bearer ..."}
//! <- {"kind":"response","id":1,"result":"Bearer ..."}
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, instrument, warn};

use crate::config::STORAGE_PREFIX;
use crate::errors::{AuthError, Result};
use crate::events::{TokenEvent, TokenEvents};
use crate::orchestrator::AuthorizationOrchestrator;
use crate::store::encode_component;

/// Longest frame either side accepts, newline excluded
pub const MAX_FRAME_LEN: usize = 64 * 1024;

fn frame_reader<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

fn read_error(e: LinesCodecError) -> AuthError {
    match e {
        LinesCodecError::Io(e) => AuthError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            AuthError::Ipc(format!("frame longer than {MAX_FRAME_LEN} bytes"))
        }
    }
}

/// Operations callable over IPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcMethod {
    SignIn,
    SignInSilent,
    GetAccessToken,
    SignOut,
}

impl IpcMethod {
    pub const ALL: [IpcMethod; 4] = [
        Self::SignIn,
        Self::SignInSilent,
        Self::GetAccessToken,
        Self::SignOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignIn => "signIn",
            Self::SignInSilent => "signInSilent",
            Self::GetAccessToken => "getAccessToken",
            Self::SignOut => "signOut",
        }
    }
}

/// Channel names for one client id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    namespace: String,
}

impl ChannelNames {
    pub fn for_client(client_id: &str) -> Self {
        Self {
            namespace: format!("{}.{}", STORAGE_PREFIX, encode_component(client_id)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn request(&self, method: IpcMethod) -> String {
        format!("{}/{}", self.namespace, method.as_str())
    }

    pub fn access_token_changed(&self) -> String {
        format!("{}/accessTokenChanged", self.namespace)
    }

    pub fn expiration_changed(&self) -> String {
        format!("{}/accessTokenExpirationChanged", self.namespace)
    }

    pub fn method_for(&self, channel: &str) -> Option<IpcMethod> {
        IpcMethod::ALL
            .into_iter()
            .find(|m| self.request(*m) == channel)
    }
}

/// One line on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Frame {
    Request {
        id: u64,
        channel: String,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Notification {
        channel: String,
        payload: Value,
    },
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Frame>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = serde_json::to_string(&frame).map_err(std::io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

fn notification_for(names: &ChannelNames, event: TokenEvent) -> Frame {
    match event {
        TokenEvent::AccessTokenChanged(token) => Frame::Notification {
            channel: names.access_token_changed(),
            payload: Value::String(token),
        },
        TokenEvent::ExpirationChanged(expiry) => Frame::Notification {
            channel: names.expiration_changed(),
            payload: expiry
                .map(|e| Value::String(e.to_rfc3339()))
                .unwrap_or(Value::Null),
        },
    }
}

fn event_for(names: &ChannelNames, channel: &str, payload: Value) -> Option<TokenEvent> {
    if channel == names.access_token_changed() {
        return Some(TokenEvent::AccessTokenChanged(
            payload.as_str().unwrap_or_default().to_string(),
        ));
    }
    if channel == names.expiration_changed() {
        let expiry = payload
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        return Some(TokenEvent::ExpirationChanged(expiry));
    }
    None
}

/// Serves an orchestrator to one connected peer
pub struct IpcBackend {
    orchestrator: Arc<AuthorizationOrchestrator>,
    names: ChannelNames,
}

impl IpcBackend {
    pub fn new(orchestrator: Arc<AuthorizationOrchestrator>) -> Self {
        let names = ChannelNames::for_client(&orchestrator.config().client_id);
        Self {
            orchestrator,
            names,
        }
    }

    pub fn names(&self) -> &ChannelNames {
        &self.names
    }

    /// Answer requests until the peer closes its end
    ///
    /// Requests run concurrently, so a pending `signIn` does not hold up
    /// `getAccessToken`. Token events are pushed as notifications.
    #[instrument(skip_all, fields(namespace = %self.names.namespace))]
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, rx));

        let mut events = self.orchestrator.subscribe();
        let names = self.names.clone();
        let notify_tx = tx.clone();
        let notifier = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if notify_tx.send(notification_for(&names, event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "IPC peer missed token notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut handlers = JoinSet::new();
        let mut frames = frame_reader(reader);
        let mut failure = None;
        while let Some(line) = frames.next().await {
            while handlers.try_join_next().is_some() {}
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    let e = read_error(e);
                    warn!("Dropping IPC peer: {}", e);
                    failure = Some(e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Frame>(&line) {
                Ok(Frame::Request { id, channel }) => {
                    let orchestrator = self.orchestrator.clone();
                    let method = self.names.method_for(&channel);
                    let tx = tx.clone();
                    handlers.spawn(async move {
                        let frame = match method {
                            Some(method) => respond(&orchestrator, id, method).await,
                            None => Frame::Response {
                                id,
                                result: None,
                                error: Some(format!("unknown channel {channel}")),
                            },
                        };
                        let _ = tx.send(frame);
                    });
                }
                Ok(_) => debug!("Ignoring frame that is not a request"),
                Err(e) => warn!("Malformed IPC frame: {}", e),
            }
        }

        debug!("IPC peer disconnected");
        // Requests already read still get their answer
        while handlers.join_next().await.is_some() {}
        notifier.abort();
        let _ = notifier.await;
        drop(tx);

        writer_task
            .await
            .map_err(|e| AuthError::Ipc(format!("writer task failed: {}", e)))??;
        failure.map_or(Ok(()), Err)
    }
}

async fn respond(orchestrator: &AuthorizationOrchestrator, id: u64, method: IpcMethod) -> Frame {
    let result = match method {
        IpcMethod::SignIn => orchestrator.sign_in().await.map(Value::String),
        IpcMethod::SignInSilent => Ok(Value::Bool(orchestrator.sign_in_silent().await)),
        IpcMethod::GetAccessToken => orchestrator.get_access_token().await.map(Value::String),
        IpcMethod::SignOut => {
            orchestrator.sign_out().await;
            Ok(Value::Null)
        }
    };

    match result {
        Ok(value) => Frame::Response {
            id,
            result: Some(value),
            error: None,
        },
        Err(e) => Frame::Response {
            id,
            result: None,
            error: Some(e.to_string()),
        },
    }
}

type Reply = oneshot::Sender<std::result::Result<Value, String>>;

/// Outstanding calls by id; `None` once the connection is gone
type Pending = Arc<Mutex<Option<HashMap<u64, Reply>>>>;

/// Remote handle on an orchestrator served by [`IpcBackend`]
pub struct IpcClient {
    names: ChannelNames,
    next_id: AtomicU64,
    pending: Pending,
    outgoing: mpsc::UnboundedSender<Frame>,
    events: TokenEvents,
    reader: JoinHandle<()>,
}

impl IpcClient {
    pub fn connect<R, W>(client_id: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let names = ChannelNames::for_client(client_id);
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let events = TokenEvents::new();
        let (outgoing, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = write_frames(writer, rx).await {
                debug!("IPC writer stopped: {}", e);
            }
        });

        let reader = tokio::spawn(read_responses(
            reader,
            names.clone(),
            pending.clone(),
            events.clone(),
        ));

        Self {
            names,
            next_id: AtomicU64::new(1),
            pending,
            outgoing,
            events,
            reader,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    async fn call(&self, method: IpcMethod) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
        {
            Some(pending) => pending.insert(id, tx),
            None => return Err(AuthError::Ipc("connection closed".to_string())),
        };

        self.outgoing
            .send(Frame::Request {
                id,
                channel: self.names.request(method),
            })
            .map_err(|_| AuthError::Ipc("connection closed".to_string()))?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(AuthError::Ipc(message)),
            Err(_) => Err(AuthError::Ipc("connection closed".to_string())),
        }
    }

    pub async fn sign_in(&self) -> Result<String> {
        expect_string(self.call(IpcMethod::SignIn).await?)
    }

    pub async fn sign_in_silent(&self) -> Result<bool> {
        self.call(IpcMethod::SignInSilent)
            .await?
            .as_bool()
            .ok_or_else(|| AuthError::Ipc("expected a boolean result".to_string()))
    }

    pub async fn get_access_token(&self) -> Result<String> {
        expect_string(self.call(IpcMethod::GetAccessToken).await?)
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.call(IpcMethod::SignOut).await.map(|_| ())
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("namespace", &self.names.namespace)
            .finish_non_exhaustive()
    }
}

fn expect_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(AuthError::Ipc("expected a string result".to_string())),
    }
}

async fn read_responses<R>(reader: R, names: ChannelNames, pending: Pending, events: TokenEvents)
where
    R: AsyncRead + Unpin,
{
    let mut frames = frame_reader(reader);
    while let Some(line) = frames.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("IPC read failed: {}", read_error(e));
                break;
            }
        };

        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Response { id, result, error }) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .as_mut()
                    .and_then(|p| p.remove(&id));
                if let Some(waiter) = waiter {
                    let outcome = match error {
                        Some(message) => Err(message),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = waiter.send(outcome);
                }
            }
            Ok(Frame::Notification { channel, payload }) => {
                if let Some(event) = event_for(&names, &channel, payload) {
                    events.publish(event);
                }
            }
            Ok(Frame::Request { .. }) => debug!("Ignoring request sent to a client"),
            Err(e) => warn!("Malformed IPC frame: {}", e),
        }
    }

    // Fails every outstanding and future call
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
}
