//! Loopback HTTP listener that catches the identity provider's redirect.
//!
//! A listener is bound to the exact host and port declared by the redirect URI
//! and is shared by every concurrent sign-in attempt that uses the same
//! host:port. Attempts hold a [`LoopbackLease`]; once the last lease is dropped
//! the listener stops accepting and releases the port.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::config::redirect_host_port;
use crate::correlation::{CallbackParams, CorrelationRegistry};
use crate::errors::{AuthError, Result};

struct Attached {
    registry: Arc<CorrelationRegistry>,
    leases: usize,
}

#[derive(Default)]
struct ServerState {
    attached: Vec<Attached>,
    leases: usize,
    closed: bool,
}

/// A bound loopback listener
pub struct LoopbackServer {
    addr: SocketAddr,
    redirect_uri: Url,
    state: Mutex<ServerState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn attach(&self, registry: &Arc<CorrelationRegistry>) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }
        state.leases += 1;
        match state
            .attached
            .iter_mut()
            .find(|a| Arc::ptr_eq(&a.registry, registry))
        {
            Some(attached) => attached.leases += 1,
            None => state.attached.push(Attached {
                registry: registry.clone(),
                leases: 1,
            }),
        }
        true
    }

    fn detach(&self, registry: &Arc<CorrelationRegistry>) {
        let mut state = self.lock_state();
        if let Some(pos) = state
            .attached
            .iter()
            .position(|a| Arc::ptr_eq(&a.registry, registry))
        {
            state.attached[pos].leases -= 1;
            if state.attached[pos].leases == 0 {
                state.attached.swap_remove(pos);
            }
        }
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 && !state.closed {
            state.closed = true;
            let _ = self.shutdown.send(true);
            debug!(addr = %self.addr, "Last sign-in attempt finished, closing loopback listener");
        }
    }

    /// Registry that is waiting on `state`, if any
    fn registry_for(&self, state: &str) -> Option<Arc<CorrelationRegistry>> {
        self.lock_state()
            .attached
            .iter()
            .find(|a| a.registry.is_pending(state))
            .map(|a| a.registry.clone())
    }

    async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let addr = self.addr;
        let app = Router::new()
            .route(self.redirect_uri.path(), get(handle_callback))
            .with_state(self);

        let served = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(e) = served.await {
            warn!(%addr, "Loopback listener failed: {}", e);
        }
        info!(%addr, "Loopback listener stopped");
    }
}

/// Anything without a pending state (favicon.ico and friends) is not ours
async fn handle_callback(
    State(server): State<Arc<LoopbackServer>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let params = params.normalized();
    let Some(state) = params.state.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(registry) = server.registry_for(&state) else {
        trace!("Redirect for an unknown state ignored");
        return StatusCode::NOT_FOUND.into_response();
    };

    let page = if params.error.is_some() {
        AckPage::error()
    } else {
        AckPage::success()
    };
    registry.resolve(&state, params.into_outcome());
    Html(page.render()).into_response()
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("addr", &self.addr)
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Keeps a loopback listener alive for one sign-in attempt
pub struct LoopbackLease {
    server: Arc<LoopbackServer>,
    registry: Arc<CorrelationRegistry>,
}

impl LoopbackLease {
    pub fn redirect_uri(&self) -> &Url {
        self.server.redirect_uri()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<LoopbackServer> {
        &self.server
    }
}

impl Drop for LoopbackLease {
    fn drop(&mut self) {
        self.server.detach(&self.registry);
    }
}

impl std::fmt::Debug for LoopbackLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLease")
            .field("addr", &self.server.addr)
            .finish()
    }
}

/// Listeners currently bound in this process, keyed by host:port
#[derive(Default)]
pub struct LoopbackPool {
    servers: tokio::sync::Mutex<HashMap<(String, u16), Arc<LoopbackServer>>>,
}

impl LoopbackPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool shared by every orchestrator in the process
    pub fn shared() -> Arc<LoopbackPool> {
        static SHARED: OnceLock<Arc<LoopbackPool>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(LoopbackPool::new())).clone()
    }

    /// Start or join the listener for `redirect_uri`
    ///
    /// Fails with [`AuthError::AddressInUse`] when another process holds the port.
    #[instrument(skip(self, redirect_uri, registry), fields(redirect_uri = %redirect_uri))]
    pub async fn start(
        &self,
        redirect_uri: &Url,
        registry: Arc<CorrelationRegistry>,
    ) -> Result<LoopbackLease> {
        let (host, port) = redirect_host_port(redirect_uri)?;
        let mut servers = self.servers.lock().await;

        if let Some(existing) = servers.get(&(host.clone(), port)).cloned() {
            if existing.attach(&registry) {
                debug!(addr = %existing.addr, "Joining running loopback listener");
                return Ok(LoopbackLease {
                    server: existing,
                    registry,
                });
            }
            // Closing listener: wait until it has released the port
            servers.remove(&(host.clone(), port));
            let task = existing
                .task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }

        let addr = resolve_bind_addr(&host, port).await?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                AuthError::AddressInUse { addr }
            } else {
                AuthError::Io(e)
            }
        })?;
        let addr = listener.local_addr()?;
        info!(%addr, "Loopback listener bound");

        // Port 0 asks the OS for a free port; the redirect URI must carry the real one
        let mut bound_uri = redirect_uri.clone();
        if port == 0 && bound_uri.set_port(Some(addr.port())).is_err() {
            return Err(AuthError::Configuration(format!(
                "cannot set port on redirect URI {redirect_uri}"
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(LoopbackServer {
            addr,
            redirect_uri: bound_uri,
            state: Mutex::new(ServerState::default()),
            shutdown: shutdown_tx,
            task: Mutex::new(None),
        });
        server.attach(&registry);

        let task = tokio::spawn(server.clone().run(listener, shutdown_rx));
        *server
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        servers.insert((host, port), server.clone());
        Ok(LoopbackLease { server, registry })
    }

    /// Number of listeners that are still accepting connections
    pub async fn active_count(&self) -> usize {
        self.servers
            .lock()
            .await
            .values()
            .filter(|s| !s.is_closed())
            .count()
    }
}

impl std::fmt::Debug for LoopbackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackPool").finish_non_exhaustive()
    }
}

/// Exact address for `host`; names resolve to their first (IPv4 preferred) address
async fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| AuthError::Configuration(format!("redirect host {host} did not resolve")))
}

struct AckPage {
    page_title: &'static str,
    content_title: &'static str,
    content_message: &'static str,
}

impl AckPage {
    fn success() -> Self {
        Self {
            page_title: "Sign in successful",
            content_title: "Sign in was successful!",
            content_message: "You can close this browser window and return to the application.",
        }
    }

    fn error() -> Self {
        Self {
            page_title: "Sign in error",
            content_title: "Sign in error",
            content_message: "Please check your application's error console.",
        }
    }

    fn render(&self) -> String {
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{}</title></head>\
             <body><h1>{}</h1><p>{}</p></body></html>",
            self.page_title, self.content_title, self.content_message
        )
    }
}
