use super::routes;
use crate::auth::AuthError;
use crate::confirm::ConfirmationCoordinator;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Default idle period before an unused listener is shut down
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("Failed to bind callback server on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("An OAuth login is already waiting for its redirect")]
    FlowInProgress,

    #[error("Invalid callback URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<CallbackError> for AuthError {
    fn from(err: CallbackError) -> Self {
        AuthError::CallbackServer(err.to_string())
    }
}

/// Observable lifecycle of the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Listening(SocketAddr),
}

/// What the OAuth redirect delivered
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectOutcome {
    /// Authorization-code flow
    Code(String),
    /// Implicit flow; the token arrived in the URL fragment
    Implicit {
        access_token: String,
        expires_in: Option<u64>,
    },
    /// The user (or the platform) refused the authorization
    Denied { error: String, description: String },
}

/// Why a redirect could not be delivered to a waiting login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    NoFlow,
    StateMismatch,
}

/// The login currently waiting on `/callback`
pub(crate) struct PendingRedirect {
    state: String,
    tx: oneshot::Sender<RedirectOutcome>,
}

/// State shared with the route handlers
pub(crate) struct RouteState {
    pending_redirect: Mutex<Option<PendingRedirect>>,
    pub(crate) coordinator: ConfirmationCoordinator,
}

impl RouteState {
    fn pending(&self) -> MutexGuard<'_, Option<PendingRedirect>> {
        self.pending_redirect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a redirect to the waiting login if `state` matches its nonce.
    ///
    /// A mismatched state leaves the waiting login untouched.
    pub(crate) fn deliver(
        &self,
        state: &str,
        outcome: RedirectOutcome,
    ) -> Result<(), DeliveryError> {
        let mut pending = self.pending();
        match pending.as_ref() {
            None => return Err(DeliveryError::NoFlow),
            Some(flow) if flow.state != state => return Err(DeliveryError::StateMismatch),
            Some(_) => {}
        }

        let flow = pending.take().ok_or(DeliveryError::NoFlow)?;
        flow.tx.send(outcome).map_err(|_| DeliveryError::NoFlow)
    }
}

struct Lifecycle {
    leases: usize,
    /// Bumped on every start and stop so leases from an earlier run are ignored
    generation: u64,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

struct Inner {
    host: String,
    port: u16,
    idle_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    status: watch::Sender<ServerStatus>,
    routes: Arc<RouteState>,
}

/// Process-wide local HTTP listener for OAuth redirects and change
/// confirmations.
///
/// Started lazily by the first `acquire`, shared by every holder of a
/// [`CallbackLease`], and shut down once the last lease has been released
/// for `idle_timeout` (or immediately on `stop`). Clones share one listener.
#[derive(Clone)]
pub struct CallbackServer {
    inner: Arc<Inner>,
}

impl CallbackServer {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        idle_timeout: Duration,
        coordinator: ConfirmationCoordinator,
    ) -> Self {
        let (status, _) = watch::channel(ServerStatus::Stopped);

        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                idle_timeout,
                lifecycle: Mutex::new(Lifecycle {
                    leases: 0,
                    generation: 0,
                    shutdown: None,
                    task: None,
                    idle_timer: None,
                }),
                status,
                routes: Arc::new(RouteState {
                    pending_redirect: Mutex::new(None),
                    coordinator,
                }),
            }),
        }
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.inner.status.subscribe()
    }

    /// Coordinator whose confirmations this listener serves
    pub fn coordinator(&self) -> &ConfirmationCoordinator {
        &self.inner.routes.coordinator
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// The router served by the listener, for driving it without a socket
    pub fn router(&self) -> axum::Router {
        routes::router(self.inner.routes.clone())
    }

    /// Number of live leases on the current run
    pub fn lease_count(&self) -> usize {
        self.lifecycle().leases
    }

    /// Take a lease, starting the listener if it is not already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn acquire(&self) -> Result<CallbackLease, CallbackError> {
        let mut lifecycle = self.lifecycle();

        if let Some(timer) = lifecycle.idle_timer.take() {
            timer.abort();
        }

        let addr = match self.status() {
            ServerStatus::Listening(addr) => addr,
            _ => self.start_locked(&mut lifecycle)?,
        };

        lifecycle.leases += 1;
        debug!(leases = lifecycle.leases, "Callback server lease acquired");

        Ok(CallbackLease {
            server: self.clone(),
            generation: lifecycle.generation,
            base_url: self.base_url_for(addr)?,
            immediate: false,
        })
    }

    /// Shut the listener down now, regardless of outstanding leases, and
    /// wait for it to release the port
    pub async fn stop(&self) {
        let task = {
            let mut lifecycle = self.lifecycle();
            self.shutdown_locked(&mut lifecycle, "explicit stop")
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Callback server task failed");
                }
            }
        }
    }

    /// Register the CSRF nonce of a login about to redirect here
    pub fn expect_redirect(
        &self,
        state: String,
    ) -> Result<oneshot::Receiver<RedirectOutcome>, CallbackError> {
        let mut pending = self.inner.routes.pending();

        if let Some(flow) = pending.as_ref() {
            if !flow.tx.is_closed() {
                return Err(CallbackError::FlowInProgress);
            }
        }

        let (tx, rx) = oneshot::channel();
        *pending = Some(PendingRedirect { state, tx });
        Ok(rx)
    }

    /// Forget the nonce registered for `state`, if it is still waiting
    pub fn cancel_redirect(&self, state: &str) {
        let mut pending = self.inner.routes.pending();
        if pending.as_ref().is_some_and(|flow| flow.state == state) {
            *pending = None;
            debug!("Pending OAuth redirect cancelled");
        }
    }

    /// Whether a login is currently waiting on `/callback`
    pub fn redirect_pending(&self) -> bool {
        self.inner
            .routes
            .pending()
            .as_ref()
            .is_some_and(|flow| !flow.tx.is_closed())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn base_url_for(&self, addr: SocketAddr) -> Result<Url, CallbackError> {
        Ok(Url::parse(&format!(
            "http://{}:{}/",
            self.inner.host,
            addr.port()
        ))?)
    }

    fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<SocketAddr, CallbackError> {
        self.inner.status.send_replace(ServerStatus::Starting);

        let bind_addr = format!("{}:{}", self.inner.host, self.inner.port);
        let bind_error = |e: std::io::Error| CallbackError::Bind {
            addr: bind_addr.clone(),
            reason: e.to_string(),
        };

        let bound = std::net::TcpListener::bind(&bind_addr)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .and_then(tokio::net::TcpListener::from_std)
            .and_then(|listener| {
                let addr = listener.local_addr()?;
                Ok((listener, addr))
            });

        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.status.send_replace(ServerStatus::Stopped);
                return Err(bind_error(e));
            }
        };

        let app = routes::router(self.inner.routes.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "Callback server stopped with error");
            }
        });

        lifecycle.generation += 1;
        lifecycle.leases = 0;
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.task = Some(task);

        self.inner.status.send_replace(ServerStatus::Listening(addr));
        info!(
            addr = %addr,
            callback_url = %format!("http://{}:{}/callback", self.inner.host, addr.port()),
            "Callback server listening"
        );

        Ok(addr)
    }

    fn shutdown_locked(&self, lifecycle: &mut Lifecycle, reason: &str) -> Option<JoinHandle<()>> {
        if let Some(timer) = lifecycle.idle_timer.take() {
            timer.abort();
        }

        let shutdown = lifecycle.shutdown.take()?;
        let _ = shutdown.send(());

        lifecycle.leases = 0;
        lifecycle.generation += 1;

        // A login can't complete without the listener; drop its nonce
        *self.inner.routes.pending() = None;

        self.inner.status.send_replace(ServerStatus::Stopped);
        info!(reason = reason, "Callback server shutting down");

        lifecycle.task.take()
    }

    fn release(&self, generation: u64, immediate: bool) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation != generation || lifecycle.shutdown.is_none() {
            return;
        }

        lifecycle.leases = lifecycle.leases.saturating_sub(1);
        debug!(leases = lifecycle.leases, "Callback server lease released");
        if lifecycle.leases > 0 {
            return;
        }

        if immediate || self.inner.idle_timeout.is_zero() {
            self.shutdown_locked(&mut lifecycle, "no remaining consumers");
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let server = self.clone();
                let idle_timeout = self.inner.idle_timeout;
                lifecycle.idle_timer = Some(handle.spawn(async move {
                    tokio::time::sleep(idle_timeout).await;
                    server.stop_if_idle(generation);
                }));
            }
            Err(_) => {
                self.shutdown_locked(&mut lifecycle, "no runtime for idle timer");
            }
        }
    }

    fn stop_if_idle(&self, generation: u64) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation == generation && lifecycle.leases == 0 {
            // This is the timer task itself; don't abort it
            lifecycle.idle_timer = None;
            self.shutdown_locked(&mut lifecycle, "idle timeout");
        }
    }
}

/// Keeps the callback server listening while held
pub struct CallbackLease {
    server: CallbackServer,
    generation: u64,
    base_url: Url,
    immediate: bool,
}

impl CallbackLease {
    /// Root URL of the listener, e.g. `http://localhost:8888/`
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// OAuth redirect URI served by this listener
    pub fn callback_url(&self) -> Result<Url, CallbackError> {
        Ok(self.base_url.join("callback")?)
    }

    pub fn server(&self) -> &CallbackServer {
        &self.server
    }

    /// Release the lease and, if it was the last one, stop the listener
    /// without waiting for the idle timeout
    pub fn close(mut self) {
        self.immediate = true;
    }
}

impl Drop for CallbackLease {
    fn drop(&mut self) {
        self.server.release(self.generation, self.immediate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(idle: Duration) -> CallbackServer {
        CallbackServer::new("127.0.0.1", 0, idle, ConfirmationCoordinator::default())
    }

    #[tokio::test]
    async fn test_lazy_start_and_reuse() {
        let server = server(DEFAULT_IDLE_TIMEOUT);
        assert_eq!(server.status(), ServerStatus::Stopped);

        let first = server.acquire().unwrap();
        let second = server.acquire().unwrap();

        assert!(matches!(server.status(), ServerStatus::Listening(_)));
        assert_eq!(first.base_url(), second.base_url());
        assert_eq!(server.lease_count(), 2);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_close_last_lease_stops_immediately() {
        let server = server(DEFAULT_IDLE_TIMEOUT);
        let first = server.acquire().unwrap();
        let second = server.acquire().unwrap();

        first.close();
        assert!(matches!(server.status(), ServerStatus::Listening(_)));

        second.close();
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_idle_teardown() {
        let server = server(Duration::from_millis(50));
        let lease = server.acquire().unwrap();
        drop(lease);

        assert!(matches!(server.status(), ServerStatus::Listening(_)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_reacquire_cancels_idle_teardown() {
        let server = server(Duration::from_millis(50));
        drop(server.acquire().unwrap());
        let lease = server.acquire().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(server.status(), ServerStatus::Listening(_)));

        drop(lease);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stale_lease_after_stop_is_ignored() {
        let server = server(DEFAULT_IDLE_TIMEOUT);
        let old = server.acquire().unwrap();
        server.stop().await;

        let fresh = server.acquire().unwrap();
        old.close();

        assert!(matches!(server.status(), ServerStatus::Listening(_)));
        assert_eq!(server.lease_count(), 1);

        fresh.close();
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_reports_stopped() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let server = CallbackServer::new(
            "127.0.0.1",
            port,
            DEFAULT_IDLE_TIMEOUT,
            ConfirmationCoordinator::default(),
        );

        assert!(matches!(server.acquire(), Err(CallbackError::Bind { .. })));
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_redirect_delivery_checks_state() {
        let server = server(DEFAULT_IDLE_TIMEOUT);
        let rx = server.expect_redirect("nonce-1".to_string()).unwrap();
        let routes = server.inner.routes.clone();

        assert_eq!(
            routes.deliver("forged", RedirectOutcome::Code("x".to_string())),
            Err(DeliveryError::StateMismatch)
        );
        assert!(server.redirect_pending());

        routes
            .deliver("nonce-1", RedirectOutcome::Code("abc".to_string()))
            .unwrap();
        assert_eq!(rx.await.unwrap(), RedirectOutcome::Code("abc".to_string()));
        assert!(!server.redirect_pending());
    }

    #[tokio::test]
    async fn test_second_flow_rejected_while_first_waits() {
        let server = server(DEFAULT_IDLE_TIMEOUT);
        let _rx = server.expect_redirect("one".to_string()).unwrap();

        assert!(matches!(
            server.expect_redirect("two".to_string()),
            Err(CallbackError::FlowInProgress)
        ));

        server.cancel_redirect("one");
        assert!(server.expect_redirect("two".to_string()).is_ok());
    }
}
