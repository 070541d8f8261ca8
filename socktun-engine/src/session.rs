//! Session controller
//!
//! Drives one tunnel session at a time through
//! `Idle -> Connecting -> Connected -> Disconnecting -> Idle`, with `Failed`
//! as the other resting state. The state lives in a single `watch` cell;
//! every transition is a compare-and-set on that cell keyed by the session
//! id, so a late writer from an old session can never overwrite a newer one.
//!
//! The engine call blocks for the life of the tunnel, so it runs on its own
//! thread. A supervisor task waits for it, releases the interface and
//! publishes the final state. Disconnect signals the engine and waits for the
//! supervisor up to the configured timeout, then releases the interface
//! itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socktun_tun::{InterfaceHandle, TunPlatform};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::endpoint::ProxyEndpoint;
use crate::engine::{EngineInvocation, TunnelEngine};
use crate::error::{Error, Result};
use crate::event::{
    EventHandler, FailureKind, FailureReason, LogLevel, LoggingEventHandler, SessionEvent,
    SessionSnapshot, SessionState,
};
use crate::interface::{HostResolver, TunnelInterfaceBuilder};
use crate::store::{run_blocking, ProfileStore};

/// How often a stop request is repeated while the engine keeps running
const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(250);

type InterfaceSlot = Arc<Mutex<Option<InterfaceHandle>>>;

/// Resources of the session in flight
struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
    interface: InterfaceSlot,
}

struct Inner {
    builder: TunnelInterfaceBuilder,
    engine: Arc<dyn TunnelEngine>,
    event_handler: Arc<dyn EventHandler>,
    state_tx: watch::Sender<SessionSnapshot>,
    active: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
    stop_timeout: Duration,
}

/// Builder for [`SessionController`]
pub struct SessionControllerBuilder {
    builder: TunnelInterfaceBuilder,
    engine: Arc<dyn TunnelEngine>,
    event_handler: Arc<dyn EventHandler>,
    stop_timeout: Duration,
}

impl SessionControllerBuilder {
    /// Use a custom resolver for proxy host names
    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.builder = self.builder.with_resolver(resolver);
        self
    }

    /// Set a custom event handler
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Override the disconnect timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn build(self) -> SessionController {
        let (state_tx, _) = watch::channel(SessionSnapshot::initial());
        SessionController {
            inner: Arc::new(Inner {
                builder: self.builder,
                engine: self.engine,
                event_handler: self.event_handler,
                state_tx,
                active: Mutex::new(None),
                next_id: AtomicU64::new(1),
                stop_timeout: self.stop_timeout,
            }),
        }
    }
}

/// Owns the tunnel session lifecycle
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Start building a controller
    pub fn builder(
        settings: TunnelConfig,
        platform: Arc<dyn TunPlatform>,
        engine: Arc<dyn TunnelEngine>,
    ) -> SessionControllerBuilder {
        let stop_timeout = settings.stop_timeout();
        SessionControllerBuilder {
            builder: TunnelInterfaceBuilder::new(platform, settings),
            engine,
            event_handler: Arc::new(LoggingEventHandler),
            stop_timeout,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().state.clone()
    }

    /// Current state together with its session id and endpoint
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state_tx.subscribe()
    }

    /// Start a session to `endpoint`
    ///
    /// Rejects with [`Error::InvalidConfig`] or [`Error::SessionBusy`]
    /// without touching any state. Otherwise waits until the attempt leaves
    /// `Connecting` and returns the state it reached; failures are reported
    /// as [`SessionState::Failed`], not as errors.
    pub async fn connect(&self, endpoint: ProxyEndpoint) -> Result<SessionState> {
        endpoint.validate()?;

        let id = {
            let mut active = self.inner.active.lock().await;

            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            let mut applied = None;
            self.inner.state_tx.send_if_modified(|snapshot| {
                if !snapshot.state.is_at_rest() {
                    return false;
                }
                let old = std::mem::replace(&mut snapshot.state, SessionState::Connecting);
                snapshot.session_id = id;
                snapshot.endpoint = Some(endpoint.clone());
                applied = Some((old, snapshot.clone()));
                true
            });
            let Some((old, snapshot)) = applied else {
                log::info!("Rejecting connect to {}: session busy", endpoint);
                return Err(Error::SessionBusy);
            };

            log::info!("Session {} connecting to {}", id, endpoint);
            self.inner.publish(old, snapshot).await;

            let cancel = CancellationToken::new();
            let interface: InterfaceSlot = Arc::new(Mutex::new(None));
            let supervisor = tokio::spawn(self.inner.clone().run_session(
                id,
                endpoint,
                cancel.clone(),
                interface.clone(),
            ));

            *active = Some(ActiveSession {
                id,
                cancel,
                supervisor,
                interface,
            });
            id
        };

        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|s| s.session_id != id || s.state != SessionState::Connecting)
            .await
            .map_err(|_| Error::InterfaceCreation("session controller dropped".into()))?;
        Ok(if settled.session_id == id {
            settled.state.clone()
        } else {
            SessionState::Idle
        })
    }

    /// Start a session to the store's selected profile
    pub async fn connect_selected(&self, store: Arc<dyn ProfileStore>) -> Result<SessionState> {
        let selected = run_blocking(&store, |store| store.selected())
            .await?
            .ok_or_else(|| Error::InvalidConfig("no profile selected".into()))?;
        self.connect(selected.endpoint).await
    }

    /// Stop the current session
    ///
    /// A no-op when nothing is running. Otherwise signals the engine, waits
    /// up to the stop timeout for the session to wind down, and releases the
    /// interface regardless.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(mut session) = self.inner.active.lock().await.take() else {
            return Ok(());
        };

        let applied = self.inner.transition(session.id, SessionState::Disconnecting, |state| {
            matches!(state, SessionState::Connecting | SessionState::Connected)
        });
        let Some((old, snapshot)) = applied else {
            // already at rest; the supervisor has finished or is finishing
            return Ok(());
        };
        log::info!("Session {} disconnecting", session.id);
        self.inner.publish(old, snapshot).await;

        session.cancel.cancel();
        self.inner.engine.stop();

        match tokio::time::timeout(self.inner.stop_timeout, &mut session.supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("Session {} supervisor failed: {}", session.id, e);
                self.inner.force_release(&session).await;
            }
            Err(_) => {
                log::warn!(
                    "Session {} did not stop within {:?}, releasing interface",
                    session.id,
                    self.inner.stop_timeout
                );
                session.supervisor.abort();
                self.inner.force_release(&session).await;
            }
        }
        Ok(())
    }

    /// Disconnect as part of process teardown
    pub async fn shutdown(&self) {
        if let Err(e) = self.disconnect().await {
            log::warn!("Error during session shutdown: {}", e);
        }
    }
}

impl Inner {
    /// Compare-and-set the state of session `id`
    ///
    /// Returns the previous state and the new snapshot when the transition
    /// was applied.
    fn transition(
        &self,
        id: u64,
        new: SessionState,
        from: impl FnOnce(&SessionState) -> bool,
    ) -> Option<(SessionState, SessionSnapshot)> {
        let mut applied = None;
        self.state_tx.send_if_modified(|snapshot| {
            if snapshot.session_id != id || !from(&snapshot.state) {
                return false;
            }
            let old = std::mem::replace(&mut snapshot.state, new);
            applied = Some((old, snapshot.clone()));
            true
        });
        applied
    }

    async fn publish(&self, old: SessionState, snapshot: SessionSnapshot) {
        self.event_handler
            .on_event(SessionEvent::StateChanged {
                old,
                new: snapshot.state.clone(),
            })
            .await;
        if let Some(notification) = snapshot.notification() {
            self.event_handler
                .on_event(SessionEvent::Status(notification))
                .await;
        }
    }

    /// Move session `id` to a resting state from wherever it is
    async fn settle(&self, id: u64, state: SessionState) {
        if let Some((old, snapshot)) = self.transition(id, state, |s| !s.is_at_rest()) {
            log::info!("Session {} {}", id, snapshot.state);
            self.publish(old, snapshot).await;
        }
    }

    async fn fail(&self, id: u64, err: &Error) {
        log::error!("Session {} failed: {}", id, err);
        self.settle(id, SessionState::Failed(FailureReason::from_error(err)))
            .await;
    }

    async fn release(&self, id: u64, slot: &InterfaceSlot) {
        let handle = slot.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                log::warn!("Session {}: error closing interface: {}", id, e);
            }
        }
    }

    /// Release the interface after a stop that did not complete
    async fn force_release(&self, session: &ActiveSession) {
        self.release(session.id, &session.interface).await;
        self.settle(session.id, SessionState::Idle).await;
    }

    async fn run_session(
        self: Arc<Self>,
        id: u64,
        endpoint: ProxyEndpoint,
        cancel: CancellationToken,
        slot: InterfaceSlot,
    ) {
        let built = match self.builder.build(&endpoint).await {
            Ok(built) => built,
            Err(e) => {
                self.fail(id, &e).await;
                return;
            }
        };

        if built.proxy_addr.is_none() {
            self.event_handler
                .on_event(SessionEvent::Log {
                    level: LogLevel::Warning,
                    message: format!(
                        "proxy {} could not be resolved; all traffic is routed into the tunnel",
                        endpoint.host
                    ),
                })
                .await;
        }

        let handle = built.handle;
        let invocation = EngineInvocation::new(handle.fd(), handle.mtu(), &endpoint);
        *slot.lock().await = Some(handle);

        if cancel.is_cancelled() {
            self.release(id, &slot).await;
            self.settle(id, SessionState::Idle).await;
            return;
        }

        let invocation = match invocation {
            Ok(invocation) => invocation,
            Err(e) => {
                self.release(id, &slot).await;
                self.fail(id, &e).await;
                return;
            }
        };

        let (exit_tx, mut exit_rx) = oneshot::channel();
        let engine = self.engine.clone();
        let worker_cancel = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("socktun-session-{}", id))
            .spawn(move || {
                let code = if worker_cancel.is_cancelled() {
                    0
                } else {
                    engine.start(&invocation)
                };
                let _ = exit_tx.send(code);
            });
        if let Err(e) = spawned {
            self.release(id, &slot).await;
            self.fail(id, &Error::EngineLaunch(e.to_string())).await;
            return;
        }

        if let Some((old, snapshot)) = self.transition(id, SessionState::Connected, |s| {
            *s == SessionState::Connecting
        }) {
            log::info!(
                "Session {} connected via {} ({} routes)",
                id,
                endpoint,
                built.strategy
            );
            self.publish(old, snapshot).await;
        }

        let mut stopping = false;
        let exit = loop {
            tokio::select! {
                exit = &mut exit_rx => break exit,
                _ = cancel.cancelled(), if !stopping => stopping = true,
                _ = tokio::time::sleep(STOP_RETRY_INTERVAL), if stopping => self.engine.stop(),
            }
        };

        self.release(id, &slot).await;

        match exit {
            Ok(0) => {
                log::info!("Session {} engine exited normally", id);
                self.settle(id, SessionState::Idle).await;
            }
            Ok(code) => {
                log::warn!("Session {} engine exited with code {}", id, code);
                self.fail(id, &Error::EngineRuntime { code }).await;
            }
            Err(_) => {
                let reason = FailureReason::new(
                    FailureKind::EngineRuntime,
                    "engine worker terminated unexpectedly",
                );
                log::error!("Session {} {}", id, reason);
                self.settle(id, SessionState::Failed(reason)).await;
            }
        }
    }
}
