//! Fakes shared by the session tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use socktun_engine::{
    EngineInvocation, EventHandler, HostResolver, SessionController, SessionEvent, Status,
    StatusNotification, TunnelConfig, TunnelEngine,
};
use socktun_tun::{InterfaceHandle, InterfaceResource, InterfaceSpec, TunPlatform};

pub const PROXY: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);
pub const FAKE_FD: i32 = 77;

/// How the fake engine behaves once started
#[derive(Debug, Clone, Copy)]
pub enum EngineMode {
    /// Run until stop() is called, then return the code
    UntilStopped(i32),
    /// Return the code right away
    Exit(i32),
    /// Return the code after a delay, ignoring stop()
    ExitAfter(Duration, i32),
    /// Never return
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCall {
    pub fd: i32,
    pub mtu: u16,
    pub server: String,
    pub user: Option<String>,
    pub pass: Option<String>,
}

pub struct FakeEngine {
    mode: EngineMode,
    stopped: Mutex<bool>,
    wake: Condvar,
    starts: Mutex<Vec<StartCall>>,
    stops: AtomicUsize,
}

impl FakeEngine {
    pub fn new(mode: EngineMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            starts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn starts(&self) -> Vec<StartCall> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl TunnelEngine for FakeEngine {
    fn start(&self, invocation: &EngineInvocation) -> i32 {
        self.starts.lock().unwrap().push(StartCall {
            fd: invocation.fd(),
            mtu: invocation.mtu(),
            server: invocation.server().to_string_lossy().into_owned(),
            user: invocation.user().map(|u| u.to_string_lossy().into_owned()),
            pass: invocation.pass().map(|p| p.to_string_lossy().into_owned()),
        });

        match self.mode {
            EngineMode::UntilStopped(code) => {
                let mut stopped = self.stopped.lock().unwrap();
                *stopped = false;
                while !*stopped {
                    stopped = self.wake.wait(stopped).unwrap();
                }
                code
            }
            EngineMode::Exit(code) => code,
            EngineMode::ExitAfter(delay, code) => {
                std::thread::sleep(delay);
                code
            }
            EngineMode::Hang => loop {
                std::thread::park();
            },
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.stopped.lock().unwrap() = true;
        self.wake.notify_all();
    }
}

struct FakeResource {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl InterfaceResource for FakeResource {
    async fn close(&mut self) -> socktun_tun::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlatform {
    pub exclusion: bool,
    pub refuse_exclusions: bool,
    pub deny: bool,
    pub delay: Option<Duration>,
    specs: Mutex<Vec<InterfaceSpec>>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            exclusion: true,
            ..Default::default()
        }
    }

    pub fn specs(&self) -> Vec<InterfaceSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunPlatform for FakePlatform {
    fn supports_route_exclusion(&self) -> bool {
        self.exclusion
    }

    async fn establish(&self, spec: &InterfaceSpec) -> socktun_tun::Result<InterfaceHandle> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny {
            return Err(socktun_tun::Error::PermissionDenied(
                "user declined the VPN request".into(),
            ));
        }
        if self.refuse_exclusions && spec.routes.has_exclusions() {
            return Err(socktun_tun::Error::NotSupported("exclusions".into()));
        }

        self.specs.lock().unwrap().push(spec.clone());
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(InterfaceHandle::new(
            FAKE_FD,
            "fake0",
            spec.mtu,
            Box::new(FakeResource {
                closed: self.closed.clone(),
            }),
        ))
    }
}

/// Resolves every name to one address, or fails
pub struct FakeResolver(pub Option<Ipv4Addr>);

#[async_trait]
impl HostResolver for FakeResolver {
    async fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        match self.0 {
            Some(addr) => Ok(vec![IpAddr::V4(addr)]),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", host),
            )),
        }
    }
}

/// Collects status notifications and log events
#[derive(Default)]
pub struct Recorder {
    notifications: Mutex<Vec<StatusNotification>>,
    logs: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn statuses(&self) -> Vec<Status> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.status)
            .collect()
    }

    pub fn notifications(&self) -> Vec<StatusNotification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Status(notification) => {
                self.notifications.lock().unwrap().push(notification)
            }
            SessionEvent::Log { message, .. } => self.logs.lock().unwrap().push(message),
            SessionEvent::StateChanged { .. } => {}
        }
    }
}

pub struct Harness {
    pub controller: SessionController,
    pub platform: Arc<FakePlatform>,
    pub engine: Arc<FakeEngine>,
    pub recorder: Arc<Recorder>,
}

pub fn harness(platform: FakePlatform, mode: EngineMode) -> Harness {
    harness_with(platform, mode, Some(PROXY), Duration::from_millis(500))
}

pub fn harness_with(
    platform: FakePlatform,
    mode: EngineMode,
    resolved: Option<Ipv4Addr>,
    stop_timeout: Duration,
) -> Harness {
    let platform = Arc::new(platform);
    let engine = FakeEngine::new(mode);
    let recorder = Arc::new(Recorder::default());
    let controller =
        SessionController::builder(TunnelConfig::default(), platform.clone(), engine.clone())
            .resolver(Arc::new(FakeResolver(resolved)))
            .event_handler(recorder.clone())
            .stop_timeout(stop_timeout)
            .build();

    Harness {
        controller,
        platform,
        engine,
        recorder,
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
