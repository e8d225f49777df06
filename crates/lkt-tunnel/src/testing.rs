//! In-memory collaborators for tests.

use crate::log::{self, LOG_CAPACITY, LogSink, LogStream};
use crate::process::{
    LaunchError, LaunchSpec, ProcessHandle, ProcessStatus, RunStatus, Supervisor,
};
use crate::proxy::{ProxyConfigError, ProxyController, ProxySetting, ProxyStore};
use crate::session::{
    ConnectError, RemoteTunnel, SessionContext, SshConnector, SshTarget, TunnelCheck,
};
use crate::settings::{CommandTemplate, Settings, WireGuardLiveness};
use crate::uplink::UplinkProbe;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

fn process_name(program: &str) -> String {
    Path::new(program)
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[derive(Default)]
struct FakeState {
    next: u64,
    started: Vec<LaunchSpec>,
    ran: Vec<LaunchSpec>,
    terminated: Vec<ProcessHandle>,
    killed: Vec<String>,
    running: HashMap<ProcessHandle, String>,
    exited: HashMap<ProcessHandle, Option<i32>>,
    named: Vec<String>,
    missing: Vec<String>,
    start_error: Option<LaunchError>,
    exit_on_start: Option<Option<i32>>,
    run_results: Vec<(String, RunStatus)>,
    kill_error: Option<LaunchError>,
}

/// Scripted supervisor; never touches the OS
#[derive(Default)]
pub struct FakeSupervisor {
    state: Mutex<FakeState>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starting or running this program fails with NotFound
    pub fn missing(&self, program: &str) {
        self.state.lock().missing.push(program.to_string());
    }

    pub fn fail_start(&self, err: LaunchError) {
        self.state.lock().start_error = Some(err);
    }

    /// Started processes exit immediately with this code
    pub fn exit_on_start(&self, code: Option<i32>) {
        self.state.lock().exit_on_start = Some(code);
    }

    /// One-shot commands whose program or first argument is `key`
    pub fn run_result(&self, key: &str, status: RunStatus) {
        self.state.lock().run_results.push((key.to_string(), status));
    }

    pub fn fail_kill(&self, err: LaunchError) {
        self.state.lock().kill_error = Some(err);
    }

    /// A process the supervisor did not launch
    pub fn spawn_named(&self, name: &str) {
        self.state.lock().named.push(name.to_string());
    }

    pub fn remove_named(&self, name: &str) {
        self.state.lock().named.retain(|n| n != name);
    }

    /// Every launched process dies
    pub fn crash_all(&self) {
        let mut state = self.state.lock();
        let handles: Vec<_> = state.running.drain().map(|(h, _)| h).collect();
        for handle in handles {
            state.exited.insert(handle, Some(1));
        }
    }

    pub fn started(&self) -> Vec<LaunchSpec> {
        self.state.lock().started.clone()
    }

    pub fn ran(&self) -> Vec<LaunchSpec> {
        self.state.lock().ran.clone()
    }

    pub fn terminated(&self) -> Vec<ProcessHandle> {
        self.state.lock().terminated.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().killed.clone()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        let mut state = self.state.lock();
        if state.missing.contains(&spec.program) {
            return Err(LaunchError::NotFound(spec.program.clone()));
        }
        if let Some(err) = state.start_error.clone() {
            return Err(err);
        }

        state.next += 1;
        let handle = ProcessHandle(state.next);
        state.started.push(spec.clone());
        match state.exit_on_start {
            Some(code) => {
                state.exited.insert(handle, code);
            }
            None => {
                state.running.insert(handle, process_name(&spec.program));
            }
        }
        Ok(handle)
    }

    fn stream_output(&self, _handle: ProcessHandle, _log: LogSink) {}

    fn status(&self, handle: ProcessHandle) -> ProcessStatus {
        let state = self.state.lock();
        if state.running.contains_key(&handle) {
            ProcessStatus::Running
        } else if let Some(code) = state.exited.get(&handle) {
            ProcessStatus::Exited(*code)
        } else {
            ProcessStatus::Unknown
        }
    }

    async fn terminate(&self, handle: ProcessHandle) {
        let mut state = self.state.lock();
        state.running.remove(&handle);
        state.exited.remove(&handle);
        state.terminated.push(handle);
    }

    async fn run(
        &self,
        spec: &LaunchSpec,
        _timeout: Duration,
        _log: &LogSink,
    ) -> Result<RunStatus, LaunchError> {
        let mut state = self.state.lock();
        state.ran.push(spec.clone());
        if state.missing.contains(&spec.program) {
            return Err(LaunchError::NotFound(spec.program.clone()));
        }

        let first_arg = spec.args.first().map(String::as_str);
        Ok(state
            .run_results
            .iter()
            .rev()
            .find(|(key, _)| *key == spec.program || Some(key.as_str()) == first_arg)
            .map(|(_, status)| *status)
            .unwrap_or(RunStatus::Success))
    }

    fn find_by_name(&self, name: &str) -> Result<Vec<u32>, LaunchError> {
        let state = self.state.lock();
        let wanted = process_name(name);
        let launched = state.running.values().filter(|n| **n == wanted).count();
        let named = state.named.iter().filter(|n| process_name(n) == wanted).count();
        Ok((0..(launched + named) as u32).map(|i| 1000 + i).collect())
    }

    async fn kill_by_name(&self, name: &str) -> Result<usize, LaunchError> {
        let mut state = self.state.lock();
        state.killed.push(name.to_string());
        if let Some(err) = state.kill_error.clone() {
            return Err(err);
        }

        let wanted = process_name(name);
        let before = state.named.len() + state.running.len();
        state.named.retain(|n| process_name(n) != wanted);
        state.running.retain(|_, n| *n != wanted);
        Ok(before - state.named.len() - state.running.len())
    }
}

/// Proxy store that records every write
#[derive(Default)]
pub struct MemoryProxyStore {
    history: Mutex<Vec<ProxySetting>>,
    fail: AtomicBool,
}

impl MemoryProxyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn history(&self) -> Vec<ProxySetting> {
        self.history.lock().clone()
    }

    /// Did the last successful write enable the proxy?
    pub fn is_enabled(&self) -> bool {
        matches!(self.history.lock().last(), Some(ProxySetting::Enabled(_)))
    }
}

impl ProxyStore for MemoryProxyStore {
    fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyConfigError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProxyConfigError::StoreUnavailable("scripted failure".into()));
        }
        self.history.lock().push(setting.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Uplink whose answer the test controls
pub struct ScriptedUplink {
    live: AtomicBool,
}

impl ScriptedUplink {
    pub fn new(live: bool) -> Self {
        Self {
            live: AtomicBool::new(live),
        }
    }

    pub fn set(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }
}

impl UplinkProbe for ScriptedUplink {
    fn is_uplink_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Records SSH opens; optionally fails them
pub struct FakeConnector {
    failure: Option<ConnectError>,
    opened: Mutex<Vec<SshTarget>>,
    closed: Arc<AtomicUsize>,
    tunnels: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            failure: None,
            opened: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicUsize::new(0)),
            tunnels: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: ConnectError) -> Self {
        Self {
            failure: Some(err),
            ..Self::new()
        }
    }

    pub fn opened(&self) -> Vec<SshTarget> {
        self.opened.lock().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every opened forward dies
    pub fn drop_tunnels(&self) {
        for open in self.tunnels.lock().iter() {
            open.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn open(
        &self,
        target: &SshTarget,
        _ctx: &SessionContext,
        _log: &LogSink,
    ) -> Result<Box<dyn RemoteTunnel>, ConnectError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.opened.lock().push(target.clone());
        let open = Arc::new(AtomicBool::new(true));
        self.tunnels.lock().push(open.clone());
        Ok(Box::new(FakeTunnel {
            local_port: target.local_port,
            open,
            closed: self.closed.clone(),
        }))
    }
}

struct FakeTunnel {
    local_port: u16,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteTunnel for FakeTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn open_check(&self) -> TunnelCheck {
        let open = self.open.clone();
        Arc::new(move || open.load(Ordering::SeqCst))
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Settings with short timings and platform-neutral commands
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.timing.settle_ms = 20;
    settings.timing.terminate_ms = 50;
    settings.timing.command_timeout_ms = 500;
    settings.timing.liveness_interval_ms = 30;

    settings.openvpn.executable = "openvpn".into();
    settings.shadowsocks.executable = "sslocal".into();
    settings.v2ray.executable = "v2ray".into();

    let wireguard = &mut settings.wireguard;
    wireguard.executable = "wg-quick".into();
    wireguard.install_args = vec!["up".into(), "{config}".into()];
    wireguard.uninstall_args = vec!["down".into(), "{config}".into()];
    wireguard.helper_names = vec!["wireguard".into(), "wg".into()];
    wireguard.liveness = WireGuardLiveness::Process;
    wireguard.interface_disable = CommandTemplate::new("ip", &["link", "set", "{interface}", "down"]);
    settings
}

/// Fakes wired into a session context
pub struct Harness {
    pub supervisor: Arc<FakeSupervisor>,
    pub proxy_store: Arc<MemoryProxyStore>,
    pub proxy: Arc<ProxyController>,
    pub uplink: Arc<ScriptedUplink>,
    pub settings: Settings,
    pub connected: Arc<watch::Sender<bool>>,
    log: LogSink,
    stream: Mutex<LogStream>,
}

impl Harness {
    pub fn new() -> Self {
        let proxy_store = Arc::new(MemoryProxyStore::new());
        let (log, stream) = log::channel(LOG_CAPACITY);
        let (connected, _) = watch::channel(false);
        Self {
            supervisor: Arc::new(FakeSupervisor::new()),
            proxy: Arc::new(ProxyController::new(proxy_store.clone())),
            proxy_store,
            uplink: Arc::new(ScriptedUplink::new(true)),
            settings: fast_settings(),
            connected: Arc::new(connected),
            log,
            stream: Mutex::new(stream),
        }
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            supervisor: self.supervisor.clone(),
            proxy: self.proxy.clone(),
            uplink: self.uplink.clone(),
            log: self.log.clone(),
            settings: Arc::new(self.settings.clone()),
            connected: self.connected.clone(),
        }
    }

    pub fn log(&self) -> LogSink {
        self.log.clone()
    }

    /// Drain queued log lines into one string
    pub fn log_text(&self) -> String {
        self.stream
            .lock()
            .drain()
            .iter()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
