// Bootstrap lifecycle: a single worker that owns all attempt state and
// consumes an ordered command queue. Platform calls and protocol I/O run on
// the blocking pool and report back through the same queue.
use super::attempt::{AttemptAbort, AttemptContext, run_attempt};
use super::channels::create_lifecycle_channels;
use super::discovery::{DiscoveryFactory, PortDiscoverer};
use super::error::{StarterError, StarterResult};
use super::fallback::{CommandFallbackPolicy, ExecutionReport};
use super::output::{CommandResult, CommandStatus, OutputSnapshot};
use super::platform::{NetworkNotifier, Platform};
use super::settings::AttemptSettings;
use super::types::{
    AttemptId, AttemptProgress, BootstrapState, BootstrapTrigger, LifecycleCommand, Notice, PlatformStep,
    StarterEvent,
};
use crate::adb::AdbKeyProvider;
use crate::config::StarterConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// First line of every attempt's log once a port is known.
pub const STARTING_BANNER: &str = "Starting with wireless adb...\n\n";

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub host: String,
    pub io_timeout: Option<Duration>,
    /// Caller-side bound on how long `PortPending` may last.
    pub port_wait_timeout: Option<Duration>,
    pub fallback_marker: String,
}

impl LifecycleOptions {
    pub fn from_config(config: &StarterConfig) -> Self {
        Self {
            host: config.host.clone(),
            io_timeout: config.io_timeout(),
            port_wait_timeout: config.port_wait_timeout(),
            fallback_marker: config.fallback_marker(),
        }
    }
}

/// What the lifecycle is built from.
pub struct StarterParts {
    pub options: LifecycleOptions,
    pub platform: Arc<dyn Platform>,
    pub keys: Arc<AdbKeyProvider>,
    pub discovery: DiscoveryFactory,
}

/// Control surface held by the trigger side.
#[derive(Clone)]
pub struct BootstrapHandle {
    command_tx: mpsc::UnboundedSender<LifecycleCommand>,
    output_rx: watch::Receiver<OutputSnapshot>,
}

impl BootstrapHandle {
    pub fn start(&self, trigger: BootstrapTrigger) -> StarterResult<()> {
        self.command_tx
            .send(LifecycleCommand::Start(trigger))
            .map_err(|_| StarterError::Cancelled)
    }

    /// Cancels any running attempt; its cleanup runs before the worker exits.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(LifecycleCommand::Shutdown);
    }

    pub fn output(&self) -> watch::Receiver<OutputSnapshot> {
        self.output_rx.clone()
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        self.output_rx.borrow().clone()
    }
}

/// Spawns the worker on the current runtime.
pub fn spawn_lifecycle(
    parts: StarterParts,
) -> (
    BootstrapHandle,
    mpsc::UnboundedReceiver<StarterEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (cmd_tx, cmd_rx, event_tx, event_rx) = create_lifecycle_channels();
    let (output_tx, output_rx) = watch::channel(OutputSnapshot::default());
    let lifecycle = BootstrapLifecycle::new(parts, &cmd_tx, cmd_rx, event_tx, output_tx);
    let join = tokio::spawn(lifecycle.run());
    let handle = BootstrapHandle {
        command_tx: cmd_tx,
        output_rx,
    };
    (handle, event_rx, join)
}

/// Everything an attempt acquired. Released exactly once, by `finish` or by
/// drop if the worker itself goes away.
struct AttemptResources {
    platform: Arc<dyn Platform>,
    settings: AttemptSettings,
    network_watched: bool,
    discoverer: Option<PortDiscoverer>,
}

impl AttemptResources {
    fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            settings: AttemptSettings::new(Arc::clone(&platform)),
            platform,
            network_watched: false,
            discoverer: None,
        }
    }

    fn stop_watching(&mut self) {
        if let Some(mut discoverer) = self.discoverer.take() {
            discoverer.stop();
        }
        if self.network_watched {
            self.network_watched = false;
            self.platform.unwatch_network();
        }
    }

    async fn release(&mut self) {
        log::debug!("🧹 Releasing attempt resources");
        self.stop_watching();
        let settings = self.settings.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || settings.release()).await {
            log::error!("❌ Settings cleanup task failed: {e}");
        }
    }
}

impl Drop for AttemptResources {
    fn drop(&mut self) {
        self.stop_watching();
        // No-op when `release` already ran
        self.settings.release();
    }
}

struct ActiveAttempt {
    id: AttemptId,
    resources: AttemptResources,
    network_seen: bool,
    ports: Option<watch::Receiver<Option<u16>>>,
    /// Ports are only taken once wireless debugging is switched on.
    listening: bool,
    deadline: Option<Instant>,
    abort: Arc<AttemptAbort>,
}

pub struct BootstrapLifecycle {
    state: BootstrapState,
    options: LifecycleOptions,
    platform: Arc<dyn Platform>,
    keys: Arc<AdbKeyProvider>,
    discovery: DiscoveryFactory,
    command_tx: mpsc::WeakUnboundedSender<LifecycleCommand>,
    command_rx: mpsc::UnboundedReceiver<LifecycleCommand>,
    event_tx: mpsc::UnboundedSender<StarterEvent>,
    output_tx: watch::Sender<OutputSnapshot>,
    result: CommandResult,
    next_attempt: AttemptId,
    active: Option<ActiveAttempt>,
    should_exit: bool,
}

impl BootstrapLifecycle {
    pub fn new(
        parts: StarterParts,
        command_tx: &mpsc::UnboundedSender<LifecycleCommand>,
        command_rx: mpsc::UnboundedReceiver<LifecycleCommand>,
        event_tx: mpsc::UnboundedSender<StarterEvent>,
        output_tx: watch::Sender<OutputSnapshot>,
    ) -> Self {
        Self {
            state: BootstrapState::Idle,
            options: parts.options,
            platform: parts.platform,
            keys: parts.keys,
            discovery: parts.discovery,
            // Weak, so the worker exits once every handle is gone
            command_tx: command_tx.downgrade(),
            command_rx,
            event_tx,
            output_tx,
            result: CommandResult::new(),
            next_attempt: 0,
            active: None,
            should_exit: false,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub async fn run(mut self) {
        log::debug!("🚦 Bootstrap lifecycle worker started");

        while !self.should_exit {
            let deadline = self.active.as_ref().and_then(|a| a.deadline);
            let ports = self
                .active
                .as_mut()
                .filter(|a| a.listening)
                .and_then(|a| a.ports.as_mut());

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.process_command(command).await,
                    None => {
                        log::debug!("🚦 All lifecycle handles dropped");
                        self.cancel().await;
                    }
                },
                Some(port) = next_port(ports) => self.on_port(port),
                _ = wait_until(deadline) => self.on_discovery_timeout().await,
            }
        }

        log::debug!("🚦 Bootstrap lifecycle worker ended");
    }

    async fn process_command(&mut self, command: LifecycleCommand) {
        match command {
            LifecycleCommand::Start(trigger) => self.on_start(trigger).await,
            LifecycleCommand::NetworkAvailable { attempt } => self.on_network_available(attempt),
            LifecycleCommand::Platform { attempt, step } => {
                if self.is_current(attempt) {
                    self.on_platform_step(step).await;
                } else {
                    log::debug!("🔧 Late {step:?} for attempt {attempt} dropped");
                }
            }
            LifecycleCommand::Progress { attempt, progress } => {
                if self.is_current(attempt) {
                    self.on_progress(progress);
                }
            }
            LifecycleCommand::AttemptFinished { attempt, result } => {
                if self.is_current(attempt) {
                    self.on_attempt_finished(result).await;
                }
            }
            LifecycleCommand::Shutdown => self.cancel().await,
        }
    }

    fn is_current(&self, attempt: AttemptId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == attempt)
    }

    fn change_state(&mut self, new_state: BootstrapState) {
        if self.state != new_state {
            log::debug!("🚦 Bootstrap state: {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
            let _ = self.event_tx.send(StarterEvent::StateChanged(new_state));
        }
    }

    fn append(&mut self, text: &str) {
        if self.result.append(text) {
            self.output_tx.send_replace(self.result.snapshot());
            let _ = self.event_tx.send(StarterEvent::Output(text.to_string()));
        }
    }

    fn reject(&self, reason: &str) {
        log::info!("🚫 Start rejected: {reason}");
        let _ = self.event_tx.send(StarterEvent::StartRejected {
            reason: reason.to_string(),
        });
    }

    /// Runs a blocking platform call on the blocking pool. The outcome comes
    /// back to the worker as `LifecycleCommand::Platform`.
    fn offload<F>(&self, work: F)
    where
        F: FnOnce() -> PlatformStep + Send + 'static,
    {
        let (Some(command_tx), Some(active)) = (self.command_tx.upgrade(), self.active.as_ref()) else {
            return;
        };
        let attempt = active.id;
        let job = tokio::task::spawn_blocking(work);
        tokio::spawn(async move {
            let command = match job.await {
                Ok(step) => LifecycleCommand::Platform { attempt, step },
                Err(e) => LifecycleCommand::AttemptFinished {
                    attempt,
                    result: Err(StarterError::from(e)),
                },
            };
            let _ = command_tx.send(command);
        });
    }

    async fn on_start(&mut self, trigger: BootstrapTrigger) {
        if self.active.is_some() || self.state.is_active() {
            self.reject("an attempt is already in progress");
            return;
        }
        if !trigger.wireless_requested {
            self.reject("wireless bootstrap not requested");
            return;
        }
        let Some(command_tx) = self.command_tx.upgrade() else {
            return;
        };

        self.next_attempt += 1;
        let id = self.next_attempt;
        log::info!("🚀 Bootstrap attempt {id} started");

        self.result = CommandResult::new();
        self.output_tx.send_replace(self.result.snapshot());
        self.active = Some(ActiveAttempt {
            id,
            resources: AttemptResources::new(Arc::clone(&self.platform)),
            network_seen: false,
            ports: None,
            listening: false,
            deadline: None,
            abort: Arc::new(AttemptAbort::default()),
        });
        self.change_state(BootstrapState::AwaitingNetwork);

        let watched = match self.active.as_mut() {
            Some(active) => {
                active.resources.network_watched = true;
                self.platform.watch_network(NetworkNotifier::new(command_tx, id))
            }
            None => Ok(()),
        };
        if let Err(e) = watched {
            self.finish(Err(e)).await;
        }
    }

    fn on_network_available(&mut self, attempt: AttemptId) {
        let state = self.state;
        let Some(active) = self.active.as_mut().filter(|a| a.id == attempt) else {
            log::debug!("📶 Network event for attempt {attempt} ignored in {state:?}");
            return;
        };
        if state != BootstrapState::AwaitingNetwork || active.network_seen {
            log::debug!("📶 Repeated network event for attempt {attempt} ignored");
            return;
        }
        active.network_seen = true;

        let platform = Arc::clone(&self.platform);
        self.offload(move || PlatformStep::Capability(platform.has_secure_settings_permission()));
    }

    async fn on_platform_step(&mut self, step: PlatformStep) {
        match (self.state, step) {
            (BootstrapState::AwaitingNetwork, PlatformStep::Capability(granted)) => {
                if !granted {
                    log::warn!("🔒 Secure settings permission missing");
                    self.finish(Err(StarterError::CapabilityMissing)).await;
                    return;
                }
                self.change_state(BootstrapState::PortPending);
                if let Some(active) = &self.active {
                    let settings = active.resources.settings.clone();
                    self.offload(move || PlatformStep::SettingsPrepared(settings.prepare()));
                }
            }
            (BootstrapState::PortPending, PlatformStep::SettingsPrepared(result)) => {
                if let Err(e) = result.and_then(|()| self.start_discovery()) {
                    self.finish(Err(e)).await;
                }
            }
            (BootstrapState::PortPending, PlatformStep::DebugTransportEnabled(result)) => match result {
                Ok(()) => {
                    if let Some(active) = self.active.as_mut() {
                        log::debug!("📡 Wireless debugging enabled, waiting for a port");
                        active.listening = true;
                    }
                }
                Err(e) => self.finish(Err(e)).await,
            },
            (BootstrapState::PortPending, PlatformStep::ServiceChecked { port, running }) => {
                if running {
                    log::info!("✅ Service already running, nothing to start");
                    self.finish(Ok(())).await;
                    return;
                }
                self.append(STARTING_BANNER);
                self.change_state(BootstrapState::Authenticating);
                if let Err(e) = self.spawn_attempt(port) {
                    self.finish(Err(e)).await;
                }
            }
            (state, step) => log::debug!("🔧 {step:?} ignored in {state:?}"),
        }
    }

    /// Subscribes to the port slot, starts discovery, then switches wireless
    /// debugging on so the advertisement is fresh.
    fn start_discovery(&mut self) -> StarterResult<()> {
        let discoverer = PortDiscoverer::new((self.discovery)());
        let port_wait = self.options.port_wait_timeout;
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        active.ports = Some(discoverer.receiver());
        active.resources.discoverer.insert(discoverer).start()?;
        active.deadline = port_wait.map(|wait| Instant::now() + wait);

        let settings = active.resources.settings.clone();
        self.offload(move || PlatformStep::DebugTransportEnabled(settings.enable_debug_transport()));
        Ok(())
    }

    fn on_port(&mut self, port: u16) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        // Later values are dropped from here on
        active.ports = None;
        active.listening = false;
        active.deadline = None;
        log::info!("📡 Wireless debugging port {port} discovered");

        let platform = Arc::clone(&self.platform);
        self.offload(move || PlatformStep::ServiceChecked {
            port,
            running: platform.is_service_running(),
        });
    }

    fn spawn_attempt(&mut self, port: u16) -> StarterResult<()> {
        let command_tx = self.command_tx.upgrade().ok_or(StarterError::Cancelled)?;
        let active = self.active.as_ref().ok_or(StarterError::Cancelled)?;
        let attempt = active.id;

        let ctx = AttemptContext {
            attempt,
            host: self.options.host.clone(),
            port,
            io_timeout: self.options.io_timeout,
            keys: Arc::clone(&self.keys),
            platform: Arc::clone(&self.platform),
            policy: CommandFallbackPolicy::new(self.options.fallback_marker.clone()),
            abort: Arc::clone(&active.abort),
            tx: command_tx.clone(),
        };

        let worker = tokio::task::spawn_blocking(move || run_attempt(ctx));
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(StarterError::from(e)),
            };
            let _ = command_tx.send(LifecycleCommand::AttemptFinished { attempt, result });
        });
        Ok(())
    }

    fn on_progress(&mut self, progress: AttemptProgress) {
        match progress {
            AttemptProgress::Authenticated => {
                if self.state == BootstrapState::Authenticating {
                    self.change_state(BootstrapState::Executing);
                }
            }
            AttemptProgress::Output(text) => self.append(&text),
            AttemptProgress::FallbackStarted => {
                if self.state == BootstrapState::Executing {
                    self.change_state(BootstrapState::FallbackExecuting);
                }
            }
        }
    }

    async fn on_attempt_finished(&mut self, result: StarterResult<ExecutionReport>) {
        match result {
            Ok(report) => {
                log::debug!("🏁 Attempt finished (fallback used: {})", report.fallback_used);
                self.finish(Ok(())).await;
            }
            Err(e) => self.finish(Err(e)).await,
        }
    }

    async fn on_discovery_timeout(&mut self) {
        let waited = self.options.port_wait_timeout.unwrap_or_default();
        log::warn!("⏱️  No debugging port within {waited:?}");
        self.finish(Err(StarterError::DiscoveryTimeout { waited })).await;
    }

    async fn cancel(&mut self) {
        if let Some(active) = &self.active {
            log::info!("🛑 Cancelling attempt {}", active.id);
            active.abort.abort();
        }
        self.finish(Err(StarterError::Cancelled)).await;
        self.should_exit = true;
    }

    /// The only way into a terminal state. Runs at most once per attempt.
    async fn finish(&mut self, result: StarterResult<()>) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        let (terminal, error) = match result {
            Ok(()) => {
                self.result.succeed();
                (BootstrapState::Completed, None)
            }
            Err(e) => {
                self.append(&format!("\n{e}\n"));
                let kind = e.kind();
                self.result.fail(e);
                (BootstrapState::Failed, Some(kind))
            }
        };

        active.resources.release().await;
        self.change_state(terminal);

        let snapshot = self.result.snapshot();
        self.output_tx.send_replace(snapshot.clone());
        let message = match &snapshot.status {
            CommandStatus::Error(e) => format!("Wireless start failed: {e}"),
            _ => "Wireless start finished".to_string(),
        };
        match error {
            None => log::info!("✅ Attempt {} completed", active.id),
            Some(kind) => log::warn!("❌ Attempt {} failed ({kind:?})", active.id),
        }
        self.platform.notify(&Notice {
            state: terminal,
            error,
            message,
        });
        let _ = self.event_tx.send(StarterEvent::Finished {
            state: terminal,
            snapshot,
        });
    }
}

async fn next_port(ports: Option<&mut watch::Receiver<Option<u16>>>) -> Option<u16> {
    let Some(rx) = ports else {
        return std::future::pending().await;
    };
    loop {
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
        if let Some(port) = *rx.borrow_and_update() {
            return Some(port);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
