// Types and enums for the bootstrap lifecycle
use super::error::{ErrorKind, StarterResult};
use super::fallback::ExecutionReport;
use super::output::OutputSnapshot;

pub type AttemptId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    AwaitingNetwork,
    PortPending,
    Authenticating,
    Executing,
    FallbackExecuting,
    Completed,
    Failed,
}

impl BootstrapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BootstrapState::Completed | BootstrapState::Failed)
    }

    /// An attempt owns resources in every state except these three.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            BootstrapState::Idle | BootstrapState::Completed | BootstrapState::Failed
        )
    }
}

/// Which of the two payload locations a command or preparation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadVariant {
    Primary,
    Secondary,
}

/// Inbound request to bootstrap. The settings-write capability is checked
/// later, when the network comes up.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapTrigger {
    pub wireless_requested: bool,
}

impl Default for BootstrapTrigger {
    fn default() -> Self {
        Self {
            wireless_requested: true,
        }
    }
}

/// Reported by the attempt worker while protocol I/O is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptProgress {
    Authenticated,
    Output(String),
    FallbackStarted,
}

/// Result of a platform call made off the worker.
#[derive(Debug)]
pub enum PlatformStep {
    Capability(bool),
    SettingsPrepared(StarterResult<()>),
    DebugTransportEnabled(StarterResult<()>),
    ServiceChecked { port: u16, running: bool },
}

#[derive(Debug)]
pub enum LifecycleCommand {
    Start(BootstrapTrigger),
    NetworkAvailable {
        attempt: AttemptId,
    },
    Progress {
        attempt: AttemptId,
        progress: AttemptProgress,
    },
    Platform {
        attempt: AttemptId,
        step: PlatformStep,
    },
    AttemptFinished {
        attempt: AttemptId,
        result: StarterResult<ExecutionReport>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum StarterEvent {
    StateChanged(BootstrapState),
    Output(String),
    StartRejected { reason: String },
    Finished {
        state: BootstrapState,
        snapshot: OutputSnapshot,
    },
}

/// User-facing summary, sent once per terminal state.
#[derive(Debug, Clone)]
pub struct Notice {
    pub state: BootstrapState,
    pub error: Option<ErrorKind>,
    pub message: String,
}
