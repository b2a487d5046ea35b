// Starter module - wireless bootstrap of the privileged service
// Discovers the debugging port, authenticates over ADB and runs the payload

pub mod attempt;
pub mod channels;
pub mod discovery;
pub mod error;
pub mod fallback;
pub mod lifecycle;
pub mod output;
pub mod platform;
mod settings;
pub mod types;


pub use discovery::{
    DiscoveryBackend, DiscoveryFactory, FixedPortDiscovery, MdnsDiscovery, PortDiscoverer, PortPublisher,
    StaticPortDiscovery,
};
pub use error::{ErrorKind, StarterError, StarterResult};
pub use fallback::{CommandFallbackPolicy, ExecutionReport, FALLBACK_NOTICE};
pub use lifecycle::{BootstrapHandle, BootstrapLifecycle, LifecycleOptions, StarterParts, spawn_lifecycle};
pub use output::{CommandResult, CommandStatus, OutputSnapshot};
pub use platform::{AndroidShellPlatform, NetworkNotifier, Platform, SecureSettingsSnapshot};
pub use types::{BootstrapState, BootstrapTrigger, Notice, PayloadVariant, StarterEvent};
