// Device settings an attempt changes. Shared between the worker and the
// blocking pool; every change and the final restore run under one lock.
use super::error::{StarterError, StarterResult};
use super::platform::{Platform, SecureSettingsSnapshot};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct SettingsState {
    snapshot: Option<SecureSettingsSnapshot>,
    released: bool,
}

#[derive(Clone)]
pub(crate) struct AttemptSettings {
    platform: Arc<dyn Platform>,
    state: Arc<Mutex<SettingsState>>,
}

impl AttemptSettings {
    pub(crate) fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SettingsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Turns wireless debugging off, snapshots the secure settings and
    /// installs pairing support. Refused once released.
    pub(crate) fn prepare(&self) -> StarterResult<()> {
        let mut state = self.lock();
        if state.released {
            return Err(StarterError::Cancelled);
        }
        // Off first so that switching it on later starts a fresh listener
        self.platform.set_debug_transport_enabled(false)?;
        let snapshot = self.platform.capture_secure_settings()?;
        state.snapshot = Some(snapshot.clone());
        self.platform.install_pairing_support(&snapshot)
    }

    pub(crate) fn enable_debug_transport(&self) -> StarterResult<()> {
        let state = self.lock();
        if state.released {
            return Err(StarterError::Cancelled);
        }
        self.platform.set_debug_transport_enabled(true)
    }

    /// Puts back what `prepare` changed. Runs at most once; later calls and
    /// calls racing a pending `prepare` see the same outcome.
    pub(crate) fn release(&self) {
        let mut state = self.lock();
        if state.released {
            return;
        }
        state.released = true;

        // Settings were only touched if the snapshot was taken
        let Some(snapshot) = state.snapshot.take() else {
            return;
        };
        log::debug!("🧹 Restoring secure settings");
        log_cleanup("remove pairing support", self.platform.remove_pairing_support());
        log_cleanup("restore secure settings", self.platform.restore_secure_settings(&snapshot));
        log_cleanup(
            "disable wireless debugging",
            self.platform.set_debug_transport_enabled(false),
        );
    }
}

fn log_cleanup(step: &str, result: StarterResult<()>) {
    if let Err(e) = result {
        log::error!("❌ Cleanup step '{step}' failed: {e}");
    }
}
