// Blocking body of one bootstrap attempt, run on the blocking thread pool.
// Talks back to the lifecycle only through its command queue.
use super::error::{StarterError, StarterResult};
use super::fallback::{CommandFallbackPolicy, ExecutionReport, FallbackHooks};
use super::platform::Platform;
use super::types::{AttemptId, AttemptProgress, LifecycleCommand, PayloadVariant};
use crate::adb::{AbortHandle, AdbClient, AdbKeyProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Lets the lifecycle cut an attempt's socket from the worker thread.
#[derive(Debug, Default)]
pub struct AttemptAbort {
    cancelled: AtomicBool,
    socket: Mutex<Option<AbortHandle>>,
}

impl AttemptAbort {
    fn register(&self, client: &AdbClient) {
        let Ok(handle) = client.abort_handle() else {
            return;
        };
        let mut socket = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        // Cancellation may have landed while we were connecting
        if self.cancelled.load(Ordering::SeqCst) {
            handle.abort();
        }
        *socket = Some(handle);
    }

    pub fn abort(&self) {
        let socket = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = socket.as_ref() {
            log::debug!("✂️  Aborting attempt socket");
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> StarterResult<()> {
        if self.is_cancelled() {
            return Err(StarterError::Cancelled);
        }
        Ok(())
    }
}

pub struct AttemptContext {
    pub attempt: AttemptId,
    pub host: String,
    pub port: u16,
    pub io_timeout: Option<Duration>,
    pub keys: Arc<AdbKeyProvider>,
    pub platform: Arc<dyn Platform>,
    pub policy: CommandFallbackPolicy,
    pub abort: Arc<AttemptAbort>,
    pub tx: mpsc::UnboundedSender<LifecycleCommand>,
}

impl AttemptContext {
    fn report(&self, progress: AttemptProgress) {
        let _ = self.tx.send(LifecycleCommand::Progress {
            attempt: self.attempt,
            progress,
        });
    }

    fn open_client(&self) -> StarterResult<AdbClient> {
        self.abort.check()?;
        let mut client = AdbClient::new(Arc::clone(&self.keys)).with_io_timeout(self.io_timeout);
        client.connect(&self.host, self.port)?;
        self.abort.register(&client);
        client.authenticate()?;
        Ok(client)
    }
}

struct AttemptHooks<'a> {
    ctx: &'a AttemptContext,
}

impl FallbackHooks for AttemptHooks<'_> {
    fn output(&mut self, text: &str) {
        self.ctx.report(AttemptProgress::Output(text.to_string()));
    }

    fn fallback_started(&mut self) {
        self.ctx.report(AttemptProgress::FallbackStarted);
    }

    fn prepare_secondary(&mut self) -> StarterResult<()> {
        self.ctx.abort.check()?;
        self.ctx.platform.prepare_payload(PayloadVariant::Secondary)
    }

    fn reconnect(&mut self) -> StarterResult<AdbClient> {
        log::info!("🔁 Reconnecting for the secondary payload");
        self.ctx.open_client()
    }
}

/// Connects, authenticates and runs the payload commands. The client is
/// closed on every return path.
pub fn run_attempt(ctx: AttemptContext) -> StarterResult<ExecutionReport> {
    ctx.abort.check()?;
    ctx.platform.prepare_payload(PayloadVariant::Primary)?;

    let mut client = ctx.open_client()?;
    ctx.report(AttemptProgress::Authenticated);

    let primary = ctx.platform.command(PayloadVariant::Primary);
    let secondary = ctx.platform.command(PayloadVariant::Secondary);
    let mut hooks = AttemptHooks { ctx: &ctx };
    let report = ctx.policy.execute(&primary, &secondary, &mut client, &mut hooks);
    client.close();

    if ctx.abort.is_cancelled() {
        return Err(StarterError::Cancelled);
    }
    report
}
