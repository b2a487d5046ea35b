// CommandFallbackPolicy: run the primary payload, and if the shell reports
// that adbd may not read it, run the secondary payload exactly once.
use super::error::StarterResult;
use super::output::ChunkDecoder;
use crate::adb::{AdbClient, AdbError, AdbResult, ShellExit};
use std::ops::ControlFlow;

/// Appended to the log between the primary and the secondary output.
pub const FALLBACK_NOTICE: &str =
    "\nadb has no permission to access Android/data\ntry /data/user_de instead...\n\n";

/// Callbacks into the running attempt.
pub trait FallbackHooks {
    fn output(&mut self, text: &str);
    fn fallback_started(&mut self);
    fn prepare_secondary(&mut self) -> StarterResult<()>;
    /// A new authenticated client, for when the primary one died.
    fn reconnect(&mut self) -> StarterResult<AdbClient>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    pub fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct CommandFallbackPolicy {
    marker: String,
}

impl CommandFallbackPolicy {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn execute(
        &self,
        primary: &str,
        secondary: &str,
        client: &mut AdbClient,
        hooks: &mut dyn FallbackHooks,
    ) -> StarterResult<ExecutionReport> {
        let mut decoder = ChunkDecoder::default();
        let mut seen = String::new();
        let mut marker_hit = false;

        let primary_result = client.shell_command(primary, |chunk| {
            let text = decoder.push(chunk);
            if !text.is_empty() {
                seen.push_str(&text);
                hooks.output(&text);
            }
            if seen.contains(&self.marker) {
                marker_hit = true;
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        let tail = decoder.finish();
        if !tail.is_empty() && !marker_hit {
            seen.push_str(&tail);
            hooks.output(&tail);
            marker_hit = seen.contains(&self.marker);
        }

        match primary_result {
            Ok(_) if !marker_hit => return Ok(ExecutionReport { fallback_used: false }),
            Err(e) if !marker_hit => return Err(e.into()),
            Err(e) => log::warn!("⚠️  Primary stream failed after the marker was seen: {e}"),
            Ok(_) => {}
        }

        log::warn!("📂 adbd cannot read the primary payload, switching to the secondary one");
        hooks.fallback_started();
        hooks.output(FALLBACK_NOTICE);
        hooks.prepare_secondary()?;

        let reused = client.is_usable();
        let mut delivered = false;
        let mut result = if reused {
            run_secondary(secondary, client, hooks, &mut delivered)
        } else {
            Err(AdbError::NotConnected)
        };

        // A connection that died before the secondary printed anything is
        // replaced once
        if result.is_err() && !delivered && !client.is_usable() {
            if reused && let Err(e) = &result {
                log::warn!("⚠️  Connection lost before the secondary payload ran: {e}");
            }
            client.close();
            let mut fresh = hooks.reconnect()?;
            result = run_secondary(secondary, &mut fresh, hooks, &mut delivered);
            fresh.close();
        }

        result?;
        Ok(ExecutionReport {
            fallback_used: true,
        })
    }
}

fn run_secondary(
    command: &str,
    client: &mut AdbClient,
    hooks: &mut dyn FallbackHooks,
    delivered: &mut bool,
) -> AdbResult<ShellExit> {
    let mut decoder = ChunkDecoder::default();
    let result = client.shell_command(command, |chunk| {
        let text = decoder.push(chunk);
        if !text.is_empty() {
            *delivered = true;
            hooks.output(&text);
        }
        ControlFlow::Continue(())
    });
    let tail = decoder.finish();
    if !tail.is_empty() {
        *delivered = true;
        hooks.output(&tail);
    }
    result
}
