// Append-only output log of one bootstrap attempt
use super::error::StarterError;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub enum CommandStatus {
    #[default]
    Pending,
    Success,
    Error(Arc<StarterError>),
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Success)
    }

    pub fn error(&self) -> Option<&StarterError> {
        match self {
            CommandStatus::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Immutable view handed to observers.
#[derive(Debug, Clone)]
pub struct OutputSnapshot {
    pub text: Arc<str>,
    pub status: CommandStatus,
}

impl Default for OutputSnapshot {
    fn default() -> Self {
        Self {
            text: Arc::from(""),
            status: CommandStatus::Pending,
        }
    }
}

/// Accumulated output plus status. Text only grows; once the status is
/// terminal neither text nor status change again.
#[derive(Debug, Default)]
pub struct CommandResult {
    text: String,
    status: CommandStatus,
}

impl CommandResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, text: &str) -> bool {
        if self.status.is_terminal() {
            log::warn!("⚠️  Dropping {} bytes of output after the result was finalized", text.len());
            return false;
        }
        self.text.push_str(text);
        true
    }

    pub fn succeed(&mut self) -> bool {
        self.finalize(CommandStatus::Success)
    }

    pub fn fail(&mut self, error: StarterError) -> bool {
        self.finalize(CommandStatus::Error(Arc::new(error)))
    }

    fn finalize(&mut self, status: CommandStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn status(&self) -> &CommandStatus {
        &self.status
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            text: Arc::from(self.text.as_str()),
            status: self.status.clone(),
        }
    }
}

/// Turns shell chunks into text. A multi-byte character split across two
/// chunks is held back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flushes whatever is still held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_is_append_only_and_terminal_once() {
        let mut result = CommandResult::new();
        assert!(result.append("a"));
        assert!(result.append("b"));
        assert!(result.succeed());

        assert!(!result.fail(StarterError::Cancelled));
        assert!(!result.append("c"));
        assert_eq!(result.text(), "ab");
        assert!(result.status().is_success());
    }

    #[test]
    fn test_snapshot_is_detached_from_later_appends() {
        let mut result = CommandResult::new();
        result.append("first");
        let snapshot = result.snapshot();
        result.append(" second");

        assert_eq!(&*snapshot.text, "first");
        assert!(!snapshot.status.is_terminal());
        assert_eq!(result.snapshot().text.as_ref(), "first second");
    }

    #[test]
    fn test_decoder_joins_split_characters() {
        let bytes = "höhe ✓".as_bytes();
        // Split inside the two-byte 'ö' and inside the three-byte check mark
        let (a, rest) = bytes.split_at(2);
        let (b, c) = rest.split_at(rest.len() - 1);

        let mut decoder = ChunkDecoder::default();
        let mut text = decoder.push(a);
        assert_eq!(text, "h");
        text.push_str(&decoder.push(b));
        text.push_str(&decoder.push(c));
        text.push_str(&decoder.finish());

        assert_eq!(text, "höhe ✓");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.push(b"ok\xffgo"), "ok\u{FFFD}go");
        assert_eq!(decoder.push(b"\xe2\x9c"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
