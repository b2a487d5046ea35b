// AdbAuthClient: one transport, one handshake, one shell stream at a time.
use super::error::{AdbError, AdbResult};
use super::key::AdbKeyProvider;
use super::protocol::{A_STLS_VERSION, A_VERSION_SKIP_CHECKSUM, AuthType, Command, Frame, MAX_PAYLOAD};
use super::tls;
use super::transport::{AbortHandle, Transport, TransportMode};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

/// Identity banner announced in CNXN.
pub const HOST_BANNER: &str = "host::";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    ChallengeReceived,
    Authenticated,
}

/// How a shell stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    /// The device closed the stream after sending all output.
    Closed,
    /// The chunk callback asked to stop; the stream was closed from our side.
    Stopped,
}

#[derive(Debug)]
struct Connection {
    transport: Transport,
    peer_version: u32,
    max_payload: u32,
    peer_banner: Option<String>,
    auth: AuthState,
    challenge: Option<Vec<u8>>,
    next_local_id: u32,
    open_stream: Option<u32>,
    /// Streams we closed early; late frames addressed to them are dropped.
    retired: Vec<u32>,
}

impl Connection {
    fn new(transport: Transport) -> Self {
        Self {
            transport,
            // Checksums are only enforced once the peer tells us its version
            peer_version: A_VERSION_SKIP_CHECKSUM,
            max_payload: MAX_PAYLOAD,
            peer_banner: None,
            auth: AuthState::Unauthenticated,
            challenge: None,
            next_local_id: 1,
            open_stream: None,
            retired: Vec::new(),
        }
    }

    fn send(&mut self, frame: &Frame) -> AdbResult<()> {
        self.transport.send(frame)
    }

    fn recv(&mut self) -> AdbResult<Frame> {
        loop {
            let frame = self.transport.recv(self.peer_version, self.max_payload)?;
            let stale = matches!(frame.command, Command::Wrte | Command::Okay | Command::Clse)
                && self.retired.contains(&frame.arg1);
            if !stale {
                return Ok(frame);
            }
            log::debug!("🗑️  Dropping {frame} for closed stream");
            if frame.command == Command::Clse {
                self.retired.retain(|id| *id != frame.arg1);
            }
        }
    }

    fn accept_peer(&mut self, cnxn: &Frame) {
        self.peer_version = cnxn.arg0;
        self.max_payload = cnxn.arg1.clamp(1, MAX_PAYLOAD);
        self.peer_banner = Some(cnxn.payload_str());
        self.auth = AuthState::Authenticated;
        self.challenge = None;
        log::info!(
            "✅ ADB session established (version 0x{:08x}, device '{}')",
            self.peer_version,
            self.peer_banner.as_deref().unwrap_or_default()
        );
    }

    fn take_challenge(&mut self, frame: &Frame) -> AdbResult<()> {
        match AuthType::from_u32(frame.arg0) {
            Some(AuthType::Token) => {
                self.challenge = Some(frame.payload.clone());
                self.auth = AuthState::ChallengeReceived;
                log::debug!("🔐 Device issued an AUTH challenge");
                Ok(())
            }
            _ => Err(AdbError::violation(format!(
                "AUTH type {} is not a challenge",
                frame.arg0
            ))),
        }
    }
}

/// Client side of the debugging protocol, bound to at most one device
/// connection at a time.
pub struct AdbClient {
    keys: Arc<AdbKeyProvider>,
    banner: String,
    io_timeout: Option<Duration>,
    connection: Option<Connection>,
}

impl AdbClient {
    pub fn new(keys: Arc<AdbKeyProvider>) -> Self {
        Self {
            keys,
            banner: HOST_BANNER.to_string(),
            io_timeout: None,
            connection: None,
        }
    }

    pub fn with_io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    /// Opens the transport, sends CNXN and interprets the first reply. Devices
    /// asking for STLS are upgraded here, which also authenticates us.
    pub fn connect(&mut self, host: &str, port: u16) -> AdbResult<()> {
        self.close();
        log::info!("🔌 Connecting to adbd at {host}:{port}");

        let transport = Transport::connect(host, port, self.io_timeout)?;
        let mut conn = Connection::new(transport);
        conn.send(&Frame::connect(&self.banner))?;

        let reply = conn.recv()?;
        match reply.command {
            Command::Cnxn => conn.accept_peer(&reply),
            Command::Auth => conn.take_challenge(&reply)?,
            Command::Stls => {
                log::debug!("🔒 Device requested STLS");
                conn.send(&Frame::empty(Command::Stls, A_STLS_VERSION, 0))?;
                let key = self.keys.get()?;
                let config = tls::client_config(&key)?;
                conn.transport.upgrade(config, tls::server_name(host)?)?;
                let after = conn.recv()?;
                if after.command != Command::Cnxn {
                    return Err(AdbError::violation(format!(
                        "expected CNXN after TLS handshake, got {after}"
                    )));
                }
                conn.accept_peer(&after);
            }
            _ => {
                return Err(AdbError::violation(format!(
                    "unexpected {reply} in reply to CNXN"
                )));
            }
        }

        self.connection = Some(conn);
        Ok(())
    }

    /// Answers a pending challenge with our signature. A second challenge in
    /// reply means the device does not trust the key; that is terminal.
    pub fn authenticate(&mut self) -> AdbResult<()> {
        let result = self.answer_challenge();
        self.settle(result)
    }

    fn answer_challenge(&mut self) -> AdbResult<()> {
        let keys = Arc::clone(&self.keys);
        let conn = self.connection.as_mut().ok_or(AdbError::NotConnected)?;
        match conn.auth {
            AuthState::Authenticated => return Ok(()),
            AuthState::Unauthenticated => {
                return Err(AdbError::violation("no AUTH challenge to answer"));
            }
            AuthState::ChallengeReceived => {}
        }

        let token = conn
            .challenge
            .take()
            .ok_or_else(|| AdbError::violation("AUTH challenge missing its token"))?;
        let key = keys.get()?;
        let signature = key.sign_token(&token)?;
        conn.send(&Frame::new(
            Command::Auth,
            AuthType::Signature as u32,
            0,
            signature,
        ))?;

        let reply = conn.recv()?;
        match reply.command {
            Command::Cnxn => {
                conn.accept_peer(&reply);
                Ok(())
            }
            Command::Auth if AuthType::from_u32(reply.arg0) == Some(AuthType::Token) => {
                log::warn!("🚫 Device rejected signature from key '{}'", key.label());
                Err(AdbError::AuthenticationRejected)
            }
            _ => Err(AdbError::violation(format!(
                "unexpected {reply} in reply to AUTH signature"
            ))),
        }
    }

    /// Runs `command` through the shell service, handing every WRTE payload to
    /// `on_chunk` in arrival order. Chunks already delivered stay delivered if
    /// the stream later fails.
    pub fn shell_command<F>(&mut self, command: &str, mut on_chunk: F) -> AdbResult<ShellExit>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let result = self.run_shell(command, &mut on_chunk);
        self.settle(result)
    }

    fn run_shell(
        &mut self,
        command: &str,
        on_chunk: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> AdbResult<ShellExit> {
        let conn = self.connection.as_mut().ok_or(AdbError::NotConnected)?;
        if conn.auth != AuthState::Authenticated {
            return Err(AdbError::violation("shell requested before authentication"));
        }
        if conn.open_stream.is_some() {
            return Err(AdbError::StreamBusy);
        }

        let local_id = conn.next_local_id;
        conn.next_local_id = conn.next_local_id.wrapping_add(1).max(1);
        let destination = format!("shell:{command}");
        conn.send(&Frame::open(local_id, &destination))?;

        let ready = conn.recv()?;
        let remote_id = match ready.command {
            Command::Okay if ready.arg1 == local_id => ready.arg0,
            Command::Clse if ready.arg1 == local_id => {
                return Err(AdbError::StreamRejected { destination });
            }
            _ => {
                return Err(AdbError::violation(format!(
                    "expected OKAY for stream {local_id}, got {ready}"
                )));
            }
        };
        conn.open_stream = Some(local_id);
        log::debug!("🐚 Shell stream {local_id} -> {remote_id} open");

        loop {
            let frame = conn.recv()?;
            if frame.arg1 != local_id {
                return Err(AdbError::violation(format!(
                    "{frame} addressed to unknown stream while {local_id} is open"
                )));
            }
            match frame.command {
                Command::Wrte => {
                    if on_chunk(&frame.payload).is_break() {
                        conn.send(&Frame::empty(Command::Clse, local_id, remote_id))?;
                        conn.open_stream = None;
                        conn.retired.push(local_id);
                        log::debug!("🐚 Shell stream {local_id} stopped early");
                        return Ok(ShellExit::Stopped);
                    }
                    conn.send(&Frame::empty(Command::Okay, local_id, remote_id))?;
                }
                Command::Okay => {}
                Command::Clse => {
                    conn.send(&Frame::empty(Command::Clse, local_id, remote_id))?;
                    conn.open_stream = None;
                    log::debug!("🐚 Shell stream {local_id} closed by device");
                    return Ok(ShellExit::Closed);
                }
                _ => {
                    return Err(AdbError::violation(format!(
                        "unexpected {frame} on shell stream"
                    )));
                }
            }
        }
    }

    /// Drops the connection after any error that leaves it in an unknown state.
    fn settle<T>(&mut self, result: AdbResult<T>) -> AdbResult<T> {
        if let Err(e) = &result
            && e.poisons_connection()
            && self.connection.is_some()
        {
            log::warn!("⚠️  Dropping ADB connection after error: {e}");
            self.close();
        }
        result
    }

    /// Releases the transport. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.transport.shutdown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Connected, authenticated and not in the middle of a stream.
    pub fn is_usable(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.auth == AuthState::Authenticated && c.open_stream.is_none())
    }

    pub fn auth_state(&self) -> Option<AuthState> {
        self.connection.as_ref().map(|c| c.auth)
    }

    pub fn transport_mode(&self) -> Option<TransportMode> {
        self.connection.as_ref().map(|c| c.transport.mode())
    }

    pub fn protocol_version(&self) -> Option<u32> {
        self.connection
            .as_ref()
            .filter(|c| c.auth == AuthState::Authenticated)
            .map(|c| c.peer_version)
    }

    pub fn peer_banner(&self) -> Option<&str> {
        self.connection.as_ref().and_then(|c| c.peer_banner.as_deref())
    }

    pub fn abort_handle(&self) -> AdbResult<AbortHandle> {
        self.connection
            .as_ref()
            .ok_or(AdbError::NotConnected)?
            .transport
            .abort_handle()
    }
}

impl Drop for AdbClient {
    fn drop(&mut self) {
        self.close();
    }
}
