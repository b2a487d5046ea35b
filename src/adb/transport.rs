// Socket ownership for one ADB connection: plain TCP until the peer asks for
// STLS, TLS afterwards. All calls block; callers run them off the async runtime.
use super::error::{AdbError, AdbResult};
use super::protocol::{Frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LIMIT, verify_payload};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Plain,
    Upgraded,
}

enum Channel {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Channel {
    fn socket(&self) -> &TcpStream {
        match self {
            Channel::Plain(s) => s,
            Channel::Tls(s) => &s.sock,
        }
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Channel::Plain(s) => s.read(buf),
            Channel::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Channel::Plain(s) => s.write(buf),
            Channel::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Channel::Plain(s) => s.flush(),
            Channel::Tls(s) => s.flush(),
        }
    }
}

/// Lets another thread tear the socket down while a blocking read is pending.
#[derive(Debug)]
pub struct AbortHandle {
    socket: TcpStream,
}

impl AbortHandle {
    pub fn abort(&self) {
        // Already-closed sockets report NotConnected; nothing left to do then
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

pub struct Transport {
    channel: Option<Channel>,
    peer: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("mode", &self.mode())
            .field("open", &self.channel.is_some())
            .finish()
    }
}

impl Transport {
    pub fn connect(host: &str, port: u16, io_timeout: Option<Duration>) -> AdbResult<Self> {
        let connect_error = |source| AdbError::ConnectFailed {
            host: host.to_string(),
            port,
            source,
        };
        let stream = TcpStream::connect((host, port)).map_err(connect_error)?;
        stream.set_read_timeout(io_timeout).map_err(connect_error)?;
        stream.set_write_timeout(io_timeout).map_err(connect_error)?;
        // Frames are small and latency bound
        let _ = stream.set_nodelay(true);

        log::debug!("🔌 TCP connected to {host}:{port}");
        Ok(Self {
            channel: Some(Channel::Plain(stream)),
            peer: format!("{host}:{port}"),
        })
    }

    pub fn mode(&self) -> TransportMode {
        match self.channel {
            Some(Channel::Tls(_)) => TransportMode::Upgraded,
            _ => TransportMode::Plain,
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    fn channel(&mut self) -> AdbResult<&mut Channel> {
        self.channel.as_mut().ok_or(AdbError::NotConnected)
    }

    pub fn abort_handle(&self) -> AdbResult<AbortHandle> {
        let channel = self.channel.as_ref().ok_or(AdbError::NotConnected)?;
        let socket = channel
            .socket()
            .try_clone()
            .map_err(|e| AdbError::transport("cloning socket handle", e))?;
        Ok(AbortHandle { socket })
    }

    /// Wraps the plain socket in TLS and drives the handshake to completion.
    pub fn upgrade(&mut self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> AdbResult<()> {
        let socket = match self.channel.take() {
            Some(Channel::Plain(socket)) => socket,
            Some(tls @ Channel::Tls(_)) => {
                self.channel = Some(tls);
                return Err(AdbError::violation("STLS received on an already upgraded transport"));
            }
            None => return Err(AdbError::NotConnected),
        };

        let conn = ClientConnection::new(config, server_name).map_err(|e| AdbError::TlsFailed {
            description: format!("TLS session creation: {e}"),
        })?;
        let mut tls = StreamOwned::new(conn, socket);
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(|e| AdbError::TlsFailed {
                    description: format!("handshake with {}: {e}", self.peer),
                })?;
        }

        log::debug!("🔒 TLS established with {}", self.peer);
        self.channel = Some(Channel::Tls(Box::new(tls)));
        Ok(())
    }

    pub fn send(&mut self, frame: &Frame) -> AdbResult<()> {
        log::debug!("➡️  {frame}");
        let channel = self.channel()?;
        channel
            .write_all(&frame.encode())
            .and_then(|_| channel.flush())
            .map_err(|e| AdbError::transport("writing frame", e))
    }

    /// Reads one frame. `peer_version` decides whether checksums are enforced.
    pub fn recv(&mut self, peer_version: u32, max_payload: u32) -> AdbResult<Frame> {
        let channel = self.channel()?;

        let mut header_bytes = [0u8; HEADER_LEN];
        channel
            .read_exact(&mut header_bytes)
            .map_err(|e| AdbError::transport("reading frame header", e))?;
        let header = FrameHeader::decode(&header_bytes)?;

        let limit = max_payload.clamp(1, MAX_PAYLOAD_LIMIT);
        if header.data_length > limit {
            return Err(AdbError::violation(format!(
                "{} frame declares {} payload bytes, limit is {limit}",
                header.command, header.data_length
            )));
        }

        let mut payload = vec![0u8; header.data_length as usize];
        channel
            .read_exact(&mut payload)
            .map_err(|e| AdbError::transport("reading frame payload", e))?;
        verify_payload(&header, &payload, peer_version)?;

        let frame = Frame {
            command: header.command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        };
        log::debug!("⬅️  {frame}");
        Ok(frame)
    }

    /// Closes the socket. Safe to call any number of times.
    pub fn shutdown(&mut self) {
        match self.channel.take() {
            Some(Channel::Plain(socket)) => {
                let _ = socket.shutdown(Shutdown::Both);
            }
            Some(Channel::Tls(mut tls)) => {
                tls.conn.send_close_notify();
                let _ = tls.conn.complete_io(&mut tls.sock);
                let _ = tls.sock.shutdown(Shutdown::Both);
            }
            None => return,
        }
        log::debug!("🔌 Transport to {} closed", self.peer);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
