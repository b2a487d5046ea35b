// Wire format of the ADB transport: a 24 byte little-endian header followed
// by `data_length` payload bytes.
use super::error::{AdbError, AdbResult};
use std::fmt;

/// Protocol version we announce in CNXN.
pub const A_VERSION: u32 = 0x0100_0000;
/// Peers at or above this version stop checksumming payloads.
pub const A_VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;
/// Version carried by STLS frames.
pub const A_STLS_VERSION: u32 = 0x0100_0000;
/// Largest payload we ask the peer to send in one frame.
pub const MAX_PAYLOAD: u32 = 4096;
/// Hard upper bound we accept from any peer regardless of negotiation.
pub const MAX_PAYLOAD_LIMIT: u32 = 1024 * 1024;
pub const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Sync = 0x434e_5953,
    Cnxn = 0x4e58_4e43,
    Auth = 0x4854_5541,
    Open = 0x4e45_504f,
    Okay = 0x5941_4b4f,
    Clse = 0x4553_4c43,
    Wrte = 0x4554_5257,
    Stls = 0x534c_5453,
}

impl Command {
    const ALL: [Command; 8] = [
        Command::Sync,
        Command::Cnxn,
        Command::Auth,
        Command::Open,
        Command::Okay,
        Command::Clse,
        Command::Wrte,
        Command::Stls,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u32 == value)
    }

    pub fn magic(self) -> u32 {
        (self as u32) ^ 0xffff_ffff
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Command words are their own ASCII names in little-endian order
        let bytes = (*self as u32).to_le_bytes();
        f.write_str(std::str::from_utf8(&bytes).unwrap_or("????"))
    }
}

/// AUTH frame `arg0` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    Token = 1,
    Signature = 2,
    RsaPublicKey = 3,
}

impl AuthType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AuthType::Token),
            2 => Some(AuthType::Signature),
            3 => Some(AuthType::RsaPublicKey),
            _ => None,
        }
    }
}

/// Sum of payload bytes, as used by the legacy checksum field.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let words = [
            self.command as u32,
            self.arg0,
            self.arg1,
            self.data_length,
            self.data_checksum,
            self.command.magic(),
        ];
        for (slot, word) in out.chunks_exact_mut(4).zip(words) {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> AdbResult<Self> {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let raw_command = word(0);
        let command = Command::from_u32(raw_command)
            .ok_or_else(|| AdbError::violation(format!("unknown command 0x{raw_command:08x}")))?;
        if word(20) != command.magic() {
            return Err(AdbError::violation(format!("bad magic on {command} frame")));
        }
        Ok(Self {
            command,
            arg0: word(4),
            arg1: word(8),
            data_length: word(12),
            data_checksum: word(16),
        })
    }
}

/// One protocol message: header plus its declared payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    pub fn empty(command: Command, arg0: u32, arg1: u32) -> Self {
        Self::new(command, arg0, arg1, Vec::new())
    }

    /// CNXN carrying our version, payload limit and identity banner.
    pub fn connect(banner: &str) -> Self {
        let mut payload = banner.as_bytes().to_vec();
        payload.push(0);
        Self::new(Command::Cnxn, A_VERSION, MAX_PAYLOAD, payload)
    }

    /// OPEN for a service destination such as `shell:id`.
    pub fn open(local_id: u32, destination: &str) -> Self {
        let mut payload = destination.as_bytes().to_vec();
        payload.push(0);
        Self::new(Command::Open, local_id, 0, payload)
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            command: self.command,
            arg0: self.arg0,
            arg1: self.arg1,
            data_length: self.payload.len() as u32,
            data_checksum: checksum(&self.payload),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header().encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Payload as text up to the first NUL, used for banners and OPEN targets.
    pub fn payload_str(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:08x}, 0x{:08x}, {} bytes)",
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len()
        )
    }
}

/// Validates a received payload against its header.
pub fn verify_payload(header: &FrameHeader, payload: &[u8], peer_version: u32) -> AdbResult<()> {
    if header.data_length as usize != payload.len() {
        return Err(AdbError::violation(format!(
            "{} declared {} payload bytes but carried {}",
            header.command,
            header.data_length,
            payload.len()
        )));
    }
    if peer_version < A_VERSION_SKIP_CHECKSUM && checksum(payload) != header.data_checksum {
        return Err(AdbError::violation(format!(
            "payload checksum mismatch on {} frame",
            header.command
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_words_match_ascii_names() {
        for command in Command::ALL {
            assert_eq!(Command::from_u32(command as u32), Some(command));
        }
        assert_eq!(Command::Cnxn.to_string(), "CNXN");
        assert_eq!(Command::Stls.to_string(), "STLS");
        assert_eq!(Command::Wrte.to_string(), "WRTE");
        assert_eq!(Command::from_u32(0x1234_5678), None);
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let frame = Frame::new(Command::Okay, 7, 9, b"ab".to_vec());
        let bytes = frame.encode();

        assert_eq!(bytes.len(), HEADER_LEN + 2);
        assert_eq!(&bytes[0..4], b"OKAY");
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &9u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &(u32::from(b'a') + u32::from(b'b')).to_le_bytes());
        assert_eq!(&bytes[20..24], &(Command::Okay as u32 ^ 0xffff_ffff).to_le_bytes());
        assert_eq!(&bytes[24..], b"ab");
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut header = Frame::empty(Command::Clse, 1, 2).header().encode();
        header[20] ^= 0xff;
        let err = FrameHeader::decode(&header).unwrap_err();
        assert!(matches!(err, AdbError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(b"NOPE");
        assert!(FrameHeader::decode(&header).is_err());
    }

    #[test]
    fn test_checksum_only_enforced_for_old_peers() {
        let frame = Frame::new(Command::Wrte, 1, 1, b"hello".to_vec());
        let mut header = frame.header();
        header.data_checksum = 0;

        assert!(verify_payload(&header, &frame.payload, A_VERSION).is_err());
        assert!(verify_payload(&header, &frame.payload, A_VERSION_SKIP_CHECKSUM).is_ok());
    }

    #[test]
    fn test_connect_and_open_payloads_are_nul_terminated() {
        let cnxn = Frame::connect("host::");
        assert_eq!(cnxn.payload, b"host::\0");
        assert_eq!(cnxn.arg0, A_VERSION);
        assert_eq!(cnxn.arg1, MAX_PAYLOAD);

        let open = Frame::open(3, "shell:echo ok");
        assert_eq!(open.payload_str(), "shell:echo ok");
        assert_eq!(open.arg0, 3);
    }
}
