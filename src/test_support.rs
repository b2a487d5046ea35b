// Test doubles: an in-memory key store, a scripted adbd speaking the frame
// protocol over loopback TCP, and a recording platform.
use crate::adb::error::{AdbError, AdbResult};
use crate::adb::key::{AdbKey, AdbKeyProvider, KeyStore};
use crate::adb::protocol::{
    A_STLS_VERSION, A_VERSION_SKIP_CHECKSUM, AuthType, Command, Frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD,
};
use crate::starter::discovery::{DiscoveryBackend, DiscoveryFactory, PortPublisher};
use crate::starter::error::StarterResult;
use crate::starter::platform::{NetworkNotifier, Platform, SecureSettingsSnapshot};
use crate::starter::types::{Notice, PayloadVariant};
use rsa::RsaPublicKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use sha1::Sha1;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

// ============================================================
// KEYS
// ============================================================

/// One 2048-bit key per test binary; TLS refuses anything smaller.
pub fn test_key_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        AdbKey::generate("test", 2048)
            .and_then(|key| key.private_key_pem())
            .expect("test key generation")
    })
}

pub fn test_public_key() -> RsaPublicKey {
    AdbKey::from_pem("test", test_key_pem())
        .expect("test key parses")
        .public_key()
        .clone()
}

pub fn test_keys() -> Arc<AdbKeyProvider> {
    Arc::new(AdbKeyProvider::new(
        Box::new(MemoryKeyStore::with_pem(test_key_pem())),
        "test",
    ))
}

#[derive(Default)]
struct MemoryKeyState {
    pem: Option<String>,
    saves: usize,
    broken: bool,
}

/// Key store kept in memory; clones share state.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    state: Arc<Mutex<MemoryKeyState>>,
}

impl MemoryKeyStore {
    pub fn with_pem(pem: &str) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().pem = Some(pem.to_string());
        store
    }

    /// Every operation fails as if the backing file were unreadable.
    pub fn broken() -> Self {
        let store = Self::default();
        store.state.lock().unwrap().broken = true;
        store
    }

    pub fn saves(&self) -> usize {
        self.state.lock().unwrap().saves
    }

    fn check(state: &MemoryKeyState) -> AdbResult<()> {
        if state.broken {
            return Err(AdbError::KeyStore {
                path: "memory".into(),
                source: std::io::Error::other("store is broken"),
            });
        }
        Ok(())
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> AdbResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Self::check(&state)?;
        Ok(state.pem.clone())
    }

    fn save(&self, pem: &str) -> AdbResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state)?;
        state.pem = Some(pem.to_string());
        state.saves += 1;
        Ok(())
    }

    fn clear(&self) -> AdbResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state)?;
        state.pem = None;
        Ok(())
    }
}

// ============================================================
// FAKE ADBD
// ============================================================

pub const DEVICE_BANNER: &str = "device::ro.product.name=fake;ro.product.model=Fake;";
const CHALLENGE: [u8; 20] = *b"fake-adbd-challenge!";

#[derive(Clone)]
pub enum DeviceAuth {
    /// Answers CNXN with CNXN straight away.
    Open,
    /// Issues an AUTH challenge and accepts signatures from `trusted` only.
    Token { trusted: Option<RsaPublicKey> },
    /// Requests STLS, then sends CNXN over TLS.
    Tls,
}

#[derive(Clone)]
pub enum ShellReply {
    /// WRTE each chunk, waiting for OKAY in between, then CLSE.
    Output(Vec<Vec<u8>>),
    /// CLSE in reply to OPEN.
    Reject,
    /// WRTE each chunk, then drop the socket without CLSE.
    Hangup(Vec<Vec<u8>>),
    /// OKAY followed by a SYNC frame on the stream.
    Garbage,
    /// WRTE each chunk, then keep the stream open until the client drops the
    /// connection.
    Stall(Vec<Vec<u8>>),
}

impl ShellReply {
    pub fn text(chunks: &[&str]) -> Self {
        ShellReply::Output(chunks.iter().map(|c| c.as_bytes().to_vec()).collect())
    }
}

#[derive(Clone)]
struct Script {
    auth: DeviceAuth,
    replies: Vec<(String, ShellReply)>,
    opened: Arc<Mutex<Vec<String>>>,
    sessions: Arc<AtomicUsize>,
    hangups: Arc<AtomicUsize>,
}

impl Script {
    fn reply_for(&self, command: &str) -> ShellReply {
        self.replies
            .iter()
            .find(|(cmd, _)| cmd == command)
            .map(|(_, reply)| reply.clone())
            .unwrap_or(ShellReply::Output(Vec::new()))
    }
}

/// A scripted adbd listening on 127.0.0.1; every accepted connection replays
/// the same script on its own thread.
pub struct FakeDevice {
    port: u16,
    script: Script,
}

impl FakeDevice {
    pub fn spawn(auth: DeviceAuth, replies: Vec<(&str, ShellReply)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake adbd");
        let port = listener.local_addr().expect("local addr").port();
        let script = Script {
            auth,
            replies: replies
                .into_iter()
                .map(|(cmd, reply)| (cmd.to_string(), reply))
                .collect(),
            opened: Arc::default(),
            sessions: Arc::default(),
            hangups: Arc::default(),
        };

        let accept_script = script.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let script = accept_script.clone();
                script.sessions.fetch_add(1, Ordering::SeqCst);
                std::thread::spawn(move || {
                    let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
                    let _ = serve(stream, &script);
                });
            }
        });

        Self { port, script }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Destinations of every OPEN received, in order.
    pub fn opened(&self) -> Vec<String> {
        self.script.opened.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> usize {
        self.script.sessions.load(Ordering::SeqCst)
    }

    /// Connections the client closed while a stalled stream was open.
    pub fn hangups(&self) -> usize {
        self.script.hangups.load(Ordering::SeqCst)
    }
}

/// Blocks until the peer closes the connection. Read timeouts keep waiting.
fn wait_for_peer_close(stream: &mut impl Read) {
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(_) => return,
        }
    }
}

fn read_frame(stream: &mut impl Read) -> Option<Frame> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).ok()?;
    let header = FrameHeader::decode(&header).ok()?;
    let mut payload = vec![0u8; header.data_length as usize];
    stream.read_exact(&mut payload).ok()?;
    Some(Frame::new(header.command, header.arg0, header.arg1, payload))
}

fn write_frame(stream: &mut impl Write, frame: &Frame) -> Option<()> {
    stream.write_all(&frame.encode()).ok()?;
    stream.flush().ok()
}

fn device_cnxn() -> Frame {
    let mut banner = DEVICE_BANNER.as_bytes().to_vec();
    banner.push(0);
    Frame::new(Command::Cnxn, A_VERSION_SKIP_CHECKSUM, MAX_PAYLOAD, banner)
}

fn serve(mut stream: TcpStream, script: &Script) -> Option<()> {
    let hello = read_frame(&mut stream)?;
    if hello.command != Command::Cnxn {
        return None;
    }

    match &script.auth {
        DeviceAuth::Open => {
            write_frame(&mut stream, &device_cnxn())?;
            serve_streams(&mut stream, script)
        }
        DeviceAuth::Token { trusted } => {
            write_frame(
                &mut stream,
                &Frame::new(Command::Auth, AuthType::Token as u32, 0, CHALLENGE.to_vec()),
            )?;
            let answer = read_frame(&mut stream)?;
            let accepted = answer.command == Command::Auth
                && answer.arg0 == AuthType::Signature as u32
                && trusted.as_ref().is_some_and(|key| {
                    key.verify(Pkcs1v15Sign::new::<Sha1>(), &CHALLENGE, &answer.payload)
                        .is_ok()
                });
            if !accepted {
                // Ask again, as adbd does when it wants the public key
                write_frame(
                    &mut stream,
                    &Frame::new(Command::Auth, AuthType::Token as u32, 0, CHALLENGE.to_vec()),
                )?;
                while read_frame(&mut stream).is_some() {}
                return None;
            }
            write_frame(&mut stream, &device_cnxn())?;
            serve_streams(&mut stream, script)
        }
        DeviceAuth::Tls => {
            write_frame(&mut stream, &Frame::empty(Command::Stls, A_STLS_VERSION, 0))?;
            let answer = read_frame(&mut stream)?;
            if answer.command != Command::Stls {
                return None;
            }
            let conn = rustls::ServerConnection::new(tls_server::config()).ok()?;
            let mut tls = rustls::StreamOwned::new(conn, stream);
            write_frame(&mut tls, &device_cnxn())?;
            serve_streams(&mut tls, script)
        }
    }
}

fn serve_streams(stream: &mut (impl Read + Write), script: &Script) -> Option<()> {
    let mut next_remote = 100u32;
    loop {
        let open = read_frame(stream)?;
        if open.command != Command::Open {
            // Late CLSE/OKAY for a stream the client already gave up on
            continue;
        }
        let destination = open.payload_str();
        script.opened.lock().unwrap().push(destination.clone());
        let command = destination.strip_prefix("shell:").unwrap_or(&destination);

        let local = open.arg0;
        let remote = next_remote;
        next_remote += 1;

        match script.reply_for(command) {
            ShellReply::Reject => {
                write_frame(stream, &Frame::empty(Command::Clse, 0, local))?;
            }
            ShellReply::Garbage => {
                write_frame(stream, &Frame::empty(Command::Okay, remote, local))?;
                write_frame(stream, &Frame::empty(Command::Sync, remote, local))?;
            }
            ShellReply::Output(chunks) => {
                write_frame(stream, &Frame::empty(Command::Okay, remote, local))?;
                let mut stopped = false;
                for chunk in chunks {
                    write_frame(stream, &Frame::new(Command::Wrte, remote, local, chunk))?;
                    let ack = read_frame(stream)?;
                    if ack.command == Command::Clse {
                        stopped = true;
                        break;
                    }
                }
                if !stopped {
                    write_frame(stream, &Frame::empty(Command::Clse, remote, local))?;
                    read_frame(stream)?;
                }
            }
            ShellReply::Hangup(chunks) => {
                write_frame(stream, &Frame::empty(Command::Okay, remote, local))?;
                for chunk in chunks {
                    write_frame(stream, &Frame::new(Command::Wrte, remote, local, chunk))?;
                    read_frame(stream)?;
                }
                return None;
            }
            ShellReply::Stall(chunks) => {
                write_frame(stream, &Frame::empty(Command::Okay, remote, local))?;
                for chunk in chunks {
                    write_frame(stream, &Frame::new(Command::Wrte, remote, local, chunk))?;
                    read_frame(stream)?;
                }
                wait_for_peer_close(stream);
                script.hangups.fetch_add(1, Ordering::SeqCst);
                return None;
            }
        }
    }
}

mod tls_server {
    use rustls::client::danger::HandshakeSignatureValid;
    use rustls::crypto::WebPkiSupportedAlgorithms;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
    use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
    use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
    use std::sync::Arc;

    /// adbd checks the client key against its trusted list, not the chain.
    #[derive(Debug)]
    struct AnyClientCert {
        algorithms: WebPkiSupportedAlgorithms,
    }

    impl ClientCertVerifier for AnyClientCert {
        fn root_hint_subjects(&self) -> &[DistinguishedName] {
            &[]
        }

        fn verify_client_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _now: UnixTime,
        ) -> Result<ClientCertVerified, rustls::Error> {
            Ok(ClientCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.algorithms.supported_schemes()
        }
    }

    pub fn config() -> Arc<ServerConfig> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("server certificate");
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let provider = rustls::crypto::ring::default_provider();
        let verifier = AnyClientCert {
            algorithms: provider.signature_verification_algorithms.clone(),
        };
        let config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("tls13")
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(vec![certified.cert.der().clone()], key)
            .expect("server config");
        Arc::new(config)
    }
}

// ============================================================
// PLATFORM
// ============================================================

pub const TEST_PAIRING_COMPONENT: &str = "test/pairing";
pub const TEST_PRIMARY_COMMAND: &str = "sh /sdcard/Android/data/test.pkg/start.sh";
pub const TEST_SECONDARY_COMMAND: &str = "sh /data/user_de/0/test.pkg/start.sh";
pub const TEST_MARKER: &str = "/Android/data/test.pkg/start.sh: Permission denied";

const SERVICES_KEY: &str = "enabled_accessibility_services";
const ENABLED_KEY: &str = "accessibility_enabled";
const WIFI_KEY: &str = "adb_wifi_enabled";

struct PlatformState {
    granted: bool,
    network_up: bool,
    service_running: bool,
    service_check_delay: Option<Duration>,
    service_checks: usize,
    settings: HashMap<&'static str, String>,
    properties: HashMap<String, String>,
    notifier: Option<NetworkNotifier>,
    calls: Vec<String>,
    notices: Vec<Notice>,
}

/// Records every call and keeps settings in a map. By default the
/// capability is granted and the network is up as soon as it is watched.
#[derive(Clone)]
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        let mut settings = HashMap::new();
        settings.insert(SERVICES_KEY, "other/service".to_string());
        settings.insert(ENABLED_KEY, "0".to_string());
        settings.insert(WIFI_KEY, "0".to_string());
        Self {
            state: Arc::new(Mutex::new(PlatformState {
                granted: true,
                network_up: true,
                service_running: false,
                service_check_delay: None,
                service_checks: 0,
                settings,
                properties: HashMap::new(),
                notifier: None,
                calls: Vec::new(),
                notices: Vec::new(),
            })),
        }
    }
}

impl FakePlatform {
    pub fn without_capability() -> Self {
        let platform = Self::default();
        platform.state.lock().unwrap().granted = false;
        platform
    }

    /// The network comes up only when `bring_network_up` is called.
    pub fn offline() -> Self {
        let platform = Self::default();
        platform.state.lock().unwrap().network_up = false;
        platform
    }

    pub fn service_running() -> Self {
        let platform = Self::default();
        platform.state.lock().unwrap().service_running = true;
        platform
    }

    /// `is_service_running` blocks its caller for `delay`.
    pub fn slow_service_check(delay: Duration) -> Self {
        let platform = Self::default();
        platform.state.lock().unwrap().service_check_delay = Some(delay);
        platform
    }

    pub fn bring_network_up(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.network_up = true;
        state.notifier.as_ref().is_some_and(|n| n.network_available())
    }

    pub fn set_property(&self, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .properties
            .insert(name.to_string(), value.to_string());
    }

    pub fn setting(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().settings.get(key).cloned()
    }

    pub fn secure_settings(&self) -> SecureSettingsSnapshot {
        SecureSettingsSnapshot {
            enabled_accessibility_services: self.setting(SERVICES_KEY),
            accessibility_enabled: self.setting(ENABLED_KEY),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.state.lock().unwrap().notices.clone()
    }

    pub fn service_checks(&self) -> usize {
        self.state.lock().unwrap().service_checks
    }

    pub fn is_watching(&self) -> bool {
        self.state.lock().unwrap().notifier.is_some()
    }

    fn record(&self, call: impl Into<String>) -> std::sync::MutexGuard<'_, PlatformState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.into());
        state
    }

    fn put(settings: &mut HashMap<&'static str, String>, key: &'static str, value: Option<&String>) {
        match value {
            Some(value) => settings.insert(key, value.clone()),
            None => settings.remove(key),
        };
    }
}

impl Platform for FakePlatform {
    fn has_secure_settings_permission(&self) -> bool {
        self.state.lock().unwrap().granted
    }

    fn watch_network(&self, notifier: NetworkNotifier) -> StarterResult<()> {
        let mut state = self.record("watch_network");
        if state.network_up {
            notifier.network_available();
        }
        state.notifier = Some(notifier);
        Ok(())
    }

    fn unwatch_network(&self) {
        self.record("unwatch_network").notifier = None;
    }

    fn capture_secure_settings(&self) -> StarterResult<SecureSettingsSnapshot> {
        drop(self.record("capture"));
        Ok(self.secure_settings())
    }

    fn restore_secure_settings(&self, snapshot: &SecureSettingsSnapshot) -> StarterResult<()> {
        let mut state = self.record("restore");
        Self::put(
            &mut state.settings,
            SERVICES_KEY,
            snapshot.enabled_accessibility_services.as_ref(),
        );
        Self::put(&mut state.settings, ENABLED_KEY, snapshot.accessibility_enabled.as_ref());
        Ok(())
    }

    fn set_debug_transport_enabled(&self, enabled: bool) -> StarterResult<()> {
        let value = if enabled { "1" } else { "0" };
        self.record(format!("wifi={value}"))
            .settings
            .insert(WIFI_KEY, value.to_string());
        Ok(())
    }

    fn install_pairing_support(&self, snapshot: &SecureSettingsSnapshot) -> StarterResult<()> {
        let services = crate::starter::platform::with_component(
            snapshot.enabled_accessibility_services.as_deref(),
            TEST_PAIRING_COMPONENT,
        );
        let mut state = self.record("install_pairing");
        state.settings.insert(SERVICES_KEY, services);
        state.settings.insert(ENABLED_KEY, "1".to_string());
        Ok(())
    }

    fn remove_pairing_support(&self) -> StarterResult<()> {
        let mut state = self.record("remove_pairing");
        let remaining = crate::starter::platform::without_component(
            state.settings.get(SERVICES_KEY).map(String::as_str),
            TEST_PAIRING_COMPONENT,
        );
        Self::put(&mut state.settings, SERVICES_KEY, remaining.as_ref());
        Ok(())
    }

    fn system_property(&self, name: &str) -> StarterResult<Option<String>> {
        Ok(self.state.lock().unwrap().properties.get(name).cloned())
    }

    fn prepare_payload(&self, variant: PayloadVariant) -> StarterResult<()> {
        drop(self.record(format!("prepare {variant:?}")));
        Ok(())
    }

    fn command(&self, variant: PayloadVariant) -> String {
        match variant {
            PayloadVariant::Primary => TEST_PRIMARY_COMMAND.to_string(),
            PayloadVariant::Secondary => TEST_SECONDARY_COMMAND.to_string(),
        }
    }

    fn is_service_running(&self) -> bool {
        let (running, delay) = {
            let mut state = self.state.lock().unwrap();
            state.service_checks += 1;
            (state.service_running, state.service_check_delay)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        running
    }

    fn notify(&self, notice: &Notice) {
        self.state.lock().unwrap().notices.push(notice.clone());
    }
}

// ============================================================
// DISCOVERY
// ============================================================

#[derive(Default)]
struct ScriptState {
    publisher: Option<PortPublisher>,
    starts: usize,
    stops: usize,
}

/// Discovery backend that publishes a scripted list of raw values when
/// started, and whatever the test publishes later.
#[derive(Clone, Default)]
pub struct ScriptedDiscovery {
    initial: Vec<i64>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDiscovery {
    pub fn new(initial: Vec<i64>) -> Self {
        Self {
            initial,
            state: Arc::default(),
        }
    }

    pub fn factory(&self) -> DiscoveryFactory {
        let script = self.clone();
        Box::new(move || Box::new(script.clone()) as Box<dyn DiscoveryBackend>)
    }

    /// Returns false when no discovery is running.
    pub fn publish(&self, raw: i64) -> bool {
        match &self.state.lock().unwrap().publisher {
            Some(publisher) => publisher.publish(raw),
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }
}

impl DiscoveryBackend for ScriptedDiscovery {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn begin(&mut self, publisher: PortPublisher) -> StarterResult<()> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        for raw in &self.initial {
            publisher.publish(*raw);
        }
        state.publisher = Some(publisher);
        Ok(())
    }

    fn end(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        state.publisher = None;
    }
}
