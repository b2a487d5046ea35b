use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Default)]
pub struct Args {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub key_path: Option<PathBuf>,
    pub port_wait_timeout_secs: Option<u64>,
    pub static_port: bool,
    pub debug_mode: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("Invalid port value: {0}")]
    InvalidPort(String),
    #[error("Invalid timeout value: {0}")]
    InvalidTimeout(String),
    #[error("Unknown argument: {0}")]
    Unknown(String),
}

impl Args {
    pub fn parse() -> Result<Option<Self>, ArgsError> {
        Self::parse_from(env::args().skip(1))
    }

    /// `Ok(None)` when help or version was printed and the program should
    /// exit without starting.
    pub fn parse_from(args: impl IntoIterator<Item = String>) -> Result<Option<Self>, ArgsError> {
        let mut parsed = Args::default();

        for arg in args {
            if arg == "--help" || arg == "-h" {
                print_help();
                return Ok(None);
            } else if arg == "--version" || arg == "-v" {
                println!("Wireless ADB Starter v{}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            } else if arg == "--debug" {
                parsed.debug_mode = true;
            } else if arg == "--static-port" {
                parsed.static_port = true;
            } else if let Some(val) = arg.strip_prefix("--config=") {
                parsed.config_path = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--host=") {
                parsed.host = Some(val.to_string());
            } else if let Some(val) = arg.strip_prefix("--key=") {
                parsed.key_path = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--port=") {
                match val.parse::<u16>() {
                    Ok(port) if port > 0 => parsed.port = Some(port),
                    _ => return Err(ArgsError::InvalidPort(val.to_string())),
                }
            } else if let Some(val) = arg.strip_prefix("--timeout=") {
                let secs = val
                    .parse::<u64>()
                    .map_err(|_| ArgsError::InvalidTimeout(val.to_string()))?;
                parsed.port_wait_timeout_secs = Some(secs);
            } else {
                return Err(ArgsError::Unknown(arg));
            }
        }

        Ok(Some(parsed))
    }
}

pub fn print_help() {
    println!("📡 Wireless ADB Starter");
    println!();
    println!("USAGE:");
    println!("    wireless-adb-starter [FLAGS]");
    println!();
    println!("FLAGS:");
    println!("    --config=PATH       Read settings from a JSON file");
    println!("    --host=HOST         Address adbd listens on (default: 127.0.0.1)");
    println!("    --port=N            Skip discovery and connect to port N");
    println!("    --static-port       Read the port from service.adb.tcp.port instead of mDNS");
    println!("    --key=PATH          Private key file (default: ~/.android/starter_adbkey)");
    println!("    --timeout=N         Give up when no port is found within N seconds");
    println!("    --debug             Enable debug output");
    println!("    --help, -h          Show this help message");
    println!("    --version, -v       Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    wireless-adb-starter");
    println!("    wireless-adb-starter --timeout=30 --debug");
    println!("    wireless-adb-starter --port=37123 --config=starter.json");
}
