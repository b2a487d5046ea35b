// ADB module - client side of the Android debugging protocol
// Connects to adbd over TCP (optionally upgraded to TLS), authenticates with a
// persisted RSA key and runs shell commands while streaming their output.

pub mod client;
pub mod error;
pub mod key;
pub mod protocol;
pub mod tls;
pub mod transport;


// Re-export the main types for easy access
pub use client::{AdbClient, AuthState, ShellExit};
pub use error::{AdbError, AdbResult, FailureKind};
pub use key::{AdbKey, AdbKeyProvider, FileKeyStore, KeyStore};
pub use transport::{AbortHandle, TransportMode};
