//! Sealed Relay - End-to-end encrypted messaging over an untrusted relay
//!
//! Each device holds an RSA-2048 key pair, publishes the public half to a
//! shared directory, and seals every message with RSA-OAEP (SHA-256) before it
//! reaches the relay. The relay stores and fans out opaque ciphertext only.

mod types;
mod keys;
mod storage;
mod crypto;
mod envelope;
mod models;
mod relay;
mod directory;
mod session;
mod sync;
mod exchange;

pub use types::*;
pub use keys::*;
pub use storage::*;
pub use crypto::*;
pub use envelope::*;
pub use models::*;
pub use relay::*;
pub use directory::*;
pub use session::*;
pub use sync::*;
pub use exchange::*;
