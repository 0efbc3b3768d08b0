//! infuse-crypto: packet security for Infuse devices
//!
//! Key hierarchy:
//! ```text
//! Device root  (X25519 ECDH: device secret x cloud public key)
//!   ├── Sign key          HKDF(salt=0x1234, info="sign")
//!   └── Interface keys    HKDF(salt=rotation, info="serial"|"udp"|"bt_adv"|"bt_gatt")
//! Network root (loaded secret, 24-bit identifier)
//!   ├── Secondary network (optional)
//!   ├── Extension networks (up to EXTENSION_NETWORKS_MAX)
//!   └── Interface keys    HKDF(salt=rotation, info=interface name)
//! ```
//!
//! Interface keys drive ChaCha20-Poly1305 with 96-bit nonces built from the
//! packet header.

pub mod aead;
pub mod keys;
pub mod manager;
pub mod security;

pub use aead::{decrypt, encrypt};
pub use keys::{derive_chacha_key, generate_key, KeyMaterial};
pub use manager::{KeyHandle, KeyInterface, KeyManager, KeyType};
pub use security::{NetworkRoot, SecurityContext};

/// Size of a ChaCha20 key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
