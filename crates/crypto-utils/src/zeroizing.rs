use std::fmt;
use std::ops::Deref;

use secrecy::{ExposeSecret, SecretBox};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// A 32-byte secp256k1 private key handed out by a key provider.
///
/// The bytes live in a `SecretBox`, so they are wiped when the value is
/// dropped, whichever way the borrowing scope is left. Access is only possible
/// inside [`KeyMaterial::with_secret`].
pub struct KeyMaterial {
    secret: SecretBox<[u8; 32]>,
    compressed: bool,
}

impl KeyMaterial {
    /// Moves `bytes` into protected storage and wipes the caller's buffer.
    pub fn take(bytes: &mut [u8; 32], compressed: bool) -> Self {
        let secret = SecretBox::new(Box::new(*bytes));
        bytes.zeroize();
        Self { secret, compressed }
    }

    /// Copies a key out of a slice. The slice itself is left untouched.
    pub fn from_slice(bytes: &[u8], compressed: bool) -> Result<Self, CryptoError> {
        let mut buf: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self::take(&mut buf, compressed))
    }

    /// Whether the matching public key is serialized in compressed form.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Runs `f` with a borrow of the raw key bytes.
    pub fn with_secret<R>(&self, f: impl FnOnce(&[u8; 32]) -> R) -> R {
        f(self.secret.expose_secret())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("secret", &"[REDACTED]")
            .field("compressed", &self.compressed)
            .finish()
    }
}

/// BIP-32 seed bytes, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SeedBytes(Vec<u8>);

impl SeedBytes {
    /// Wraps a seed, enforcing the BIP-32 length bounds (128 to 512 bits).
    pub fn new(data: Vec<u8>) -> Result<Self, CryptoError> {
        if !(16..=64).contains(&data.len()) {
            let len = data.len();
            let mut data = data;
            data.zeroize();
            return Err(CryptoError::InvalidSeedLength(len));
        }
        Ok(Self(data))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for SeedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SeedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeedBytes({} bytes)", self.0.len())
    }
}
