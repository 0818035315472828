//! Challenge-response handshake.
//!
//! Both ends share a key out of band. Each derives two tokens, the lowercase
//! hex rendering of a keyed BLAKE2b digest (`AUTH_SIZE` bytes) of a fixed
//! constant:
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |  -- hex(BLAKE2b(key, HANDSHAKE1)) -->  |  read exactly 2*AUTH_SIZE bytes
//!   |                                        |  compare with own ref1
//!   |  <-- hex(BLAKE2b(key, HANDSHAKE2)) --  |  on match
//!   |      OR connection closed, no reply    |  on mismatch / short read
//! ```
//!
//! # Security Considerations
//!
//! - The challenge is fixed, not a nonce. The exchange proves possession of
//!   the shared key but gives no replay protection. Changing that alters the
//!   wire protocol, so it is kept as is.
//! - A failed handshake never sends a diagnostic to the peer.
//! - Token comparison is constant-time.

use std::fmt;

use blake2::digest::consts::U16;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::error::{RemoteFitError, Result};

/// Digest size in bytes of the handshake MAC
pub const AUTH_SIZE: usize = 16;

/// Constant digested into the client's challenge token
pub const HANDSHAKE1: &[u8] = b"remotefit handshake request v1";

/// Constant digested into the server's response token
pub const HANDSHAKE2: &[u8] = b"remotefit handshake response v1";

/// Key used when none is configured
pub const DEFAULT_AUTH_KEY: &str = "empty";

/// Maximum key length accepted by keyed BLAKE2b
pub const MAX_KEY_SIZE: usize = 64;

type HandshakeMac = Blake2bMac<U16>;

/// Shared secret (wiped on drop)
#[derive(Clone)]
pub struct SharedKey(Zeroizing<Vec<u8>>);

impl SharedKey {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > MAX_KEY_SIZE {
            return Err(RemoteFitError::Config(format!(
                "Auth key too long: {} bytes (maximum {MAX_KEY_SIZE})",
                bytes.len()
            )));
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for SharedKey {
    fn default() -> Self {
        Self(Zeroizing::new(DEFAULT_AUTH_KEY.as_bytes().to_vec()))
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey([REDACTED; {}])", self.0.len())
    }
}

/// Precomputed handshake tokens for one shared key
#[derive(Clone)]
pub struct Authenticator {
    challenge: Vec<u8>,
    response: Vec<u8>,
}

impl Authenticator {
    /// Derive both tokens from the shared key
    pub fn new(key: &SharedKey) -> Result<Self> {
        Ok(Self {
            challenge: token(key.as_bytes(), HANDSHAKE1)?,
            response: token(key.as_bytes(), HANDSHAKE2)?,
        })
    }

    /// Token the client presents (`ref1`)
    pub fn challenge(&self) -> &[u8] {
        &self.challenge
    }

    /// Token the server answers with (`ref2`)
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Check a presented challenge
    pub fn verify_challenge(&self, presented: &[u8]) -> bool {
        constant_time_eq(&self.challenge, presented)
    }

    /// Check a received response
    pub fn verify_response(&self, received: &[u8]) -> bool {
        constant_time_eq(&self.response, received)
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("token_len", &self.challenge.len())
            .finish()
    }
}

/// Server half: read and check the challenge, answer on success.
///
/// On failure nothing is written; the caller closes the connection.
pub async fn accept<R, W>(auth: &Authenticator, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut presented = vec![0u8; auth.challenge().len()];
    reader
        .read_exact(&mut presented)
        .await
        .map_err(|e| RemoteFitError::HandshakeFailed(format!("short challenge: {e}")))?;

    if !auth.verify_challenge(&presented) {
        return Err(RemoteFitError::HandshakeFailed(
            "challenge mismatch".to_string(),
        ));
    }

    tracing::debug!("Incoming challenge correct, sending response");
    writer.write_all(auth.response()).await?;
    writer.flush().await?;
    Ok(())
}

/// Client half: present the challenge and check the server's response.
pub async fn initiate<R, W>(auth: &Authenticator, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(auth.challenge()).await?;
    writer.flush().await?;

    let mut received = vec![0u8; auth.response().len()];
    reader.read_exact(&mut received).await.map_err(|e| {
        RemoteFitError::HandshakeFailed(format!("server closed without responding: {e}"))
    })?;

    if !auth.verify_response(&received) {
        return Err(RemoteFitError::HandshakeFailed(
            "unexpected server response".to_string(),
        ));
    }
    Ok(())
}

/// Hex rendering of the keyed digest of `data`
fn token(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HandshakeMac as Mac>::new_from_slice(key)
        .map_err(|e| RemoteFitError::Config(format!("Invalid auth key: {e}")))?;
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    Ok(hex_encode(&digest).into_bytes())
}

/// Simple hex encoder
fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
