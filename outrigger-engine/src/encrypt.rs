//! The transport-security interface the stream engine consumes.
//!
//! An [`Encryption`] capability owns the handshake and record protocol;
//! the engine only moves bytes. During an upgrade the engine feeds inbound
//! ciphertext through [`absorb`](Encryption::absorb) and transmits whatever
//! the capability emits, parking user sends in a pre-encryption queue until
//! [`is_established`](Encryption::is_established) turns true. During a
//! downgrade the engine drains the capability's closing records before
//! switching back to cleartext.

use bytes::BytesMut;

use outrigger_core::error::Result;

/// A transport-security capability driven by the stream engine.
pub trait Encryption: Send + Sync {
    /// Begin the handshake, appending the first flight to `output`.
    fn initiate(&self, output: &mut BytesMut) -> Result<()>;

    /// Absorb inbound ciphertext.
    ///
    /// Decrypted application data is appended to `plaintext`; any records
    /// the handshake or protocol requires in response are appended to
    /// `output` for transmission.
    fn absorb(
        &self,
        input: &[u8],
        plaintext: &mut BytesMut,
        output: &mut BytesMut,
    ) -> Result<()>;

    /// Encrypt outbound application data, appending records to `output`.
    fn seal(&self, plaintext: &[u8], output: &mut BytesMut) -> Result<()>;

    /// Whether the handshake has completed.
    fn is_established(&self) -> bool;

    /// Emit the closing records, appending them to `output`.
    fn shutdown(&self, output: &mut BytesMut) -> Result<()>;
}
