//! The compression interface the engine consumes.
//!
//! Compression drivers are external capabilities. When one is registered,
//! the engine deflates payloads as they enter the write queue and inflates
//! them as receive completions arrive; the context reports the byte counts
//! either way. Deflate failures surface synchronously to the sender;
//! inflate failures behave as transport errors.

use bytes::BytesMut;

use outrigger_core::error::Result;

/// The algorithm a compression capability implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    Undefined,
    /// Run-length encoding.
    Rle,
    /// LZ4 block compression.
    Lz4,
    /// Zstandard.
    Zstd,
    /// DEFLATE with a gzip wrapper.
    Gzip,
}

/// Byte accounting for one deflate or inflate pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionContext {
    /// The algorithm that produced the output.
    pub compression_type: CompressionType,
    /// Bytes consumed from the input.
    pub bytes_read: usize,
    /// Bytes appended to the output.
    pub bytes_written: usize,
}

/// Options for one deflate pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeflateOptions {
    /// Request a content checksum when the algorithm supports one.
    pub checksum: bool,
}

/// Options for one inflate pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct InflateOptions {
    /// Verify the content checksum when one is present.
    pub checksum: bool,
}

/// A compression capability.
pub trait Compression: Send + Sync {
    /// The algorithm this capability implements.
    fn compression_type(&self) -> CompressionType;

    /// Compress `input`, appending to `output`.
    fn deflate(
        &self,
        context: &mut CompressionContext,
        output: &mut BytesMut,
        input: &[u8],
        options: &DeflateOptions,
    ) -> Result<()>;

    /// Decompress `input`, appending to `output`.
    fn inflate(
        &self,
        context: &mut CompressionContext,
        output: &mut BytesMut,
        input: &[u8],
        options: &InflateOptions,
    ) -> Result<()>;
}
