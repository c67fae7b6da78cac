//! Gzip encoding for large checkpoint blobs.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::{AppError, Result};

/// Gzip-compress `data` at the default level.
///
/// # Errors
///
/// Returns `AppError::Codec` if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|err| AppError::Codec(format!("gzip encode: {err}")))?;
    encoder
        .finish()
        .map_err(|err| AppError::Codec(format!("gzip encode: {err}")))
}

/// Inflate a gzip stream produced by [`compress`].
///
/// # Errors
///
/// Returns `AppError::Codec` if the stream is corrupt or truncated.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| AppError::Codec(format!("gzip decode: {err}")))?;
    Ok(out)
}
