//! Entry data encoding for the zip codec: store and deflate.

#[cfg(feature = "deflate")]
use std::io::Write;

#[cfg(feature = "deflate")]
use flate2::Compression;
#[cfg(feature = "deflate")]
use flate2::bufread::DeflateDecoder;
#[cfg(feature = "deflate")]
use flate2::write::DeflateEncoder;

use super::structures::{METHOD_DEFLATE, METHOD_STORED};
use crate::safety::read_to_vec_limited;
use crate::{Error, Result};

/// Decodes an entry's raw data.
///
/// `limit` caps the decoded size; `size_hint` is the size the header claims.
pub(crate) fn decode(method: u16, raw: &[u8], size_hint: u64, limit: u64) -> Result<Vec<u8>> {
    match method {
        METHOD_STORED => read_to_vec_limited(raw, limit, size_hint),
        #[cfg(feature = "deflate")]
        METHOD_DEFLATE => read_to_vec_limited(DeflateDecoder::new(raw), limit, size_hint),
        #[cfg(not(feature = "deflate"))]
        METHOD_DEFLATE => Err(Error::UnsupportedCompressionMethod {
            method: "deflate (feature disabled)".into(),
        }),
        other => Err(Error::UnsupportedCompressionMethod {
            method: format!("zip method {}", other),
        }),
    }
}

/// Encoded entry data ready to be written.
pub(crate) struct Encoded {
    pub method: u16,
    pub data: Vec<u8>,
}

/// Encodes `data`, preferring deflate only when it actually saves space.
///
/// With `keep_stored` the data is stored regardless; EPUB readers require
/// the `mimetype` entry to stay uncompressed.
pub(crate) fn encode(data: &[u8], level: u32, keep_stored: bool) -> Result<Encoded> {
    if keep_stored || data.is_empty() {
        return Ok(stored(data));
    }
    #[cfg(feature = "deflate")]
    {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        if compressed.len() < data.len() {
            return Ok(Encoded {
                method: METHOD_DEFLATE,
                data: compressed,
            });
        }
    }
    #[cfg(not(feature = "deflate"))]
    let _ = level;
    Ok(stored(data))
}

fn stored(data: &[u8]) -> Encoded {
    Encoded {
        method: METHOD_STORED,
        data: data.to_vec(),
    }
}
