//! Transport-level decompression for tunneled response bodies.
//!
//! A response declares its compression as an ordered chain of content-encoding tokens;
//! decompression applies the chain strictly left-to-right, each stage consuming the
//! previous stage's output. Three token families are implemented:
//!
//! - `gzip` — multi-member decoder first (concatenated gzip members are legal and
//!   appear in the wild; a single-member decode would stop at the first boundary),
//!   strict single-member decoder as the fallback-on-error;
//! - `deflate` — zlib-wrapped decoder first, raw-deflate fallback-on-error (several
//!   widespread HTTP stacks emit raw deflate under the `deflate` token);
//! - `br` — Brotli, resolved lazily on first use through an injectable capability so
//!   tests can substitute the codec.
//!
//! Tokens are normalized before dispatch (trimmed, lowercased, a leading `x-` vendor
//! prefix stripped). Anything unrecognized is a hard [`UnsupportedEncoding`] failure:
//! silently returning compressed bytes as if decoded would corrupt the logical body.
//!
//! [`UnsupportedEncoding`]: crate::TunnelError::UnsupportedEncoding

use std::io::{self, Read};

use flate2::read::{DeflateDecoder, GzDecoder, MultiGzDecoder, ZlibDecoder};
use nom::{
    bytes::complete::{tag, take_till, take_while1},
    character::complete::space0,
    combinator::opt,
    multi::separated_list0,
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};
use once_cell::sync::OnceCell;

use crate::headers::HeaderMap;
use crate::{Result, TunnelError};

/// The accepted-encoding string a client advertises on its request envelope.
pub const ACCEPT_ENCODING: &str = "gzip, deflate, br; q=0.9, identity; q=0.8";

/// A Brotli decoder capability.
///
/// The pipeline resolves one of these lazily the first time a `br` token is seen and
/// caches it for the rest of the exchange, so the dependency stays explicit and a test
/// can substitute its own via [`Decompression::with_brotli`].
pub trait BrotliCodec: Send + Sync {
    /// Decompresses one complete Brotli stream.
    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>>;
}

/// Default Brotli capability backed by the `brotli` crate.
struct DefaultBrotli;

impl BrotliCodec for DefaultBrotli {
    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        brotli::Decompressor::new(input, 4096).read_to_end(&mut output)?;
        Ok(output)
    }
}

/// The decompression pipeline for one exchange.
///
/// Holds no mutable state besides the lazily resolved Brotli codec; a fresh default
/// value is appropriate per call site and is what [`crate::FetchOptions`] starts with.
pub struct Decompression {
    brotli: OnceCell<Box<dyn BrotliCodec>>,
}

impl Default for Decompression {
    fn default() -> Self {
        Self {
            brotli: OnceCell::new(),
        }
    }
}

impl Decompression {
    /// Creates a pipeline with the default codecs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pipeline with a substituted Brotli capability.
    pub fn with_brotli(codec: Box<dyn BrotliCodec>) -> Self {
        let brotli = OnceCell::new();
        let _ = brotli.set(codec);
        Self { brotli }
    }

    /// Decompresses one stage of a content-encoding chain.
    ///
    /// The token is normalized (case-insensitive, leading `x-` stripped) before
    /// dispatch. An unrecognized token fails with
    /// [`TunnelError::UnsupportedEncoding`] rather than passing bytes through.
    pub fn decompress(&self, input: &[u8], token: &str) -> Result<Vec<u8>> {
        match normalize(token).as_str() {
            "gzip" => Ok(gzip(input)?),
            "deflate" => Ok(deflate(input)?),
            "br" => {
                let codec = self.brotli.get_or_init(|| Box::new(DefaultBrotli));
                Ok(codec.decompress(input)?)
            }
            other => Err(TunnelError::UnsupportedEncoding(other.to_owned())),
        }
    }

    /// Applies a declared encoding chain strictly left-to-right.
    pub fn decompress_chain(&self, input: &[u8], tokens: &[String]) -> Result<Vec<u8>> {
        let mut output = input.to_vec();
        for token in tokens {
            output = self.decompress(&output, token)?;
        }
        Ok(output)
    }
}

/// Extracts the content-encoding chain declared on a response head, in declared order.
pub fn encoding_chain(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_str("content-encoding")
        .map(parse_encoding_list)
        .unwrap_or_default()
}

/// Normalizes one content-encoding token: trim, lowercase, strip a leading `x-`
/// vendor prefix (`x-gzip` and `gzip` are the same coding).
fn normalize(token: &str) -> String {
    let token = token.trim().to_ascii_lowercase();
    match token.strip_prefix("x-") {
        Some(stripped) => stripped.to_owned(),
        None => token,
    }
}

/// Parses a comma-separated encoding list, tolerating `;q=` style parameters after
/// each token. Unparsable input yields an empty chain.
pub fn parse_encoding_list(input: &str) -> Vec<String> {
    match separated_list0(tag(","), encoding_entry).parse(input) {
        Ok((_, tokens)) => tokens
            .into_iter()
            .map(normalize)
            .filter(|token| !token.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// One list entry: a token, optionally followed by parameters up to the next comma.
fn encoding_entry(input: &str) -> IResult<&str, &str> {
    terminated(
        encoding_token,
        opt(preceded(tag(";"), take_till(|c| c == ','))),
    )
    .parse(input)
}

/// A bare encoding token surrounded by optional whitespace.
fn encoding_token(input: &str) -> IResult<&str, &str> {
    delimited(
        space0,
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        space0,
    )
    .parse(input)
}

/// Decodes one gzip stream. The multi-member decoder is the primary path: a
/// single-member decode of a concatenated stream stops successfully at the first
/// member boundary and would silently truncate the body. The strict single-member
/// decoder is the retry on failure.
fn gzip(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    match MultiGzDecoder::new(input).read_to_end(&mut output) {
        Ok(_) => Ok(output),
        Err(_) => {
            #[cfg(feature = "logging")]
            log::debug!("multi-member gzip decode failed, retrying as single-member");

            let mut output = Vec::new();
            GzDecoder::new(input).read_to_end(&mut output)?;
            Ok(output)
        }
    }
}

/// Decodes one deflate stream, trying the zlib wrapper first and falling back to raw
/// deflate on failure.
fn deflate(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    match ZlibDecoder::new(input).read_to_end(&mut output) {
        Ok(_) => Ok(output),
        Err(_) => {
            #[cfg(feature = "logging")]
            log::debug!("zlib-wrapped deflate decode failed, retrying as raw deflate");

            let mut output = Vec::new();
            DeflateDecoder::new(input).read_to_end(&mut output)?;
            Ok(output)
        }
    }
}
