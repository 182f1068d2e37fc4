//! Binary deltas: zstd compression with the original binary as dictionary.

use std::io::{self, Read, Write};

/// Algorithm name recorded in the bootstrap manifest.
pub const DELTA_ALGORITHM: &str = "zstd-dict";

const COMPRESSION_LEVEL: i32 = 19;

/// Encode `patched` relative to `original`.
pub fn encode(original: &[u8], patched: &[u8]) -> io::Result<Vec<u8>> {
  let dict = zstd::dict::EncoderDictionary::copy(original, COMPRESSION_LEVEL);
  let mut encoder = zstd::Encoder::with_prepared_dictionary(Vec::new(), &dict)?;
  encoder.write_all(patched)?;
  encoder.finish()
}

/// Rebuild the patched binary from `original` and a delta made by [`encode`].
pub fn decode(original: &[u8], delta: &[u8]) -> io::Result<Vec<u8>> {
  let dict = zstd::dict::DecoderDictionary::copy(original);
  let mut decoder = zstd::Decoder::with_prepared_dictionary(delta, &dict)?;
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(out)
}
