use serde::Serialize;

use crate::patch::PatchStack;
use crate::snapshot::VersionToken;
use crate::util::hash::{ContentHash, HashError, ObjectHash, object_hash};

/// Identity of one module build.
///
/// Two builds with the same fingerprint start from the same upstream tree,
/// apply byte-identical patch files and compile with the same toolchain, so
/// they produce the same output.
pub type Fingerprint = ObjectHash;

#[derive(Serialize)]
struct FingerprintInput<'a> {
  token: &'a str,
  module: &'a str,
  patches: Vec<(usize, ContentHash)>,
  upstream: Option<&'a Fingerprint>,
  toolchain: &'a str,
}

/// Compute a module's fingerprint.
///
/// `upstream` is the fingerprint of the module this one is built on, so a
/// change anywhere up the chain invalidates every dependent. `toolchain` is
/// [`crate::toolchain::Toolchain::identity`].
pub fn fingerprint(
  token: &VersionToken,
  module: &str,
  stack: &PatchStack,
  upstream: Option<&Fingerprint>,
  toolchain: &str,
) -> Result<Fingerprint, HashError> {
  object_hash(&FingerprintInput {
    token: token.as_str(),
    module,
    patches: stack.checksums(),
    upstream,
    toolchain,
  })
}
