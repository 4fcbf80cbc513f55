//! Cache key derivation
//!
//! A key identifies one compilation: which unit of which package, for which
//! platform, from which content, under which effective compiler options and
//! per-unit options. Keys are derived
//! from content only, never from timestamps, so they are stable across
//! processes and restarts.

use crate::fingerprint::Fingerprint;
use crate::unit::{Platform, UnitOptions};

/// Bumped whenever the shape of stored entries or keys changes
pub const CACHE_FORMAT_VERSION: u32 = 2;

/// Derive the cache key for a unit compiled under a given option set.
///
/// The key covers, in order:
/// 1. the entry format version
/// 2. the unit path (output path and module name derive from it)
/// 3. the platform tag
/// 4. the unit's content fingerprint
/// 5. the fingerprint of the effective compiler options
/// 6. the owning package, if any (module name and transform path derive
///    from it)
/// 7. the per-unit options
pub fn derive_cache_key(
    path: &str,
    platform: &Platform,
    content: &Fingerprint,
    options: &Fingerprint,
    package: Option<&str>,
    unit_options: &UnitOptions,
) -> Fingerprint {
    let version = CACHE_FORMAT_VERSION.to_le_bytes();
    let package_tag = [u8::from(package.is_some())];
    let bare = [u8::from(unit_options.bare)];
    Fingerprint::of_parts([
        version.as_slice(),
        path.as_bytes(),
        platform.as_str().as_bytes(),
        content.as_bytes(),
        options.as_bytes(),
        package_tag.as_slice(),
        package.unwrap_or_default().as_bytes(),
        bare.as_slice(),
    ])
}
