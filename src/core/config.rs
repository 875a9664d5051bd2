use std::collections::HashMap;
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// In-archive directory holding the top-level secondary dex payloads.
pub const SECONDARY_DEX_DIR: &str = "assets/secondary-program-dex-jars";

/// Store name used for the top-level unit's concatenated xzs blob.
pub const SECONDARY_STORE_NAME: &str = "secondary";

pub const METADATA_FILE: &str = "metadata.txt";

/// Presence of this file at the archive root marks a split/bundle layout
/// with a `base/` root instead of the flat APK shape.
pub const BUNDLE_CONFIG_FILE: &str = "BundleConfig.pb";

/// Scratch directory for decompressed native-library blobs, created lazily
/// beside each blob and removed unconditionally before repacking.
pub const EXTRACTED_LIBS_DIR: &str = "__extracted_libs__";

/// Fixed timestamp written by the zip normalizer when the caller does not
/// supply one: 1985-02-01 00:00:00 in DOS format.
pub const FIXED_DOS_DATE: u16 = (5 << 9) | (2 << 5) | 1;
pub const FIXED_DOS_TIME: u16 = 0;

/// Knobs for one repackage pass. `fast` trades compression ratio for speed
/// (xzs blobs are compressed at level 0 instead of maximal).
#[derive(Clone, Debug, Default)]
pub struct RepackOptions {
    pub have_locators: bool,
    pub locator_store_id: u32,
    pub fast: bool,
    pub reset_timestamps: bool,
}

/// Mutable state threaded through one unpack/repackage run.
///
/// The original kept these as process-wide globals (a memoized warn-once
/// flag, an implicit rename table); here they are explicit fields so two
/// runs can never observe each other's state.
#[derive(Debug, Default)]
pub struct RunContext {
    /// Explicit path to an external `xz` binary. When unset, `xz` is probed
    /// on the search path and the in-process codec is the fallback.
    pub xz_binary: Option<PathBuf>,
    /// Maps a repacked entry path to the in-archive path it was renamed
    /// from, so the original compression method can still be restored.
    pub renames: HashMap<String, String>,
    warned_slow_xz: bool,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_xz_binary(xz_binary: Option<PathBuf>) -> Self {
        Self {
            xz_binary,
            ..Self::default()
        }
    }

    /// Logs the in-process xz fallback warning once per run.
    pub fn note_slow_xz(&mut self) {
        if !self.warned_slow_xz {
            log::warn!(
                "external `xz` binary not found; falling back to the in-process single-threaded codec (this will be slow)"
            );
            self.warned_slow_xz = true;
        }
    }

    #[cfg(test)]
    pub fn warned_slow_xz(&self) -> bool {
        self.warned_slow_xz
    }
}
