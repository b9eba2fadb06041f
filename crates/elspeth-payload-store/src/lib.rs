// crates/elspeth-payload-store/src/lib.rs
// ============================================================================
// Crate: elspeth-payload-store
// Description: Content-addressed filesystem blob store.
// Purpose: Store audit payloads (row bodies, routing reasons, call bodies)
//          too large or sensitive to inline in the audit database, keyed by
//          their own SHA-256 hash.
// Dependencies: elspeth-core, cap-std, cap-primitives, sha2
// ============================================================================

//! ## Overview
//! [`FilePayloadStore`] implements
//! [`PayloadStore`](elspeth_core::runtime::PayloadStore) over a directory
//! tree, fanned out by hash prefix to keep any one directory small. All
//! writes go through a [`cap_std::fs::Dir`] capability rooted at the store's
//! base directory so a malformed or adversarial reference can never escape
//! it, mirroring the rooted-directory pattern used for untrusted file
//! references elsewhere in this codebase. `retrieve` recomputes the hash of
//! every blob it reads and refuses to return content that no longer matches
//! its own reference.

use std::io::Read;
use std::io::Write;
use std::path::Path;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use cap_std::fs::OpenOptions;
use elspeth_core::runtime::PayloadStore;
use elspeth_core::runtime::RecorderError;
use sha2::Digest;
use sha2::Sha256;

/// Number of leading hex characters used as the fan-out directory prefix.
const PREFIX_LEN: usize = 2;

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Validates a hex hash is exactly 64 lowercase hex characters (SHA-256).
fn validate_hash(hash: &str) -> Result<(), RecorderError> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(RecorderError::new(format!("'{hash}' is not a well-formed sha-256 hex digest")));
    }
    Ok(())
}

fn relative_path(hash: &str) -> String {
    let (prefix, rest) = hash.split_at(PREFIX_LEN);
    format!("{prefix}/{rest}")
}

fn io_err(context: &str, err: std::io::Error) -> RecorderError {
    RecorderError::new(format!("{context}: {err}"))
}

/// Content-addressed blob store rooted at a directory on disk.
pub struct FilePayloadStore {
    root: Dir,
}

impl FilePayloadStore {
    /// Opens (creating if absent) a payload store rooted at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the root directory cannot be created or
    /// opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| io_err("creating payload store root", e))?;
        let root = Dir::open_ambient_dir(path, ambient_authority()).map_err(|e| io_err("opening payload store root", e))?;
        Ok(Self { root })
    }
}

impl PayloadStore for FilePayloadStore {
    fn store(&mut self, bytes: &[u8]) -> Result<String, RecorderError> {
        let hash = sha256_hex(bytes);
        let rel = relative_path(&hash);
        let prefix = Path::new(&rel).parent().unwrap_or_else(|| Path::new(""));
        self.root
            .create_dir_all(prefix)
            .map_err(|e| io_err("creating payload fan-out directory", e))?;

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        match self.root.open_with(&rel, &options) {
            Ok(mut file) => {
                file.write_all(bytes).map_err(|e| io_err("writing payload", e))?;
                file.flush().map_err(|e| io_err("flushing payload", e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // `store` is idempotent: content-addressing guarantees an
                // existing blob at this path already has these bytes.
            }
            Err(e) => return Err(io_err("writing payload", e)),
        }
        Ok(hash)
    }

    fn exists(&mut self, reference: &str) -> Result<bool, RecorderError> {
        validate_hash(reference)?;
        match self.root.metadata(relative_path(reference)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("checking payload existence", e)),
        }
    }

    fn retrieve(&mut self, reference: &str) -> Result<Vec<u8>, RecorderError> {
        validate_hash(reference)?;
        let mut file = self
            .root
            .open(relative_path(reference))
            .map_err(|e| io_err("opening payload", e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| io_err("reading payload", e))?;
        let actual = sha256_hex(&bytes);
        if actual != reference {
            return Err(RecorderError::new(format!(
                "payload '{reference}' is corrupt: recomputed hash '{actual}' does not match"
            )));
        }
        Ok(bytes)
    }

    fn delete(&mut self, reference: &str) -> Result<bool, RecorderError> {
        validate_hash(reference)?;
        match self.root.remove_file(relative_path(reference)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("deleting payload", e)),
        }
    }
}
