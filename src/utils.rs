//! Utility functions shared across the engine
//!
//! ## Categories
//!
//! - Hashing: SHA-256 over in-memory data, hex encoded
//! - Metadata files: atomic write via a same-directory temp file and rename
//! - Permissions: unix mode bits, mapped onto the read-only flag on Windows
//! - Paths: manifest path normalization, empty directory pruning, symlinks
//! - Display: short ids and human readable byte counts
//!
//! All functions are thread-safe and may be called concurrently.

use crate::error::{Result, RewindError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::trace;

/// Hash arbitrary data using SHA-256
///
/// # Returns
///
/// The digest as a 64-character lowercase hexadecimal string.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// First eight characters of an id or hash, for logs and listings
pub fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

/// Permission bits of a file as a unix-style mode
#[cfg(unix)]
pub fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Permission bits of a file as a unix-style mode
#[cfg(windows)]
pub fn mode_of(metadata: &fs::Metadata) -> u32 {
    // Only the read-only attribute survives the round trip on Windows
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Apply a unix-style mode to a path
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| RewindError::io_at("set permissions", path, e))
}

/// Apply a unix-style mode to a path
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|e| RewindError::io_at("stat", path, e))?;
    let mut perms = metadata.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).map_err(|e| RewindError::io_at("set permissions", path, e))
}

/// Remove a directory if it has no entries
///
/// # Returns
///
/// `true` when the directory was removed.
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path).map_err(|e| RewindError::io_at("remove dir", path, e))?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Remove empty directories from `start` upwards, stopping at `root`
pub fn prune_empty_parents(start: &Path, root: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut current = start.to_path_buf();
    while current != root && current.starts_with(root) {
        if !remove_dir_if_empty(&current)? {
            break;
        }
        removed += 1;
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    Ok(removed)
}

/// Convert a path under `root` into the `/`-separated key used in manifests
///
/// Name bytes that are not valid UTF-8, and `%` itself, are written as
/// `%XX` so every file name maps to exactly one key and back.
///
/// # Errors
///
/// - [`RewindError::Internal`] if `path` is not under `root`
/// - [`RewindError::CaptureIncomplete`] if a component cannot be encoded
pub fn manifest_path(path: &Path, root: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        RewindError::internal(format!("Path {:?} is not relative to {:?}", path, root))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(encode_component(part).ok_or_else(|| {
                RewindError::CaptureIncomplete {
                    path: path.to_path_buf(),
                    reason: "file name cannot be represented on this platform".to_string(),
                }
            })?),
            other => {
                return Err(RewindError::internal(format!(
                    "Unexpected component {:?} in {:?}",
                    other, path
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn component_bytes(part: &OsStr) -> Option<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    Some(part.as_bytes())
}

#[cfg(not(unix))]
fn component_bytes(part: &OsStr) -> Option<&[u8]> {
    part.to_str().map(str::as_bytes)
}

#[cfg(unix)]
fn component_from_bytes(bytes: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
fn component_from_bytes(bytes: Vec<u8>) -> OsString {
    OsString::from(String::from_utf8_lossy(&bytes).into_owned())
}

fn encode_component(part: &OsStr) -> Option<String> {
    let mut rest = component_bytes(part)?;
    let mut out = String::with_capacity(rest.len());
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                push_escaped(&mut out, valid);
                return Some(out);
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // from_utf8 accepted this prefix already
                push_escaped(&mut out, std::str::from_utf8(valid).ok()?);
                let bad = e.error_len().unwrap_or(after.len());
                for byte in &after[..bad] {
                    out.push_str(&format!("%{:02X}", byte));
                }
                rest = &after[bad..];
            }
        }
    }
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        if c == '%' {
            out.push_str("%25");
        } else {
            out.push(c);
        }
    }
}

fn decode_component(part: &str) -> OsString {
    if !part.contains('%') {
        return OsString::from(part);
    }
    let raw = part.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let escaped = raw
            .get(i + 1..i + 3)
            .filter(|_| raw[i] == b'%')
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(byte) => {
                bytes.push(byte);
                i += 3;
            }
            None => {
                bytes.push(raw[i]);
                i += 1;
            }
        }
    }
    component_from_bytes(bytes)
}

/// Resolve a manifest key back onto `root`
pub fn resolve_manifest_path(root: &Path, key: &str) -> PathBuf {
    key.split('/')
        .fold(root.to_path_buf(), |acc, part| acc.join(decode_component(part)))
}

/// Format a byte count for humans ("1.50 KB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Write `content` to `path` so readers see either the old or new file
///
/// The bytes go to a temp file in the same directory which is then renamed
/// over the destination.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RewindError::internal(format!("{:?} has no parent directory", path)))?;
    fs::create_dir_all(parent).map_err(|e| RewindError::io_at("create dir", parent, e))?;

    let mut temp =
        NamedTempFile::new_in(parent).map_err(|e| RewindError::io_at("create temp file", parent, e))?;
    temp.write_all(content)
        .and_then(|_| temp.flush())
        .map_err(|e| RewindError::io_at("write", temp.path().to_path_buf(), e))?;
    temp.persist(path)
        .map_err(|e| RewindError::io_at("persist", path, e.error))?;
    Ok(())
}

/// Create a symbolic link at `link` pointing to `target`
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| RewindError::io_at("symlink", link, e))
}

/// Create a symbolic link at `link` pointing to `target`
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
    let result = if resolved.is_dir() {
        symlink_dir(target, link)
    } else {
        symlink_file(target, link)
    };
    result.map_err(|e| RewindError::io_at("symlink", link, e))
}

/// Check a session id is usable as a directory name
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id != "."
        && session_id != ".."
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RewindError::InvalidSessionId(session_id.to_string()))
    }
}
