//! Coverage payloads carried by `__coverage_start;path;payload`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

/// Decode a coverage payload. `.` stands for the byte `00`; the rest is a
/// plain hex string. Returns `None` on malformed input.
pub fn decode_payload(payload: &str) -> Option<Vec<u8>> {
    let hex = payload.trim().replace('.', "00");
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Where a dump for `path` lands. When the directory part is relative and
/// missing (a bare file name included) the file goes straight into
/// `build_path` under its own name.
pub fn dump_path(build_path: &Path, path: &str) -> PathBuf {
    let target = PathBuf::from(path);
    let dir = target.parent().unwrap_or(Path::new(""));
    let keep = dir.is_absolute() || (!dir.as_os_str().is_empty() && dir.is_dir());
    if keep {
        return target;
    }
    match target.file_name() {
        Some(name) => build_path.join(name),
        None => build_path.join(target),
    }
}

/// Write a decoded payload, creating parent directories as needed.
pub fn dump(build_path: &Path, path: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    let target = dump_path(build_path, path);
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&target, data)?;
    info!(path = %target.display(), bytes = data.len(), "Coverage data stored");
    Ok(target)
}
