//! Per-trial run directories.

use crate::error::BfResult;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files every workspace needs before the simulator can start.
pub const AUX_PATTERNS: &[&str] = &["*.inp", "*.T7", "SAVECO*"];
/// Bulky intermediate outputs deleted once a trial finishes.
pub const SCRATCH_PATTERNS: &[&str] = &["*.T2", "*.T3"];

/// Single-`*` wildcard match, case-sensitive.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

fn matches_any(patterns: &[&str], name: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, name))
}

/// `<dir>/<stem>_<index>`
pub fn workspace_dir(dir: &Path, stem: &str, index: usize) -> PathBuf {
    dir.join(format!("{}_{}", stem, index))
}

/// True for directory names of the form `<stem>_<digits>`.
pub fn is_workspace_name(name: &str, stem: &str) -> bool {
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Removes workspaces left behind by an earlier batch.
pub fn cleanup_workspaces(dir: &Path, stem: &str) -> BfResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if entry.file_type()?.is_dir() && is_workspace_name(name, stem) {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("Removed {} stale workspaces in {:?}", removed, dir);
    }
    Ok(removed)
}

/// Creates `dest` and copies the matching regular files of `src` into it.
pub fn populate(src: &Path, dest: &Path, patterns: &[&str]) -> BfResult<usize> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| matches_any(patterns, n)) {
            fs::copy(entry.path(), dest.join(&name))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Best-effort deletion of scratch outputs; failures are only logged.
pub fn remove_scratch(dir: &Path, patterns: &[&str]) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_str().is_some_and(|n| matches_any(patterns, n)) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not delete {:?}: {}", entry.path(), e),
        }
    }
    removed
}
