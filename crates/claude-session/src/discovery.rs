use std::path::{Path, PathBuf};

use crate::{Result, SessionError};

const BINARY_NAME: &str = "claude";

/// Resolve the CLI executable before anything is spawned.
///
/// With `explicit` paths, exactly those are checked in order. Otherwise
/// `claude` is looked up on `PATH`, then in the usual install locations.
/// On failure every location that was checked is reported.
pub fn resolve_executable(explicit: &[PathBuf]) -> Result<PathBuf> {
    if !explicit.is_empty() {
        return first_existing(explicit.to_vec());
    }

    if let Ok(found) = which::which(BINARY_NAME) {
        return Ok(found);
    }

    let mut searched = path_candidates();
    searched.extend(install_locations());
    first_existing(searched)
}

fn first_existing(candidates: Vec<PathBuf>) -> Result<PathBuf> {
    match candidates.iter().find(|p| is_executable_file(p)) {
        Some(found) => {
            tracing::debug!(path = %found.display(), "resolved claude executable");
            Ok(found.clone())
        }
        None => Err(SessionError::CliNotFound {
            searched: candidates,
        }),
    }
}

/// `<dir>/claude` for every `PATH` entry, reported when the lookup fails.
fn path_candidates() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(BINARY_NAME))
                .collect()
        })
        .unwrap_or_default()
}

fn install_locations() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = home::home_dir() {
        paths.push(home.join(".claude/local/claude"));
        paths.push(home.join(".npm-global/bin/claude"));
    }
    paths.push(PathBuf::from("/usr/local/bin/claude"));
    if let Some(home) = home::home_dir() {
        paths.push(home.join(".local/bin/claude"));
        paths.push(home.join("node_modules/.bin/claude"));
    }
    paths
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
