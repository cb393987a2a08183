//! Locates the `yt-dlp` extractor binary.
//!
//! Pure path resolution: no network fetch, no version/checksum verification
//! (that machinery belongs to a packaging/updater layer this crate doesn't
//! implement). The order mirrors how a bundled desktop app must behave when
//! it can't rely on the user's shell `PATH`.

use std::path::{Path, PathBuf};

use crate::error::VidBeeError;

const ENV_OVERRIDE: &str = "VIDBEE_YTDLP_PATH";

fn bundled_candidate() -> Option<PathBuf> {
    let exe_path = std::env::current_exe().ok()?;
    let exe_dir = exe_path.parent()?;

    let name = if cfg!(windows) {
        "yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp_linux"
    };

    let sidecar = exe_dir.join(name);
    if sidecar.exists() {
        return Some(sidecar);
    }

    let resources = exe_dir.parent()?.join("Resources").join(name);
    if resources.exists() {
        return Some(resources);
    }

    None
}

#[cfg(target_os = "macos")]
fn well_known_macos_paths() -> &'static [&'static str] {
    &[
        "/opt/homebrew/bin/yt-dlp", // Apple Silicon Homebrew
        "/usr/local/bin/yt-dlp",    // Intel Homebrew
        "/opt/local/bin/yt-dlp",    // MacPorts
    ]
}

#[cfg(not(target_os = "macos"))]
fn well_known_macos_paths() -> &'static [&'static str] {
    &[]
}

fn set_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mut perms = meta.permissions();
            if perms.mode() & 0o111 == 0 {
                perms.set_mode(perms.mode() | 0o111);
                let _ = std::fs::set_permissions(path, perms);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Resolves the path to the `yt-dlp` executable, trying (in order):
/// an explicit environment override, a bundled sidecar binary, well-known
/// macOS install locations, and finally a `PATH` lookup on Linux/FreeBSD.
/// Fails fast on Windows when nothing above matched.
pub fn locate_ytdlp() -> Result<PathBuf, VidBeeError> {
    if let Ok(over) = std::env::var(ENV_OVERRIDE) {
        let path = PathBuf::from(over);
        if path.exists() {
            return Ok(path);
        }
        return Err(VidBeeError::ExtractorNotFound(format!(
            "{ENV_OVERRIDE} points to a nonexistent path: {}",
            path.display()
        )));
    }

    if let Some(bundled) = bundled_candidate() {
        set_executable(&bundled);
        log::info!("found bundled yt-dlp at {:?}", bundled);
        return Ok(bundled);
    }

    for candidate in well_known_macos_paths() {
        let path = PathBuf::from(candidate);
        if path.exists() {
            log::info!("found yt-dlp at well-known path {:?}", path);
            return Ok(path);
        }
    }

    if cfg!(any(target_os = "linux", target_os = "freebsd")) {
        if let Ok(path) = which::which("yt-dlp") {
            log::info!("found yt-dlp on PATH at {:?}", path);
            return Ok(path);
        }
    }

    if cfg!(windows) {
        return Err(VidBeeError::ExtractorNotFound(
            "yt-dlp.exe was not found; set VIDBEE_YTDLP_PATH or bundle it next to the executable"
                .to_string(),
        ));
    }

    Err(VidBeeError::ExtractorNotFound(
        "yt-dlp was not found on PATH; install it with `pip install yt-dlp` or your platform's \
         package manager"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_missing_path_errors() {
        std::env::set_var(ENV_OVERRIDE, "/nonexistent/definitely/not/here/yt-dlp");
        let result = locate_ytdlp();
        std::env::remove_var(ENV_OVERRIDE);
        assert!(result.is_err());
    }

    #[test]
    fn env_override_existing_path_wins() {
        let dir = std::env::temp_dir();
        let fake = dir.join("vidbee_test_ytdlp_locator");
        std::fs::write(&fake, b"#!/bin/sh\n").unwrap();
        std::env::set_var(ENV_OVERRIDE, &fake);
        let result = locate_ytdlp();
        std::env::remove_var(ENV_OVERRIDE);
        let _ = std::fs::remove_file(&fake);
        assert_eq!(result.unwrap(), fake);
    }
}
