use crate::error::{VpnAcctError, VpnAcctResult};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Helpers shared by the drivers and the file-backed stores

/// Run an external program with a hard deadline and return its stdout.
///
/// A nonzero exit maps to `CommandFailed` carrying stderr; exceeding the
/// deadline kills the child and maps to `Timeout`.
pub async fn run_command<S: AsRef<OsStr>>(program: &Path, args: &[S], timeout: Duration) -> VpnAcctResult<String> {
    let rendered = render_command(program, args);
    debug!("Running: {}", rendered);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| VpnAcctError::ConnectionFailed {
            reason: format!("Failed to start {:?}: {}", program, e),
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(VpnAcctError::Timeout(format!(
                "'{}' did not finish within {}s",
                rendered,
                timeout.as_secs()
            )))
        }
    };

    if !output.status.success() {
        return Err(VpnAcctError::CommandFailed {
            cmd: rendered,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Flags whose following argument is a secret
const SECRET_FLAGS: &[&str] = &["--new_pass"];

/// Command line for logs and error messages, with secrets masked
fn render_command<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    let mut rendered = program.display().to_string();
    let mut mask_next = false;
    for arg in args {
        let arg = arg.as_ref().to_string_lossy();
        rendered.push(' ');
        if mask_next {
            rendered.push_str("********");
        } else {
            rendered.push_str(&arg);
        }
        mask_next = SECRET_FLAGS.iter().any(|flag| *flag == arg);
    }
    rendered
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> VpnAcctResult<()> {
    if !tokio::fs::try_exists(path).await? {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| VpnAcctError::Storage(format!("Failed to create directory {:?}: {}", path, e)))?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Replace `path` with `content` so readers see either the old or the new file.
///
/// The content goes to a sibling temp file first, gets its permissions set,
/// and is then renamed over the target. Missing parent directories are created.
pub async fn write_atomic(path: &Path, content: &str, permissions: u32) -> VpnAcctResult<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_directory_exists(parent).await?;
    }

    let tmp = temp_path_for(path);
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| VpnAcctError::Storage(format!("Failed to write {:?}: {}", tmp, e)))?;

    let perms = std::fs::Permissions::from_mode(permissions);
    if let Err(e) = tokio::fs::set_permissions(&tmp, perms).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(VpnAcctError::Storage(format!("Failed to set permissions on {:?}: {}", tmp, e)));
    }

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(VpnAcctError::Storage(format!("Failed to replace {:?}: {}", path, e)));
    }

    debug!("Wrote {:?} with permissions {:o}", path, permissions);
    Ok(())
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn temp_path_for(path: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.tmp.{}.{}", file_name_of(path), std::process::id(), seq))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Exclusive advisory lock on a file's `.lock` sidecar, released on drop.
///
/// Serializes read-modify-write cycles between every process sharing the
/// file, and between separate handles inside one process.
#[derive(Debug)]
pub struct FileLock {
    _file: std::fs::File,
}

/// Block until the `flock(2)` lock next to `path` is ours
pub async fn lock_exclusive(path: &Path) -> VpnAcctResult<FileLock> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_directory_exists(parent).await?;
    }

    let lock_path = path.with_file_name(format!(".{}.lock", file_name_of(path)));
    let lock_display = lock_path.clone();

    let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                return Ok(file);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    })
    .await
    .map_err(|e| VpnAcctError::Storage(format!("Lock task for {:?} failed: {}", lock_display, e)))?
    .map_err(|e| VpnAcctError::Storage(format!("Failed to lock {:?}: {}", lock_display, e)))?;

    debug!("Holding lock {:?}", lock_display);
    Ok(FileLock { _file: file })
}

/// Read a file, treating a missing file as `None`
pub async fn read_optional(path: &Path) -> VpnAcctResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VpnAcctError::Storage(format!("Failed to read {:?}: {}", path, e))),
    }
}
