//! Remote filesystem staging helpers shared by the deploy and run paths
//!
//! Every recoverable operation follows the plain-path-then-elevated-path
//! pattern exactly once; ownership fixes are best-effort and only logged.

use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use el_core::error::RemoteError;
use el_core::remote::RemoteExec;
use el_core::shell::quote;

/// Sink for progress lines; appends to the owning job's or run's log.
pub(crate) type LogFn<'a> = &'a (dyn Fn(&str) + Sync);

const CHOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Ensure a remote directory exists. Plain `mkdir -p` first; on failure retry
/// elevated and then try to hand ownership back to the login user.
pub(crate) async fn ensure_dir(
    remote: &dyn RemoteExec,
    username: &str,
    dir: &str,
    log: LogFn<'_>,
) -> Result<(), RemoteError> {
    match remote.mkdir_all(dir, false).await {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::debug!("mkdir {} failed without elevation: {}", dir, first);
            remote.mkdir_all(dir, true).await?;
            chown_tree(remote, username, dir, log).await;
            Ok(())
        }
    }
}

/// Best-effort recursive chown back to the login user.
pub(crate) async fn chown_tree(remote: &dyn RemoteExec, username: &str, path: &str, log: LogFn<'_>) {
    let command = format!("chown -R {0}:{0} {1}", quote(username), quote(path));
    match remote.run(&command, true, Some(CHOWN_TIMEOUT)).await {
        Ok(out) if out.success() => {}
        _ => log(&format!(
            "warn: could not restore ownership of {}; later steps may need elevation",
            path
        )),
    }
}

/// Best-effort non-recursive chown of a single file.
pub(crate) async fn chown_file(remote: &dyn RemoteExec, username: &str, path: &str, log: LogFn<'_>) {
    let command = format!("chown {0}:{0} {1}", quote(username), quote(path));
    match remote.run(&command, true, Some(CHOWN_TIMEOUT)).await {
        Ok(out) if out.success() => {}
        _ => log(&format!("warn: could not restore ownership of {}", path)),
    }
}

/// Upload bytes to the device. Direct transfer first, verified by checksum;
/// on failure fall back to a privileged write and chown the result back.
///
/// Returns whether elevation was used, so callers can match it on the
/// follow-up permission step.
pub(crate) async fn upload_file(
    remote: &dyn RemoteExec,
    data: &[u8],
    remote_path: &str,
    username: &str,
    log: LogFn<'_>,
) -> Result<bool, RemoteError> {
    match remote.put_file(data, remote_path).await {
        Ok(()) => {
            if verify_upload(remote, data, remote_path).await {
                return Ok(false);
            }
            log(&format!(
                "direct upload of {} failed verification, falling back to privileged write",
                remote_path
            ));
        }
        Err(e) => {
            log(&format!(
                "direct upload of {} failed, falling back to privileged write: {}",
                remote_path, e
            ));
        }
    }

    remote.write_file_elevated(remote_path, data).await?;
    chown_file(remote, username, remote_path, log).await;
    Ok(true)
}

/// Compare the local sha256 against the remote file's.
///
/// Only an explicit mismatch counts as failure; a device without `sha256sum`
/// is accepted unverified.
async fn verify_upload(remote: &dyn RemoteExec, data: &[u8], remote_path: &str) -> bool {
    let local = hex::encode(Sha256::digest(data));
    let command = format!("sha256sum {}", quote(remote_path));
    match remote.run(&command, false, Some(CHOWN_TIMEOUT)).await {
        Ok(out) if out.success() => match out.stdout.split_whitespace().next() {
            Some(remote_sum) => remote_sum.eq_ignore_ascii_case(&local),
            None => true,
        },
        _ => {
            tracing::debug!("sha256 verification unavailable for {}", remote_path);
            true
        }
    }
}

/// Write the install marker recording `installed_at` and `version`.
/// Failures never change the deploy outcome; they are only logged.
pub(crate) async fn write_marker(
    remote: &dyn RemoteExec,
    marker_path: &str,
    version: Option<&str>,
    username: &str,
    log: LogFn<'_>,
) {
    let payload = marker_payload(version, SystemTime::now());
    let written = match remote.put_file(payload.as_bytes(), marker_path).await {
        Ok(()) => true,
        Err(_) => remote
            .write_file_elevated(marker_path, payload.as_bytes())
            .await
            .is_ok(),
    };
    if written {
        chown_file(remote, username, marker_path, log).await;
    } else {
        log(&format!("warn: could not write marker file {}", marker_path));
    }
}

fn marker_payload(version: Option<&str>, now: SystemTime) -> String {
    let installed_at = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!(
        "installed_at={}\nversion={}\n",
        installed_at,
        version.unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_payload_shape() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            marker_payload(Some("1.2.0"), now),
            "installed_at=1700000000\nversion=1.2.0\n"
        );
        assert_eq!(
            marker_payload(None, now),
            "installed_at=1700000000\nversion=\n"
        );
    }
}
