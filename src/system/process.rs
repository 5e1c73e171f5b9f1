//! Spawning and terminating external tools.

use std::io;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Build a command for `program`, optionally wrapped in `sudo -n`.
///
/// The child runs with a null stdin and is killed if its handle is dropped.
pub fn tool_command(program: &str, use_sudo: bool) -> Command {
    let mut cmd = if use_sudo {
        let mut c = Command::new("sudo");
        c.arg("-n").arg(program);
        c
    } else {
        Command::new(program)
    };
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd
}

/// Run `cmd` to completion, capturing output, bounded by `timeout`.
///
/// A timeout surfaces as `io::ErrorKind::TimedOut`; the child is killed when
/// the pending future is dropped.
pub async fn output_with_timeout(mut cmd: Command, timeout: Duration) -> io::Result<Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("command did not finish within {}s", timeout.as_secs()),
        )),
    }
}

/// Terminate a child that was spawned as its own process group leader.
///
/// Sends SIGTERM to the whole group, waits up to `grace`, then SIGKILLs the
/// group. Returns the exit status when it could be collected.
pub async fn terminate_group(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.try_wait().ok().flatten();
    };

    signal_group(pid, libc::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, exit_code = status.code(), "child exited after SIGTERM");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "error waiting for child after SIGTERM");
            None
        }
        Err(_) => {
            warn!(pid, "child did not exit after SIGTERM, sending SIGKILL");
            signal_group(pid, libc::SIGKILL);
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to SIGKILL child");
            }
            child.wait().await.ok()
        }
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals the process group we
    // created for this child; no memory is touched.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(
            pid,
            signal,
            error = %io::Error::last_os_error(),
            "process group signal not delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_output_with_timeout_captures_stdout() {
        let mut cmd = tool_command("sh", false);
        cmd.arg("-c").arg("echo hello; echo oops >&2; exit 3");
        let out = output_with_timeout(cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
        assert_eq!(String::from_utf8_lossy(&out.stderr).trim(), "oops");
        assert_eq!(out.status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_output_with_timeout_expires() {
        let mut cmd = tool_command("sleep", false);
        cmd.arg("5");
        let err = output_with_timeout(cmd, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_terminate_group_stops_shell_and_children() {
        let mut cmd = tool_command("sh", false);
        cmd.arg("-c").arg("sleep 30; sleep 30").process_group(0);
        let mut child = cmd.spawn().unwrap();

        let started = Instant::now();
        let status = terminate_group(&mut child, Duration::from_secs(2)).await;
        assert!(status.is_some());
        assert!(!status.unwrap().success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
