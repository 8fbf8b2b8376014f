//! Short-lived tracker CLI calls: no stdin, a deadline, and capped capture.
//!
//! Long-lived agent sessions go through tokio's process API in
//! [`crate::io::provider`].

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{instrument, warn};
use wait_timeout::ChildExt;

/// Deadline and capture cap for one tracker call.
#[derive(Debug, Clone, Copy)]
pub struct CallLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Bytes kept from one stream, plus how many were discarded past the cap.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

/// What a finished (or killed) tracker call left behind.
#[derive(Debug)]
pub struct TrackerOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl TrackerOutput {
    /// Stdout as text, or an error naming `shown` if the call timed out,
    /// exited non-zero or overflowed the cap.
    pub fn into_stdout(self, shown: &str) -> Result<String> {
        if self.timed_out {
            bail!("`{shown}` timed out");
        }
        if !self.status.success() {
            bail!(
                "`{shown}` failed with status {:?}: {}",
                self.status.code(),
                String::from_utf8_lossy(&self.stderr.bytes).trim()
            );
        }
        if self.stdout.dropped > 0 {
            bail!(
                "`{shown}` output exceeded {} bytes",
                self.stdout.bytes.len()
            );
        }
        String::from_utf8(self.stdout.bytes).with_context(|| format!("`{shown}` printed non-UTF-8"))
    }
}

/// Run `argv` to completion or until `limits.timeout`, whichever is first.
///
/// Both pipes are drained on scoped threads while waiting so the child never
/// blocks on a full pipe.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str)))]
pub fn call_tracker(argv: &[String], limits: CallLimits) -> Result<TrackerOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("tracker command is empty"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {program}"))?;
    let out = child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?;
    let err = child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?;

    thread::scope(|scope| {
        let stdout = scope.spawn(|| capture(out, limits.output_limit_bytes));
        let stderr = scope.spawn(|| capture(err, limits.output_limit_bytes));

        let (status, timed_out) = match child.wait_timeout(limits.timeout) {
            Ok(Some(status)) => (status, false),
            waited => {
                match &waited {
                    Ok(_) => warn!(timeout_secs = limits.timeout.as_secs(), "tracker call timed out, killing"),
                    Err(err) => warn!(err = %err, "waiting on tracker failed, killing"),
                }
                child.kill().context("kill tracker")?;
                (child.wait().context("reap tracker")?, waited.is_ok())
            }
        };

        let stdout = stdout
            .join()
            .map_err(|_| anyhow!("stdout reader panicked"))??;
        let stderr = stderr
            .join()
            .map_err(|_| anyhow!("stderr reader panicked"))??;
        if stdout.dropped > 0 || stderr.dropped > 0 {
            warn!(stdout_dropped = stdout.dropped, stderr_dropped = stderr.dropped, "tracker output capped");
        }
        Ok(TrackerOutput {
            status,
            stdout,
            stderr,
            timed_out,
        })
    })
}

fn capture(mut reader: impl Read, cap: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read tracker output")?;
        if n == 0 {
            return Ok(captured);
        }
        let keep = n.min(cap.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.dropped += n - keep;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn limits(timeout: Duration, cap: usize) -> CallLimits {
        CallLimits {
            timeout,
            output_limit_bytes: cap,
        }
    }

    #[test]
    fn stdout_of_successful_call() {
        let output =
            call_tracker(&sh("echo '[]'"), limits(Duration::from_secs(5), 1024)).expect("run");
        assert_eq!(output.into_stdout("bd ready").expect("stdout"), "[]\n");
    }

    #[test]
    fn tracker_gets_no_stdin() {
        // `cat` sees EOF at once instead of hanging on an inherited terminal.
        let output =
            call_tracker(&sh("cat; echo after"), limits(Duration::from_secs(5), 1024)).expect("run");
        assert!(!output.timed_out);
        assert_eq!(output.into_stdout("cat").expect("stdout"), "after\n");
    }

    #[test]
    fn failure_reports_status_and_stderr() {
        let output = call_tracker(
            &sh("echo 'no such issue' >&2; exit 4"),
            limits(Duration::from_secs(5), 1024),
        )
        .expect("run");
        let err = output.into_stdout("bd show x").expect_err("failed");
        let message = err.to_string();
        assert!(message.contains("Some(4)"), "{message}");
        assert!(message.contains("no such issue"), "{message}");
    }

    #[test]
    fn output_past_the_cap_is_counted_and_rejected() {
        let output =
            call_tracker(&sh("printf 'abcdefghij'"), limits(Duration::from_secs(5), 4)).expect("run");
        assert_eq!(output.stdout.bytes, b"abcd");
        assert_eq!(output.stdout.dropped, 6);
        assert!(output.into_stdout("bd list").is_err());
    }

    #[test]
    fn slow_call_is_killed() {
        let output =
            call_tracker(&sh("sleep 5"), limits(Duration::from_millis(100), 1024)).expect("run");
        assert!(output.timed_out);
        assert!(output.into_stdout("bd ready").expect_err("timeout").to_string().contains("timed out"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(call_tracker(&[], limits(Duration::from_secs(1), 16)).is_err());
    }
}
