//! Subprocess post-mortem helpers.
//!
//! When a stdio server stops answering, the manager needs to tell a crash
//! apart from a hang. These helpers poll the child without reaping it from
//! under other observers, pull the exit code, and salvage whatever stderr
//! the process left behind so the failure report can say more than
//! "timed out".

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr};
use tokio::sync::Mutex;

/// Upper bound on captured stderr bytes.
const STDERR_CAPTURE_BYTES: usize = 4096;
/// How long to wait for the stderr pipe to yield anything.
const STDERR_CAPTURE_WAIT: Duration = Duration::from_millis(500);
/// Character budget for stderr excerpts embedded in error messages.
const STDERR_REPORT_CHARS: usize = 2000;

/// Whether the child process is still running.
pub(crate) async fn is_alive(child: &Arc<Mutex<Child>>) -> bool {
    matches!(child.lock().await.try_wait(), Ok(None))
}

/// Exit code of a terminated child. `None` while the process is still
/// running or when it was killed by a signal.
pub(crate) async fn exit_code(child: &Arc<Mutex<Child>>) -> Option<i32> {
    match child.lock().await.try_wait() {
        Ok(Some(status)) => status.code(),
        _ => None,
    }
}

/// Drains up to 4 KiB from the child's stderr pipe, waiting at most half a
/// second. Consumes the handle; subsequent calls return `None`.
pub(crate) async fn capture_stderr(stderr: &Arc<Mutex<Option<ChildStderr>>>) -> Option<String> {
    let mut pipe = stderr.lock().await.take()?;
    let deadline = tokio::time::Instant::now() + STDERR_CAPTURE_WAIT;
    let mut collected: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        if collected.len() >= STDERR_CAPTURE_BYTES {
            break;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, pipe.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) | Err(_) => break,
        }
    }

    let text = String::from_utf8_lossy(&collected);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(truncate_excerpt(text, STDERR_REPORT_CHARS))
    }
}

/// One-line description of a dead process for error messages.
pub(crate) fn crash_summary(exit_code: Option<i32>, stderr: Option<&str>) -> String {
    let mut msg = match exit_code {
        Some(code) => format!("process exited with code {code}"),
        None => "process terminated by signal".to_string(),
    };
    if let Some(err) = stderr {
        msg.push_str(": ");
        msg.push_str(err);
    }
    msg
}

fn truncate_excerpt(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len).collect();
        format!("{truncated}... (truncated at {max_len} chars)")
    }
}
