use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL: Duration = Duration::from_millis(50);

/// How long to wait for a pipe to close once the child is gone. A surviving
/// grandchild can hold it open forever.
const READER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// The caller gave up on the command and it was killed.
    pub abandoned: bool,
    pub elapsed: Duration,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.abandoned && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Run `command` to completion, killing it when `timeout` elapses or when
/// `abandon` is raised by another thread.
///
/// On unix the command runs as the leader of its own process group, and a
/// kill takes down everything it started.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
    abandon: &AtomicBool,
) -> Result<CommandRunResult, String> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    // Drain both pipes off-thread so a chatty child can't block on a full pipe.
    let stdout_reader = PipeReader::spawn(stdout);
    let stderr_reader = PipeReader::spawn(stderr);

    let start = Instant::now();
    let mut timed_out = false;
    let mut abandoned = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if abandon.load(Ordering::Relaxed) {
                    abandoned = true;
                } else if start.elapsed() >= timeout {
                    timed_out = true;
                }
                if timed_out || abandoned {
                    kill_tree(&mut child);
                    break child.wait().ok();
                }
                thread::sleep(WAIT_POLL);
            }
            Err(e) => {
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };

    let stdout_bytes = stdout_reader.finish(READER_GRACE);
    let stderr_bytes = stderr_reader.finish(READER_GRACE);

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        abandoned,
        elapsed: start.elapsed(),
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    // The child leads its own group, so the group id is its pid.
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Background reader for one pipe. Bytes land in a shared buffer as they
/// arrive, so a pipe that never closes still yields what was written.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl PipeReader {
    fn spawn(mut source: impl Read + Send + 'static) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&buf);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => lock_buf(&sink).extend_from_slice(&chunk[..n]),
                }
            }
            let _ = tx.send(());
        });
        Self { buf, done }
    }

    /// Wait up to `grace` for end of stream, then take whatever was read.
    fn finish(self, grace: Duration) -> Vec<u8> {
        let _ = self.done.recv_timeout(grace);
        std::mem::take(&mut *lock_buf(&self.buf))
    }
}

fn lock_buf(buf: &Mutex<Vec<u8>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn run_sh(script: &str, timeout: Duration, abandon: bool) -> CommandRunResult {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        run_command_with_timeout(&mut cmd, timeout, &AtomicBool::new(abandon)).unwrap()
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[cfg(unix)]
    #[test]
    fn test_captures_output_and_exit_code() {
        let result = run_sh("echo out; echo err >&2; exit 3", Duration::from_secs(10), false);

        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.status.and_then(|s| s.code()), Some(3));
        assert!(!result.success());
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn test_kills_command_on_timeout() {
        let result = run_sh("exec sleep 30", Duration::from_millis(200), false);

        assert!(result.timed_out);
        assert!(!result.success());
        assert!(result.elapsed < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_grandchildren_holding_the_pipes() {
        // The shell forks `sleep`, which inherits stdout and stderr.
        let result = run_sh("sleep 6; echo done", Duration::from_millis(200), false);

        assert!(result.timed_out);
        assert!(!result.stdout.contains("done"));
        assert!(result.elapsed < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_kills_command_when_abandoned() {
        let result = run_sh("sleep 6; echo done", Duration::from_secs(60), true);

        assert!(result.abandoned);
        assert!(!result.timed_out);
        assert!(result.elapsed < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_background_child_does_not_hold_up_a_finished_command() {
        let result = run_sh("sleep 6 & echo started", Duration::from_secs(10), false);

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "started");
        assert!(result.elapsed < Duration::from_secs(3));
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let mut cmd = Command::new("bootfix-definitely-not-a-real-binary");
        let err =
            run_command_with_timeout(&mut cmd, Duration::from_secs(1), &AtomicBool::new(false))
                .unwrap_err();
        assert!(err.contains("Failed to start command"));
    }
}
