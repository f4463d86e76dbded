use std::process::Stdio;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Substring of the banner the transcoder prints to stderr once its
/// input demuxer is up. Free-text scraping is fragile but is the only
/// readiness signal the process offers; it is isolated here so a
/// structured probe could replace it without touching the sessions.
pub const READY_MARKER: &str = "ffmpeg version";

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transcoder stdin: {0}")]
    Stdin(#[from] std::io::Error),
}

/// Lifecycle events, delivered in order: `Ready` at most once, always
/// before `Ended`; `Ended` exactly once per spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeEvent {
    Ready,
    Ended {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Supervises one external transcoding process: feeds the session
/// description on stdin, drains both output pipes, scrapes stderr for
/// the readiness banner and reports exit. Never restarts the process.
pub struct TranscodeProcess {
    pid: Arc<Mutex<Option<u32>>>,
}

impl TranscodeProcess {
    /// Spawns the process and writes `input_sdp` to its stdin, then
    /// closes it. Events arrive on the returned receiver.
    pub async fn spawn(
        cmd: &str,
        args: &[String],
        input_sdp: &str,
    ) -> Result<(Self, mpsc::Receiver<TranscodeEvent>), TranscodeError> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                cmd: cmd.to_string(),
                source,
            })?;

        let pid = child.id();
        log::info!("Transcode: spawned '{}' (pid {:?})", cmd, pid);

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input_sdp.as_bytes()).await?;
            // Dropping stdin closes the pipe; the demuxer needs EOF.
        }

        // Drain stdout so the process can never block on a full pipe.
        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while matches!(stdout.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }

        let mut stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel(8);
        let shared_pid = Arc::new(Mutex::new(pid));
        let task_pid = Arc::clone(&shared_pid);

        // One task owns stderr scanning and exit reaping, so Ready can
        // never be delivered after Ended.
        tokio::spawn(async move {
            let mut matcher = ReadyMatcher::new(READY_MARKER);
            if let Some(stderr) = stderr.as_mut() {
                let mut buf = [0u8; 4096];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if matcher.scan(&buf[..n]) {
                                let _ = tx.send(TranscodeEvent::Ready).await;
                            }
                        }
                    }
                }
                if matcher.finish() {
                    let _ = tx.send(TranscodeEvent::Ready).await;
                }
            }

            let status = child.wait().await;
            task_pid.lock().unwrap().take();
            let (code, signal) = match &status {
                Ok(status) => (status.code(), exit_signal(status)),
                Err(_) => (None, None),
            };
            log::info!(
                "Transcode: process ended (code {:?}, signal {:?})",
                code,
                signal
            );
            let _ = tx.send(TranscodeEvent::Ended { code, signal }).await;
        });

        Ok((Self { pid: shared_pid }, rx))
    }

    /// Sends an interrupt and clears the handle so a repeated call is a
    /// no-op. Exit is observed asynchronously via `Ended`.
    pub fn stop(&self) {
        let Some(pid) = self.pid.lock().unwrap().take() else {
            return;
        };
        log::info!("Transcode: interrupting pid {}", pid);
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }

    #[allow(dead_code)]
    pub fn is_running(&self) -> bool {
        self.pid.lock().unwrap().is_some()
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Line-oriented scanner over raw stderr chunks. Lines may be split
/// across chunks and terminated by either `\r` or `\n` (the transcoder
/// uses `\r` for progress updates); matches fire once.
pub(crate) struct ReadyMatcher {
    needle: &'static str,
    buf: String,
    matched: bool,
}

impl ReadyMatcher {
    pub(crate) fn new(needle: &'static str) -> Self {
        Self {
            needle,
            buf: String::new(),
            matched: false,
        }
    }

    /// Returns true the first time a complete line contains the needle.
    pub(crate) fn scan(&mut self, chunk: &[u8]) -> bool {
        if self.matched {
            return false;
        }
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        while let Some(pos) = self.buf.find(['\r', '\n']) {
            let line: String = self.buf.drain(..=pos).collect();
            if line.contains(self.needle) {
                self.matched = true;
                self.buf.clear();
                return true;
            }
        }
        false
    }

    /// Checks an unterminated trailing line at stream end.
    pub(crate) fn finish(&mut self) -> bool {
        if self.matched {
            return false;
        }
        if self.buf.contains(self.needle) {
            self.matched = true;
            self.buf.clear();
            return true;
        }
        false
    }
}
