//! Local command backend.
//!
//! The command is split with shell-words, the prompt is written to stdin and
//! the completion is read from stdout. A non-zero exit or a missing binary is
//! reported as UNREACHABLE; exceeding the wall-clock limit kills the child and
//! reports TIMEOUT. Output readers are only waited on until the deadline, so
//! a grandchild that keeps the pipes open cannot stretch the call.

use super::{CompletionOptions, TextGenerator};
use crate::error::ProviderError;
use crate::util::truncate_string;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Extra time readers get to flush once the child has exited or been killed.
const READER_GRACE: Duration = Duration::from_millis(250);
const MAX_STDERR_IN_ERROR: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl TextGenerator for CommandGenerator {
    fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ProviderError> {
        let args = shell_words::split(&self.command).map_err(|err| {
            ProviderError::unreachable(format!("parse LM command {:?}: {err}", self.command))
        })?;
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| ProviderError::unreachable("LM command is empty"))?;
        let resolved = which::which(program).map_err(|err| {
            ProviderError::unreachable(format!("LM command {program} not found: {err}"))
        })?;

        let full_prompt = match &options.system {
            Some(system) => format!("{system}\n\n{prompt}"),
            None => prompt.to_string(),
        };

        let start = Instant::now();
        let mut child = Command::new(&resolved)
            .args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ProviderError::unreachable(format!("spawn LM command {program}: {err}")))?;

        // Pipes are drained on their own threads so a chatty child cannot block
        // on a full buffer while we wait for it. The writer is never joined.
        let stdin = child.stdin.take();
        let input = full_prompt.clone().into_bytes();
        thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&input);
            }
        });
        let stdout_rx = drain(child.stdout.take());
        let stderr_rx = drain(child.stderr.take());

        let deadline = start + self.timeout;
        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(err) => {
                    return Err(ProviderError::unreachable(format!(
                        "wait for LM command: {err}"
                    )))
                }
            }
            if Instant::now() >= deadline {
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let collect_by = deadline.max(Instant::now()) + READER_GRACE;
        let stdout = collect(&stdout_rx, collect_by);
        let stderr = collect(&stderr_rx, collect_by).unwrap_or_default();
        // A reader still blocked past the deadline means a descendant holds
        // stdout open; the call is over either way.
        let stdout = match stdout {
            Some(stdout) => stdout,
            None => {
                timed_out = true;
                Vec::new()
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            elapsed_ms,
            prompt_bytes = full_prompt.len(),
            response_bytes = stdout.len(),
            timed_out,
            "lm invoke complete"
        );

        if timed_out {
            return Err(ProviderError::timeout(format!(
                "LM command exceeded {}s",
                self.timeout.as_secs()
            )));
        }
        if let Some(status) = status.filter(|s| !s.success()) {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(ProviderError::unreachable(format!(
                "LM command failed with status {status}: {}",
                truncate_string(stderr.trim(), MAX_STDERR_IN_ERROR)
            )));
        }

        String::from_utf8(stdout)
            .map_err(|err| ProviderError::unreachable(format!("decode LM stdout as UTF-8: {err}")))
    }

    fn name(&self) -> String {
        format!("command:{}", self.command)
    }
}

/// Read `source` to the end on a background thread.
fn drain<R: Read + Send + 'static>(source: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut source) = source {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = source.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

/// Wait for a reader until `by`. `None` when it is still blocked; a missing
/// pipe yields an empty buffer.
fn collect(rx: &Receiver<Vec<u8>>, by: Instant) -> Option<Vec<u8>> {
    match rx.recv_timeout(by.saturating_duration_since(Instant::now())) {
        Ok(buf) => Some(buf),
        Err(mpsc::RecvTimeoutError::Disconnected) => Some(Vec::new()),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
    }
}
