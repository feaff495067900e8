//! Child processes that speak newline-delimited JSON on stdin/stdout.
//!
//! Shared by [`ProcessChannelFactory`](crate::channel::process::ProcessChannelFactory)
//! and [`ProcessEngineProvider`](crate::engine::process::ProcessEngineProvider).
//!
//! Writes go through a queue drained by a per-child writer task, so sending
//! never blocks on a child that stopped reading its stdin.

use std::process::Stdio;
use std::sync::{Mutex as StdMutex, PoisonError};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::PortEvent;
use crate::consts::STDIN_DRAIN_TIMEOUT;
use crate::error::BrokerError;

/// A running child process. Lines it prints arrive on the receiver returned by
/// [`JsonLinesChild::spawn`]; the receiver ends when its stdout closes.
pub struct JsonLinesChild {
    program: String,
    input: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Child>,
}

impl JsonLinesChild {
    /// Spawn `command[0]` with the remaining elements as arguments.
    pub fn spawn(
        command: &[String],
        envs: &[(&str, &str)],
    ) -> Result<(Self, mpsc::UnboundedReceiver<PortEvent>), BrokerError> {
        let (program, args) = command
            .split_first()
            .ok_or(BrokerError::MissingArgument("command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BrokerError::Acquisition(format!("failed to spawn {program}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Acquisition(format!("{program} has no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Acquisition(format!("{program} has no stdout")))?;

        let (input, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(program.clone(), stdin, queued));

        let (tx, rx) = mpsc::unbounded_channel();
        let name = program.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(PortEvent::Message(line.to_string())).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(program = %name, "child closed stdout");
                        break;
                    }
                    Err(e) => {
                        // Unreadable output (e.g. invalid UTF-8) is reported, then the stream ends.
                        let _ = tx.send(PortEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                program: program.clone(),
                input: StdMutex::new(Some(input)),
                writer: Mutex::new(Some(writer)),
                child: Mutex::new(child),
            },
            rx,
        ))
    }

    /// Queue one message as a single JSON line. Fails once the child is shut
    /// down or its stdin broke.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), BrokerError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| BrokerError::Channel(format!("failed to encode message: {e}")))?;
        line.push('\n');

        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = input
            .as_ref()
            .ok_or_else(|| BrokerError::Channel(format!("{} stdin is closed", self.program)))?;
        queue
            .send(line)
            .map_err(|_| BrokerError::Channel(format!("{} stopped accepting input", self.program)))
    }

    /// Stop accepting input, give the writer a moment to flush what is queued,
    /// then kill the process if it is still running.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer
            && tokio::time::timeout(STDIN_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
        {
            debug!(program = %self.program, "child is not reading stdin, dropping queued input");
            writer.abort();
        }

        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(program = %self.program, %status, "child already exited");
                Ok(())
            }
            Ok(None) => {
                child
                    .kill()
                    .await
                    .map_err(|e| BrokerError::Channel(format!("failed to kill {}: {e}", self.program)))
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "could not poll child status");
                Err(BrokerError::Channel(e.to_string()))
            }
        }
    }
}

/// Drain queued lines into the child's stdin. Stdin closes when the queue
/// closes or a write fails.
async fn write_lines(
    program: String,
    mut stdin: ChildStdin,
    mut queued: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = queued.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(program = %program, error = %e, "write to child failed");
            break;
        }
    }
}
