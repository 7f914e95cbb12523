//! Terminal runner: owns the PTY, pumps bytes between the child and the
//! transport, and coordinates the READY handshake.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::buffering::DeferredWriter;
use crate::protocol::{Frame, FrameKind, ProtocolError};
use crate::transport::{FrameSource, OutputSink};

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_OUTPUT_CHANNEL: usize = 256;
/// How long to keep the transport open after the final flush so the bus can
/// forward the tail to subscribers before the connection drops.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TermError {
    #[error("no command specified")]
    NoCommand,
    #[error("spawning pty: {0}")]
    Spawn(String),
    #[error("setting pty size to {cols}x{rows}: {message}")]
    Resize {
        cols: u16,
        rows: u16,
        message: String,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("inactivity timeout: no controller became ready within {0:?}")]
    InactivityTimeout(Duration),
}

/// Applies decoded frames to the PTY and latches the first READY.
pub struct MessageHandler {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    ready: watch::Sender<bool>,
}

impl MessageHandler {
    fn new(master: Box<dyn MasterPty + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            ready: watch::channel(false).0,
        }
    }

    /// Resolves once a READY frame has been handled; immediately if one
    /// already was.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn handle_bytes(&self, payload: &[u8]) -> Result<(), TermError> {
        self.handle(Frame::decode(payload)?)
    }

    pub fn handle(&self, frame: Frame) -> Result<(), TermError> {
        match frame.kind() {
            FrameKind::Ready => {
                // Latched at most once; repeats are no-ops.
                self.ready.send_replace(true);
                Ok(())
            }
            FrameKind::Resize => {
                let (cols, rows) = frame.as_resize()?;
                self.master
                    .lock()
                    .resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    })
                    .map_err(|err| TermError::Resize {
                        cols,
                        rows,
                        message: err.to_string(),
                    })
            }
            FrameKind::Data => {
                let data = frame.as_data()?;
                self.writer.lock().write_all(data)?;
                Ok(())
            }
        }
    }
}

pub struct TermRunner {
    rows: u16,
    cols: u16,
    command: String,
    args: Vec<String>,
    on_ready: Option<Box<dyn Fn() + Send + Sync>>,
}

impl TermRunner {
    pub fn new(rows: u16, cols: u16, command_and_args: &[String]) -> Result<Self, TermError> {
        let (command, args) = command_and_args.split_first().ok_or(TermError::NoCommand)?;
        Ok(Self {
            rows,
            cols,
            command: command.clone(),
            args: args.to_vec(),
            on_ready: None,
        })
    }

    /// Hook invoked when the first READY arrives, before the buffered
    /// backlog is flushed.
    pub fn with_on_ready(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Spawns the child under a fresh PTY and pumps it against the transport
    /// until the PTY reaches end-of-file.
    ///
    /// Returns only after a READY was seen: for a child that exits before
    /// any controller attaches, the accumulated output is held until a late
    /// subscriber signals READY and then flushed in full.
    pub async fn run<S, R>(mut self, sink: S, mut source: R) -> Result<(), TermError>
    where
        S: OutputSink + 'static,
        R: FrameSource + 'static,
    {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| TermError::Spawn(err.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.command);
        cmd.args(&self.args);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| TermError::Spawn(err.to_string()))?;
        // Close our copy of the slave end so the master reads EOF once the
        // child exits.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| TermError::Spawn(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| TermError::Spawn(err.to_string()))?;

        let handler = Arc::new(MessageHandler::new(pair.master, writer));
        let target = Arc::new(DeferredWriter::new(sink));

        let ready_waiter = {
            let handler = handler.clone();
            let target = target.clone();
            let on_ready = self.on_ready.take();
            tokio::spawn(async move {
                handler.wait_ready().await;
                if let Some(hook) = &on_ready {
                    hook();
                }
                match target.mark_ready().await {
                    Ok(flushed) => debug!(bytes = flushed, "flushed buffered output"),
                    Err(err) => error!(%err, "flushing buffered output failed"),
                }
            })
        };

        let reader_pump = {
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    match source.next().await {
                        Ok(Some(payload)) => {
                            if let Err(err) = handler.handle_bytes(&payload) {
                                error!(%err, "handling frame failed");
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!(%err, "reading frame failed");
                            break;
                        }
                    }
                }
            })
        };

        // Writer pump: blocking PTY reads on a dedicated thread, forwarded
        // through the deferred writer on this task.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(PTY_OUTPUT_CHANNEL);
        let read_thread = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        while let Some(chunk) = chunk_rx.recv().await {
            if let Err(err) = target.write(&chunk).await {
                error!(%err, "forwarding output failed");
                break;
            }
        }
        debug!("pty closed");

        // A non-interactive child can exit before any controller attached;
        // hold the backlog until a READY finally arrives, then flush it.
        handler.wait_ready().await;
        match target.mark_ready().await {
            Ok(0) => {}
            Ok(flushed) => debug!(bytes = flushed, "flushed final buffer"),
            Err(err) => error!(%err, "flushing final buffer failed"),
        }

        if let Some(elapsed) = target.ready_elapsed() {
            if elapsed < DRAIN_GRACE {
                tokio::time::sleep(DRAIN_GRACE - elapsed).await;
            }
        }

        let _ = child.try_wait();
        ready_waiter.abort();
        reader_pump.abort();
        let _ = read_thread.await;
        Ok(())
    }
}
