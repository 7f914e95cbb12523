//! The three CLI modes and the daemon bootstrapping that backs them.
//!
//! `single` and `client` share the same flow — locate or start a
//! multiplexer, then attach as producer and run the child — and differ only
//! in the [`Bootstrapper`] used. `server` runs the bus in the foreground.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::{self, ServerInfo};
use crate::server::WsServer;
use crate::term::{TermError, TermRunner};
use crate::transport;

const CONFIG_POLL_DEADLINE: Duration = Duration::from_secs(5);
const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEALTH_POLL_DEADLINE: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Locates or starts a multiplexer to attach to.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn get_or_create(&self) -> anyhow::Result<ServerInfo>;
}

/// Runs the multiplexer inside this process; used by single mode.
pub struct InProcessBootstrapper {
    pub token: Option<String>,
    pub port: u16,
}

#[async_trait]
impl Bootstrapper for InProcessBootstrapper {
    async fn get_or_create(&self) -> anyhow::Result<ServerInfo> {
        let server = WsServer::bind(self.token.clone(), self.port).await?;
        let info = ServerInfo {
            pid: std::process::id() as i32,
            port: server.port,
            token: server.token.clone(),
            created: unix_now(),
        };
        tokio::spawn(async move {
            if let Err(err) = server.serve().await {
                error!(%err, "in-process multiplexer failed");
            }
        });
        Ok(info)
    }
}

/// Reuses a live daemon recorded in the config file, or spawns a detached
/// one and waits for it to come up.
pub struct ExternalProcessBootstrapper {
    pub config_path: PathBuf,
    pub token: Option<String>,
    pub port: u16,
    pub debug: bool,
    /// Overrides the spawned executable; tests point this at a prebuilt
    /// binary because `current_exe` resolves to the test harness there.
    pub command_override: Option<Vec<String>>,
}

#[async_trait]
impl Bootstrapper for ExternalProcessBootstrapper {
    async fn get_or_create(&self) -> anyhow::Result<ServerInfo> {
        match config::verify_connection(&self.config_path) {
            Ok(info) => Ok(info),
            Err(err) => {
                debug!(%err, "no live multiplexer daemon, spawning one");
                self.spawn_server().await
            }
        }
    }
}

impl ExternalProcessBootstrapper {
    async fn spawn_server(&self) -> anyhow::Result<ServerInfo> {
        use std::os::unix::process::CommandExt;

        let mut cmd = match &self.command_override {
            Some(parts) => {
                let (program, rest) = parts.split_first().context("empty command override")?;
                let mut cmd = std::process::Command::new(program);
                cmd.args(rest);
                cmd
            }
            None => std::process::Command::new(
                std::env::current_exe().context("resolving current executable")?,
            ),
        };
        cmd.arg("--mode=server")
            .arg(format!("--config={}", self.config_path.display()));
        if self.debug {
            cmd.arg("--debug");
        }
        if let Some(token) = &self.token {
            cmd.arg(format!("--token={token}"));
        }
        if self.port != 0 {
            cmd.arg(format!("--port={}", self.port));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group so the daemon survives this process and its
        // terminal.
        cmd.process_group(0);

        let child = cmd.spawn().context("spawning multiplexer daemon")?;
        info!(pid = child.id(), "spawned multiplexer daemon");

        let info = self.poll_server_configuration().await?;
        self.poll_server_readiness(info.port).await?;
        info!(port = info.port, server_pid = info.pid, "multiplexer daemon ready");
        Ok(info)
    }

    async fn poll_server_configuration(&self) -> anyhow::Result<ServerInfo> {
        let deadline = tokio::time::Instant::now() + CONFIG_POLL_DEADLINE;
        loop {
            match config::verify_connection(&self.config_path) {
                Ok(info) => return Ok(info),
                Err(err) if tokio::time::Instant::now() >= deadline => {
                    return Err(anyhow::anyhow!(
                        "timed out waiting for daemon to start: {err}"
                    ));
                }
                Err(_) => tokio::time::sleep(CONFIG_POLL_INTERVAL).await,
            }
        }
    }

    async fn poll_server_readiness(&self, port: u16) -> anyhow::Result<()> {
        let url = format!("http://localhost:{port}/health");
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("building health probe client")?;
        let deadline = tokio::time::Instant::now() + HEALTH_POLL_DEADLINE;
        loop {
            match client.get(&url).send().await {
                Ok(res) if res.status().is_success() => return Ok(()),
                _ if tokio::time::Instant::now() >= deadline => {
                    anyhow::bail!("daemon not ready within {HEALTH_POLL_DEADLINE:?}");
                }
                Ok(res) => {
                    debug!(status = %res.status(), "waiting for daemon readiness");
                    tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                }
                Err(err) => {
                    debug!(%err, "waiting for daemon readiness");
                    tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// Attach as producer and run the child until it exits, the session is
/// abandoned, or the transport fails.
pub struct ClientMode {
    pub rows: u16,
    pub cols: u16,
    pub command: Vec<String>,
    pub inactivity_deadline: Duration,
    pub bootstrapper: Box<dyn Bootstrapper>,
}

impl ClientMode {
    pub async fn run(self) -> anyhow::Result<()> {
        let info = self
            .bootstrapper
            .get_or_create()
            .await
            .context("cannot create server")?;
        let process_id = std::process::id();

        // One JSON line on stdout so an outer launcher can pick up the
        // connection details.
        let payload = serde_json::json!({
            "port": info.port,
            "token": info.token,
            "processId": process_id,
            "serverProcessId": info.pid,
        });
        println!("{payload}");

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let runner = TermRunner::new(self.rows, self.cols, &self.command)?.with_on_ready(
            move || {
                let _ = ready_tx.send(true);
            },
        );

        let url = format!(
            "ws://localhost:{}/ws/process?token={}&processId={}",
            info.port, info.token, process_id
        );
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("connecting upstream ({url})"))?;
        let (sink, source) = transport::split_client(socket);

        let mut session = tokio::spawn(runner.run(sink, source));
        tokio::select! {
            // No controller became ready in time; abandon the session. The
            // aborted task drops the PTY, which delivers SIGHUP to the child.
            _ = tokio::time::sleep(self.inactivity_deadline) => {
                session.abort();
                Err(TermError::InactivityTimeout(self.inactivity_deadline).into())
            }
            res = &mut session => {
                res.context("terminal runner failed")??;
                Ok(())
            }
            _ = async {
                loop {
                    if *ready_rx.borrow() {
                        break;
                    }
                    if ready_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                session.await.context("terminal runner failed")??;
                Ok(())
            }
        }
    }
}

/// Run the bus as a daemon until killed.
pub struct ServerMode {
    pub token: Option<String>,
    pub port: u16,
    pub config_path: PathBuf,
}

impl ServerMode {
    pub async fn run(self) -> anyhow::Result<()> {
        let server = WsServer::bind(self.token, self.port).await?;
        println!("port={} token={}", server.port, server.token);
        config::write_server_config(
            &ServerInfo {
                pid: std::process::id() as i32,
                port: server.port,
                token: server.token.clone(),
                created: unix_now(),
            },
            &self.config_path,
        )?;
        info!(port = server.port, "multiplexer serving");
        server.serve_until_signalled().await.context("server error")
    }
}
