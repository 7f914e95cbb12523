use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use ptymux::modes::{
    Bootstrapper, ClientMode, ExternalProcessBootstrapper, InProcessBootstrapper, ServerMode,
};

#[derive(Debug, Parser)]
#[command(
    name = "ptymux",
    version,
    about = "Tunnel an interactive PTY session over WebSocket",
    long_about = "Tunnel an interactive PTY session over WebSocket.\n\n\
        A producer process runs a child under a PTY and streams it through a\n\
        multiplexer daemon; any number of controllers attach to the same\n\
        session to observe and drive the terminal concurrently."
)]
struct Cli {
    /// Mode to run
    #[arg(long, value_enum, default_value = "single")]
    mode: Mode,

    /// Authentication token (generated when omitted)
    #[arg(long)]
    token: Option<String>,

    /// Server port (0 picks a free port in 8000-9000)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Number of columns for the PTY
    #[arg(long, default_value_t = 80)]
    cols: u16,

    /// Number of rows for the PTY
    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Path to the server config file
    #[arg(long, default_value = "/tmp/vercel/interactive/config.json")]
    config: PathBuf,

    /// Abandon the session when no controller becomes ready within this
    /// window (e.g. 30s, 1m)
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    inactivity_deadline: Duration,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Child command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// In-process bus plus one producer session
    Single,
    /// Run the multiplexer daemon
    Server,
    /// Attach to (or spawn) a daemon and run the child
    Client,
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {raw:?}"))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" | "" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("invalid duration unit: {unit:?}")),
    };
    Ok(Duration::from_secs_f64(seconds))
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match cli.mode {
        Mode::Single => {
            ClientMode {
                rows: cli.rows,
                cols: cli.cols,
                command: cli.command,
                inactivity_deadline: cli.inactivity_deadline,
                bootstrapper: Box::new(InProcessBootstrapper {
                    token: cli.token,
                    port: cli.port,
                }) as Box<dyn Bootstrapper>,
            }
            .run()
            .await
        }
        Mode::Client => {
            ClientMode {
                rows: cli.rows,
                cols: cli.cols,
                command: cli.command,
                inactivity_deadline: cli.inactivity_deadline,
                bootstrapper: Box::new(ExternalProcessBootstrapper {
                    config_path: cli.config,
                    token: cli.token,
                    port: cli.port,
                    debug: cli.debug,
                    command_override: None,
                }),
            }
            .run()
            .await
        }
        Mode::Server => {
            ServerMode {
                token: cli.token,
                port: cli.port,
                config_path: cli.config,
            }
            .run()
            .await
        }
    };

    if let Err(err) = result {
        tracing::error!(error = format!("{err:#}"), "exiting");
        std::process::exit(1);
    }
}
