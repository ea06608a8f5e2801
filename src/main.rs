use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{error, info};

use tftpclient::client::{self, Direction, Event, SessionParams};
use tftpclient::{TransferMode, DEFAULT_PORT};

/// Get a file from a TFTP server or put a file to a TFTP server.
#[derive(Debug, Parser)]
#[command(name = "tftpclient", version)]
struct Cli {
    /// Hostname or IPv4 address of the TFTP server
    host: String,

    /// File name on the server
    remote_file: String,

    /// Local file to write (get) or read (put); defaults to REMOTE_FILE
    local_file: Option<PathBuf>,

    /// Server port
    #[arg(short = 'P', long, default_value_t = DEFAULT_PORT,
          value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Put file to remote TFTP server
    #[arg(short = 'p', long, conflicts_with = "get")]
    put: bool,

    /// Get file from remote TFTP server (default)
    #[arg(short = 'g', long)]
    get: bool,

    /// Transfer mode
    #[arg(short, long, value_enum, default_value_t = Mode::Ascii)]
    mode: Mode,

    /// Print additional information during transfer
    #[arg(short, long)]
    verbose: bool,

    /// Print lots of debug data
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    #[value(alias = "netascii")]
    Ascii,
    Octet,
}

impl From<Mode> for TransferMode {
    fn from(mode: Mode) -> Self {
        match mode {
            | Mode::Ascii => TransferMode::NetAscii,
            | Mode::Octet => TransferMode::Octet,
        }
    }
}

impl Cli {
    fn params(&self) -> SessionParams {
        let direction = if self.put { Direction::Put } else { Direction::Get };
        let mut params = SessionParams::new(&self.host, &self.remote_file, direction)
            .with_port(self.port)
            .with_mode(self.mode.into());
        if let Some(local_file) = &self.local_file {
            params = params.with_local_path(local_file.clone());
        }
        params
    }

    fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        }
    }
}

fn render(event: &Event) {
    match event {
        | Event::RequestSent { opcode, mode } => info!("Sent {opcode} ({mode})"),
        | Event::TransactionId { peer } => info!("Server answered from {peer}"),
        | Event::DataReceived { block, len } => {
            info!("Received DATA block #{block} ({len} bytes)")
        }
        | Event::DataSent { block, len } => info!("Sent DATA block #{block} ({len} bytes)"),
        | Event::AckSent { block } => info!("Sent ACK block #{block}"),
        | Event::AckReceived { block } => info!("Received ACK block #{block}"),
        | Event::ErrorReceived { code, message } => {
            error!("Transfer error: {code}: {message}")
        }
        | _ => {}
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .init();

    let params = cli.params();
    info!(
        "{:?} file {} TFTP server {}:{}/{} {} {}",
        params.direction,
        if params.direction == Direction::Get { "from" } else { "to" },
        params.host,
        params.port,
        params.remote_file,
        if params.direction == Direction::Get { "to" } else { "from" },
        params.local_path.display(),
    );

    let outcome = client::run_session_with(&params, render)
        .with_context(|| format!("{:?} {} failed", params.direction, params.remote_file))?;

    info!(
        "Transfer complete: {} bytes, last block #{}",
        outcome.bytes, outcome.last_block
    );
    Ok(())
}
