//! roce_initiator: connect to an acceptor, WRITE a payload into its buffer
//! and READ it back.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use roce_session::config::resolve_host;
use roce_session::fabric::verbs::Verbs;
use roce_session::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "roce_initiator", about = "RDMA one-sided WRITE/READ initiator")]
struct Cli {
    /// Acceptor address or host name.
    #[arg(short = 'a', long)]
    address: String,

    /// Acceptor port [default: from the configuration, 4791].
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Literal message to send.
    #[arg(short = 'm', long)]
    message: Option<String>,

    /// Payload size in bytes. With a message, the message is repeated to
    /// fill it.
    #[arg(short = 's', long)]
    size: Option<usize>,

    /// Session configuration file (.toml or .json).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<TransferReport> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;

    let payload = build_payload(cli.message.as_deref(), cli.size)?;
    let dst = resolve_host(&cli.address, config.port)?;
    info!("sending {} bytes to {}", payload.len(), dst);
    run_initiator(&Verbs, dst, payload, config)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(report) if report.verified => {
            info!(
                "done: WRITE {:.3} MB/s, READ {:.3} MB/s",
                report.write_mbps(),
                report.read_mbps()
            );
            ExitCode::SUCCESS
        }
        Ok(_) => {
            error!("functional check failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            let code = err.exit_code();
            error!("{:#}", anyhow::Error::new(err));
            ExitCode::from(code)
        }
    }
}
