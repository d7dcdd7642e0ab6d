//! roce_acceptor: accept one initiator and expose a buffer to it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use roce_session::config::resolve_host;
use roce_session::fabric::verbs::Verbs;
use roce_session::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "roce_acceptor", about = "RDMA one-sided WRITE/READ acceptor")]
struct Cli {
    /// Address to bind.
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    address: String,

    /// Port to listen on [default: from the configuration, 4791].
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Bytes exposed to the initiator [default: from the configuration, 4 MiB].
    #[arg(short = 'b', long)]
    buffer_len: Option<usize>,

    /// Session configuration file (.toml or .json).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<AcceptReport> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(len) = cli.buffer_len {
        config.buffer_len = len;
    }
    config.validate()?;

    let bind = resolve_host(&cli.address, config.port)?;
    run_acceptor(&Verbs, bind, config)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(report) => {
            match report.peer_addr {
                Some(peer) => info!("session with {} done, peer exposed {:?}", peer, report.peer),
                None => info!("session done, peer exposed {:?}", report.peer),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            let code = err.exit_code();
            error!("{:#}", anyhow::Error::new(err));
            ExitCode::from(code)
        }
    }
}
