//! mrd-server: streaming MRD reconstruction server
//!
//! Usage:
//!   mrd-server --port 9002 --savedata --savedata-folder ./captures

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use mrd_stream::server::{self, ServerConfig};

/// Streaming MRD (ISMRMRD) reconstruction server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 9002)]
    port: u16,

    /// Enable verbose (debug-level) logging
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Capture received acquisitions/images/waveforms to disk
    #[arg(long)]
    savedata: bool,

    /// Directory for captured session artefacts
    #[arg(long, default_value = "./saved_data")]
    savedata_folder: PathBuf,
}

fn init_logging(verbose: bool, logfile: Option<&PathBuf>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = logfile {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.logfile.as_ref())?;

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        savedata: args.savedata,
        savedata_folder: args.savedata_folder,
    };

    server::run(config).await?;
    Ok(())
}
