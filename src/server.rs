//! MRD streaming server
//!
//! A long-lived acceptor that spawns one daemon worker per connection. The
//! acceptor never blocks on a worker and keeps listening across per-connection
//! failures.

use std::path::PathBuf;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::capture::{CaptureSink, FileCaptureSink};
use crate::connection::{InboundConnection, OutboundConnection};
use crate::dispatch;
use crate::error::{MrdError, Result};
use crate::wire::Envelope;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub savedata: bool,
    pub savedata_folder: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9002,
            savedata: false,
            savedata_folder: PathBuf::from("./saved_data"),
        }
    }
}

fn capture_factory(folder: PathBuf) -> impl FnMut() -> Result<Box<dyn CaptureSink>> + Send + 'static {
    move || {
        let sink = FileCaptureSink::create(&folder)?;
        Ok(Box::new(sink) as Box<dyn CaptureSink>)
    }
}

/// Bind and accept connections until the process is terminated.
pub async fn run(config: ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("mrd-stream server listening on {addr}");

    let mut worker_id: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                worker_id = worker_id.wrapping_add(1);
                let id = worker_id;
                info!("worker {id}: accepted connection from {peer}");
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &config).await {
                        warn!("worker {id}: session ended with error: {e}");
                    } else {
                        debug!("worker {id}: session ended cleanly");
                    }
                });
            }
            Err(e) => {
                error!("accept failed: {e}");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, config: &ServerConfig) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut inbound = if config.savedata {
        InboundConnection::new(read_half).with_capture(capture_factory(config.savedata_folder.clone()))
    } else {
        InboundConnection::new(read_half)
    };
    let mut outbound = OutboundConnection::new(write_half);

    let result = run_session(&mut inbound, &mut outbound, config).await;

    // Finally clause: always attempt shutdown, swallowing secondary faults.
    let _ = outbound.shutdown().await;

    result
}

async fn run_session<R, W>(
    inbound: &mut InboundConnection<R>,
    outbound: &mut OutboundConnection<W>,
    config: &ServerConfig,
) -> Result<()>
where
    R: tokio::io::AsyncReadExt + Unpin,
    W: tokio::io::AsyncWriteExt + Unpin,
{
    let selector = match inbound.next_message().await? {
        None => {
            debug!("session closed before any message arrived");
            return Ok(());
        }
        Some(Envelope::ConfigFile(token)) => token,
        Some(Envelope::ConfigScript(text)) => text,
        Some(other) => {
            return Err(MrdError::Protocol(format!("expected ConfigSelector, got {:?}", other.kind())));
        }
    };

    let metadata_xml = match inbound.next_message().await? {
        Some(Envelope::ParameterScript(xml)) => xml,
        Some(other) => {
            return Err(MrdError::Protocol(format!("expected ParameterScript, got {:?}", other.kind())));
        }
        None => {
            return Err(MrdError::Protocol("session ended before metadata arrived".to_string()));
        }
    };

    dispatch::dispatch(
        &selector,
        inbound,
        outbound,
        &metadata_xml,
        capture_factory(config.savedata_folder.clone()),
    )
    .await
}
