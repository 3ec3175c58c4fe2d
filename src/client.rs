//! MRD streaming client driver
//!
//! Connects to a server, sends a ConfigSelector, the metadata XML header,
//! a dataset's records, then Close; concurrently a separate inbound worker
//! receives reconstructed images and writes them into an output store.
//!
//! The real on-disk MRD dataset reader is out of scope here (see the
//! module docs on [`DatasetSource`]/[`DatasetSink`]): this module defines
//! the collaborator traits the driver depends on, plus an in-memory double
//! used by the tests.

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::connection::{InboundConnection, OutboundConnection};
use crate::error::{MrdError, Result};
use crate::wire::{Acquisition, Envelope, Image};

/// One record read off the input dataset, in send order.
#[derive(Debug, Clone)]
pub enum DatasetRecord {
    Acquisition(Acquisition),
    Image(Image),
}

/// External collaborator: the input dataset the client reads from. A real
/// implementation reads an on-disk MRD file; this crate only defines the
/// seam and a couple of test doubles.
pub trait DatasetSource: Send {
    fn metadata_xml(&self) -> &str;
    fn records(&self) -> &[DatasetRecord];
}

/// External collaborator: the output store the client writes received
/// images into, under the configured output group.
pub trait DatasetSink: Send {
    fn write(&mut self, envelope: &Envelope) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    /// Server-side config selector, e.g. "simplefft". Mutually exclusive
    /// in intent with `config_local`, which wins if both are set.
    pub config_remote: Option<String>,
    /// A config script's literal text, sent instead of a selector token.
    pub config_local: Option<String>,
    pub in_group: String,
    pub out_group: String,
}

/// Run one client session against an already-resolved dataset source/sink
/// pair. Returns once the inbound worker has joined and Close has been
/// sent.
pub async fn run_session<S, K>(config: &ClientConfig, source: &S, sink: K) -> Result<()>
where
    S: DatasetSource,
    K: DatasetSink + Send + 'static,
{
    let addr = format!("{}:{}", config.address, config.port);
    let stream = tokio::net::TcpStream::connect(&addr).await?;
    let (read_half, write_half) = stream.into_split();

    let inbound_worker = tokio::spawn(receive_images(read_half, sink));

    let mut outbound = OutboundConnection::new(write_half);
    send_outbound(config, source, &mut outbound).await?;

    inbound_worker.await.map_err(|e| MrdError::Protocol(format!("inbound worker panicked: {e}")))??;
    debug!("client session complete");
    Ok(())
}

async fn send_outbound<S, W>(config: &ClientConfig, source: &S, outbound: &mut OutboundConnection<W>) -> Result<()>
where
    S: DatasetSource,
    W: AsyncWriteExt + Unpin,
{
    match (&config.config_local, &config.config_remote) {
        (Some(text), _) => outbound.send_config_script(text).await?,
        (None, Some(token)) => outbound.send_config_file(token).await?,
        (None, None) => return Err(MrdError::Config("no config selector or local config text provided".to_string())),
    }

    outbound.send_metadata(source.metadata_xml()).await?;

    for record in source.records() {
        match record {
            DatasetRecord::Acquisition(acq) => outbound.send_acquisition(acq).await?,
            DatasetRecord::Image(image) => outbound.send_image(image).await?,
        }
    }

    outbound.send_close().await
}

/// Inbound worker: receives reply envelopes and writes them into `sink`
/// until Close or stream exhaustion. A per-record write failure is logged
/// and the stream continues; a framing failure terminates the worker.
async fn receive_images<R, K>(reader: R, mut sink: K) -> Result<()>
where
    R: AsyncReadExt + Unpin,
    K: DatasetSink,
{
    let mut inbound = InboundConnection::new_streaming(reader);
    loop {
        match inbound.next_message().await? {
            None => break,
            Some(Envelope::Close) => break,
            Some(envelope) => {
                if let Err(e) = sink.write(&envelope) {
                    warn!("failed to write received record to output store: {e}");
                }
            }
        }
    }
    Ok(())
}

/// An in-memory [`DatasetSource`], useful for tests and for driving the
/// client without a real on-disk MRD file.
pub struct InMemoryDatasetSource {
    pub metadata_xml: String,
    pub records: Vec<DatasetRecord>,
}

impl DatasetSource for InMemoryDatasetSource {
    fn metadata_xml(&self) -> &str {
        &self.metadata_xml
    }

    fn records(&self) -> &[DatasetRecord] {
        &self.records
    }
}

/// An in-memory [`DatasetSink`] collecting everything received.
#[derive(Default)]
pub struct InMemoryDatasetSink {
    pub received: Vec<Envelope>,
}

impl DatasetSink for InMemoryDatasetSink {
    fn write(&mut self, envelope: &Envelope) -> Result<()> {
        self.received.push(envelope.clone());
        Ok(())
    }
}

/// A file-backed [`DatasetSink`] used by the `mrd-client` binary: appends
/// raw framed bytes for each received Image/Acquisition/Waveform to
/// `outfile`, the way [`crate::capture::FileCaptureSink`] does on the
/// server side. A real MRD file writer (per-group datasets, XML headers)
/// is the out-of-scope on-disk store this trait stands in for.
pub struct FileDatasetSink {
    file: std::fs::File,
}

impl FileDatasetSink {
    pub fn create(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl DatasetSink for FileDatasetSink {
    fn write(&mut self, envelope: &Envelope) -> Result<()> {
        use std::io::Write as _;
        let bytes = match envelope {
            Envelope::Acquisition(acq) => crate::wire::encode_acquisition(acq),
            Envelope::Waveform(wf) => crate::wire::encode_waveform(wf),
            Envelope::Image(img) => crate::wire::encode_image(img),
            _ => return Ok(()),
        };
        self.file.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{AcquisitionHeader, Complex32};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn acq(step: u16, last: bool) -> Acquisition {
        Acquisition {
            header: AcquisitionHeader {
                flags: if last { crate::wire::ACQ_LAST_IN_SLICE } else { 0 },
                measurement_uid: 1,
                scan_counter: step as u32,
                active_channels: 1,
                trajectory_dimensions: 0,
                number_of_samples: 8,
                kspace_encode_step_1: step,
                kspace_encode_step_2: 0,
                slice: 0,
            },
            trajectory: vec![],
            data: vec![Complex32::new(1.0, 0.0); 8],
        }
    }

    struct SharedSink(Arc<Mutex<Vec<Envelope>>>);

    impl DatasetSink for SharedSink {
        fn write(&mut self, envelope: &Envelope) -> Result<()> {
            self.0.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn session_sends_selector_metadata_body_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut inbound = InboundConnection::new(stream);
            let first = inbound.next_message().await.unwrap().unwrap();
            assert!(matches!(first, Envelope::ConfigFile(ref s) if s == "simplefft"));
            let second = inbound.next_message().await.unwrap().unwrap();
            assert!(matches!(second, Envelope::ParameterScript(_)));
            let third = inbound.next_message().await.unwrap().unwrap();
            assert!(matches!(third, Envelope::Acquisition(_)));
            let fourth = inbound.next_message().await.unwrap().unwrap();
            assert!(matches!(fourth, Envelope::Close));
        });

        let config = ClientConfig {
            address: "127.0.0.1".to_string(),
            port: addr.port(),
            config_remote: Some("simplefft".to_string()),
            config_local: None,
            in_group: "dataset".to_string(),
            out_group: "out".to_string(),
        };
        let source = InMemoryDatasetSource {
            metadata_xml: "<hdr/>".to_string(),
            records: vec![DatasetRecord::Acquisition(acq(0, true))],
        };
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SharedSink(received.clone());

        run_session(&config, &source, sink).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_config_selector_is_reported() {
        let config = ClientConfig {
            address: "127.0.0.1".to_string(),
            port: 1, // unused: send_outbound fails before connecting in this test
            config_remote: None,
            config_local: None,
            in_group: "dataset".to_string(),
            out_group: "out".to_string(),
        };
        let source = InMemoryDatasetSource { metadata_xml: "<hdr/>".to_string(), records: vec![] };
        let mut sink_buf = Vec::new();
        let mut outbound = OutboundConnection::new(&mut sink_buf);
        let err = send_outbound(&config, &source, &mut outbound).await;
        assert!(matches!(err, Err(MrdError::Config(_))));
    }
}
