//! Pipeline dispatcher
//!
//! Resolves a ConfigSelector token to one of a small closed set of
//! pipelines. Deliberately a `match` over `&str`, not a runtime-registered
//! table: new pipelines are added by recompilation.

use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::capture::CaptureSink;
use crate::connection::{InboundConnection, OutboundConnection};
use crate::error::{MrdError, Result};
use crate::group::{Group, Grouper};
use crate::recon;
use crate::wire::Envelope;

/// Run the pipeline named by `selector` to completion. `capture_factory` is
/// only invoked by `savedataonly`, which escalates capture on unconditionally.
/// `metadata_xml` is the session header the worker already consumed before
/// dispatch ran; `savedataonly` needs it to back-fill the capture artefact's
/// header since it was read before capture turned on.
pub async fn dispatch<R, W, F>(
    selector: &str,
    inbound: &mut InboundConnection<R>,
    outbound: &mut OutboundConnection<W>,
    metadata_xml: &str,
    capture_factory: F,
) -> Result<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
    F: FnMut() -> Result<Box<dyn CaptureSink>> + Send + 'static,
{
    match selector {
        "simplefft" => reconstruct(inbound, outbound, false).await,
        "invertcontrast" => reconstruct(inbound, outbound, true).await,
        "null" => {
            drain(inbound).await?;
            outbound.send_close().await
        }
        "savedataonly" => {
            let header = Envelope::ParameterScript(metadata_xml.to_string());
            inbound.enable_capture_now(capture_factory, &header)?;
            drain(inbound).await?;
            outbound.send_close().await
        }
        other => {
            warn!("unresolved config selector {other:?}; falling back to invertcontrast");
            reconstruct(inbound, outbound, true).await
        }
    }
}

/// Drain the inbound stream until exhaustion without producing output.
async fn drain<R: AsyncReadExt + Unpin>(inbound: &mut InboundConnection<R>) -> Result<()> {
    while inbound.next_message().await?.is_some() {}
    Ok(())
}

async fn reconstruct<R, W>(inbound: &mut InboundConnection<R>, outbound: &mut OutboundConnection<W>, invert: bool) -> Result<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut grouper = Grouper::with_defaults();
    loop {
        let envelope = match inbound.next_message().await? {
            Some(env) => env,
            None => break,
        };
        if let Envelope::Close = envelope {
            break;
        }
        if let Some(group) = grouper.push(envelope) {
            if let Some(image) = run_kernel(group, invert)? {
                outbound.send_image(&image).await?;
            }
        }
    }
    grouper.finish_stream();
    outbound.send_close().await
}

/// Invoke a reconstruction kernel with a panic boundary: a numeric exception
/// inside the kernel is caught, logged, and the group is skipped rather than
/// taking down the worker.
fn run_kernel(group: Group, invert: bool) -> Result<Option<crate::wire::Image>> {
    match group {
        Group::Image(image) => {
            if invert {
                Ok(Some(recon::invert_image(&image)))
            } else {
                Ok(Some(image))
            }
        }
        Group::Acquisitions(acqs) => {
            match std::panic::catch_unwind(move || recon::k_fft(&acqs, invert)) {
                Ok(result) => Ok(result),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(MrdError::Pipeline(message))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Acquisition, AcquisitionHeader, Complex32};
    use std::sync::{Arc, Mutex};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Envelope>>>);

    impl CaptureSink for RecordingSink {
        fn capture(&mut self, envelope: &Envelope) -> Result<()> {
            self.0.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

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

    #[tokio::test]
    async fn null_pipeline_drains_and_emits_single_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut out = OutboundConnection::new(stream);
            out.send_config_file("null").await.unwrap();
            out.send_metadata("<hdr/>").await.unwrap();
            out.send_acquisition(&acq(0, true)).await.unwrap();
            out.send_close().await.unwrap();
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = server_stream.into_split();
        let mut inbound = InboundConnection::new(read_half);
        let mut outbound = OutboundConnection::new(write_half);

        inbound.next_message().await.unwrap(); // ConfigFile
        inbound.next_message().await.unwrap(); // ParameterScript

        dispatch("null", &mut inbound, &mut outbound, "<hdr/>", || {
            Err(MrdError::Resource("capture not wired in this test".into()))
        })
        .await
        .unwrap();

        client.await.unwrap();
    }

    #[tokio::test]
    async fn simplefft_pipeline_emits_one_image_per_slice() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let (mut read_half, write_half) = stream.split();
            let mut out = OutboundConnection::new(write_half);
            out.send_config_file("simplefft").await.unwrap();
            out.send_metadata("<hdr/>").await.unwrap();
            out.send_acquisition(&acq(0, true)).await.unwrap();
            out.send_close().await.unwrap();

            // The server's replies are a bare Image+Close stream with no
            // handshake of their own, so read them starting in `Streaming`.
            let mut replies = InboundConnection::new_streaming(&mut read_half);
            let image = replies.next_message().await.unwrap().unwrap();
            assert!(matches!(image, Envelope::Image(_)));
            let close = replies.next_message().await.unwrap().unwrap();
            assert!(matches!(close, Envelope::Close));
            assert!(replies.next_message().await.unwrap().is_none());
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = server_stream.into_split();
        let mut inbound = InboundConnection::new(read_half);
        let mut outbound = OutboundConnection::new(write_half);

        inbound.next_message().await.unwrap();
        inbound.next_message().await.unwrap();

        dispatch("simplefft", &mut inbound, &mut outbound, "<hdr/>", || {
            Err(MrdError::Resource("capture not wired in this test".into()))
        })
        .await
        .unwrap();

        client.await.unwrap();
    }

    #[tokio::test]
    async fn savedataonly_captures_the_header_and_the_acquisitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut out = OutboundConnection::new(stream);
            out.send_config_file("savedataonly").await.unwrap();
            out.send_metadata("<hdr/>").await.unwrap();
            out.send_acquisition(&acq(0, true)).await.unwrap();
            out.send_close().await.unwrap();
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = server_stream.into_split();
        let mut inbound = InboundConnection::new(read_half);
        let mut outbound = OutboundConnection::new(write_half);

        inbound.next_message().await.unwrap(); // ConfigFile
        let metadata = match inbound.next_message().await.unwrap().unwrap() {
            Envelope::ParameterScript(xml) => xml,
            other => panic!("expected ParameterScript, got {other:?}"),
        };

        let sink = RecordingSink::default();
        let recorded = sink.0.clone();
        dispatch("savedataonly", &mut inbound, &mut outbound, &metadata, move || {
            Ok(Box::new(sink.clone()) as Box<dyn CaptureSink>)
        })
        .await
        .unwrap();

        let recorded = recorded.lock().unwrap();
        assert!(matches!(recorded[0], Envelope::ParameterScript(ref s) if s == "<hdr/>"));
        assert!(matches!(recorded[1], Envelope::Acquisition(_)));

        client.await.unwrap();
    }
}
