//! Session Connection
//!
//! Owns one TCP stream in one direction of use at a time: outbound-only or
//! inbound-only per logical role. A duplex socket may back two `Connection`s,
//! one per role, in the client driver (see [`crate::client`]).
//!
//! Inbound state machine:
//!
//! ```text
//! Start ── ConfigSelector ──▶ AwaitMetadata ── MetadataDocument ──▶ Streaming
//! Streaming ── body record ──▶ Streaming
//! Streaming ── Close ──▶ Exhausted  (terminal)
//! any state ── stream fault ──▶ Faulted  (terminal)
//! ```
//!
//! Out-of-order messages and unknown identifiers are reported as
//! [`MrdError::Protocol`]/[`MrdError::UnknownKind`] and terminate the
//! session: the framing has no generic skip length, so recovery after a
//! decode failure is impossible.

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::capture::CaptureSink;
use crate::error::{MrdError, Result};
use crate::wire::{self, Envelope, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    AwaitMetadata,
    Streaming,
    Exhausted,
    Faulted,
}

/// Lazily-created capture sink: creation is deferred until the first
/// captured record (session header or body) so that empty sessions don't
/// materialise artefacts.
enum CaptureSlot {
    Disabled,
    Pending(Box<dyn FnMut() -> Result<Box<dyn CaptureSink>> + Send>),
    Active(Box<dyn CaptureSink>),
}

/// The inbound half of a session: reads framed envelopes off a stream.
pub struct InboundConnection<R> {
    reader: R,
    state: State,
    capture: CaptureSlot,
}

impl<R: AsyncReadExt + Unpin> InboundConnection<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: State::Start,
            capture: CaptureSlot::Disabled,
        }
    }

    /// Construct a connection that skips the config/metadata handshake and
    /// starts directly in `Streaming`. Used for the client's reply-reading
    /// half: the server's outbound stream is a bare body-record-then-Close
    /// sequence with no handshake of its own.
    pub fn new_streaming(reader: R) -> Self {
        Self {
            reader,
            state: State::Streaming,
            capture: CaptureSlot::Disabled,
        }
    }

    /// Enable capture, deferring sink construction until the first captured
    /// record (session header or body) arrives.
    pub fn with_capture<F>(mut self, factory: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn CaptureSink>> + Send + 'static,
    {
        self.capture = CaptureSlot::Pending(Box::new(factory));
        self
    }

    /// Force the capture sink into existence now, regardless of whether a
    /// body record has arrived (used by the `savedataonly` pipeline, which
    /// escalates capture on even if disabled). `header` is the session
    /// metadata envelope already consumed by the worker before dispatch ran;
    /// it is captured immediately so the artefact still carries the header
    /// even though `maybe_capture` never saw it live.
    pub fn enable_capture_now<F>(&mut self, factory: F, header: &Envelope) -> Result<()>
    where
        F: FnMut() -> Result<Box<dyn CaptureSink>> + Send + 'static,
    {
        if matches!(self.capture, CaptureSlot::Active(_)) {
            return Ok(());
        }
        let mut factory = factory;
        let mut sink = factory()?;
        if let Err(e) = sink.capture(header) {
            if sink.is_fatal() {
                return Err(MrdError::Resource(e.to_string()));
            }
            warn!("capture sink write failed (non-fatal): {e}");
        }
        self.capture = CaptureSlot::Active(sink);
        Ok(())
    }

    pub fn capture_is_enabled(&self) -> bool {
        !matches!(self.capture, CaptureSlot::Disabled)
    }

    async fn read_exact_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    fn check_order(&self, kind: MessageKind) -> Result<()> {
        use MessageKind::*;
        let ok = match self.state {
            State::Start => matches!(kind, ConfigFile | ConfigScript),
            State::AwaitMetadata => matches!(kind, ParameterScript),
            State::Streaming => matches!(kind, Acquisition | Waveform | Image | Close),
            State::Exhausted | State::Faulted => false,
        };
        if ok {
            Ok(())
        } else {
            Err(MrdError::Protocol(format!(
                "unexpected {kind:?} in state {:?}",
                self.state
            )))
        }
    }

    fn maybe_capture(&mut self, envelope: &Envelope) -> Result<()> {
        let is_captured = matches!(
            envelope.kind(),
            MessageKind::ParameterScript | MessageKind::Acquisition | MessageKind::Waveform | MessageKind::Image
        );
        if !is_captured {
            return Ok(());
        }
        if let CaptureSlot::Pending(factory) = &mut self.capture {
            match factory() {
                Ok(sink) => self.capture = CaptureSlot::Active(sink),
                Err(e) => {
                    warn!("failed to create capture sink: {e}");
                    self.capture = CaptureSlot::Disabled;
                    return Ok(());
                }
            }
        }
        if let CaptureSlot::Active(sink) = &mut self.capture {
            if let Err(e) = sink.capture(envelope) {
                if sink.is_fatal() {
                    return Err(MrdError::Resource(e.to_string()));
                }
                warn!("capture sink write failed (non-fatal): {e}");
            }
        }
        Ok(())
    }

    /// Read and return the next envelope, or `None` once the session is
    /// exhausted (a `Close` was received, or the stream ended cleanly before
    /// any message arrived).
    pub async fn next_message(&mut self) -> Result<Option<Envelope>> {
        if self.state == State::Exhausted {
            // Latched: a session that has seen Close never reads again, even
            // if the peer left the socket open. A stray second Close (or any
            // other record) sent after the first would fail `check_order`
            // just like it does from any other non-Streaming state; we just
            // never get there because there is nothing left worth reading.
            return Ok(None);
        }
        if self.state == State::Faulted {
            return Err(MrdError::ConnectionClosed);
        }

        let mut id_buf = [0u8; wire::IDENTIFIER_SIZE];
        match self.reader.read_exact(&mut id_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && self.state == State::Start => {
                debug!("connection closed before any message arrived");
                self.state = State::Exhausted;
                return Ok(None);
            }
            Err(e) => {
                self.state = State::Faulted;
                return Err(MrdError::Io(e));
            }
        }

        let kind = match wire::decode_identifier(id_buf) {
            Ok(k) => k,
            Err(e) => {
                self.state = State::Faulted;
                return Err(e);
            }
        };

        if let Err(e) = self.check_order(kind) {
            self.state = State::Faulted;
            return Err(e);
        }

        let envelope = match self.read_body(kind).await {
            Ok(env) => env,
            Err(e) => {
                self.state = State::Faulted;
                return Err(e);
            }
        };

        self.state = match kind {
            MessageKind::ConfigFile | MessageKind::ConfigScript => State::AwaitMetadata,
            MessageKind::ParameterScript => State::Streaming,
            MessageKind::Close => State::Exhausted,
            _ => State::Streaming,
        };

        self.maybe_capture(&envelope)?;

        Ok(Some(envelope))
    }

    async fn read_body(&mut self, kind: MessageKind) -> Result<Envelope> {
        Ok(match kind {
            MessageKind::ConfigFile => {
                let bytes = self.read_exact_vec(wire::CONFIG_FILE_SIZE).await?;
                let arr: [u8; wire::CONFIG_FILE_SIZE] = bytes.try_into().unwrap();
                Envelope::ConfigFile(wire::decode_config_file(&arr)?)
            }
            MessageKind::ConfigScript => {
                let text = self.read_text_block().await?;
                Envelope::ConfigScript(text)
            }
            MessageKind::ParameterScript => {
                let text = self.read_text_block().await?;
                Envelope::ParameterScript(text)
            }
            MessageKind::Close => Envelope::Close,
            MessageKind::Acquisition => {
                let header_bytes = self.read_exact_vec(wire::ACQUISITION_HEADER_SIZE).await?;
                let arr: [u8; wire::ACQUISITION_HEADER_SIZE] = header_bytes.try_into().unwrap();
                let header = wire::decode_acquisition_header(&arr)?;
                let trailing_len = header.trajectory_len() * 4 + header.sample_len() * 8;
                let trailing = self.read_exact_vec(trailing_len).await?;
                Envelope::Acquisition(wire::decode_acquisition_body(header, &trailing)?)
            }
            MessageKind::Waveform => {
                let header_bytes = self.read_exact_vec(wire::WAVEFORM_HEADER_SIZE).await?;
                let arr: [u8; wire::WAVEFORM_HEADER_SIZE] = header_bytes.try_into().unwrap();
                let header = wire::decode_waveform_header(&arr)?;
                let trailing = self.read_exact_vec(header.number_of_samples as usize * 4).await?;
                Envelope::Waveform(wire::decode_waveform_body(header, &trailing)?)
            }
            MessageKind::Image => {
                let header_bytes = self.read_exact_vec(wire::IMAGE_HEADER_SIZE).await?;
                let arr: [u8; wire::IMAGE_HEADER_SIZE] = header_bytes.try_into().unwrap();
                let header = wire::decode_image_header(&arr)?;
                let len_bytes = self.read_exact_vec(wire::LENGTH_SIZE).await?;
                let len_arr: [u8; wire::LENGTH_SIZE] = len_bytes.try_into().unwrap();
                let attr_len_with_nul = wire::decode_length(len_arr);
                let element_size = match header.data_type {
                    wire::ImageDataType::Short => 2,
                    wire::ImageDataType::Float => 4,
                    wire::ImageDataType::Double => 8,
                    _ => {
                        return Err(MrdError::Codec(format!(
                            "unsupported image data_type {:?} on read",
                            header.data_type
                        )))
                    }
                };
                let trailing_len = attr_len_with_nul as usize + header.element_count() * element_size;
                let trailing = self.read_exact_vec(trailing_len).await?;
                Envelope::Image(wire::decode_image_body(header, attr_len_with_nul, &trailing)?)
            }
        })
    }

    async fn read_text_block(&mut self) -> Result<String> {
        let len_bytes = self.read_exact_vec(wire::LENGTH_SIZE).await?;
        let len_arr: [u8; wire::LENGTH_SIZE] = len_bytes.try_into().unwrap();
        let len = wire::decode_length(len_arr) as usize;
        let bytes = self.read_exact_vec(len).await?;
        String::from_utf8(bytes).map_err(|e| MrdError::Codec(e.to_string()))
    }
}

/// The outbound half of a session: writes framed envelopes to a stream.
pub struct OutboundConnection<W> {
    writer: W,
}

impl<W: AsyncWriteExt + Unpin> OutboundConnection<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    async fn send_framed(&mut self, kind: MessageKind, mut payload: Vec<u8>) -> Result<()> {
        let mut buf = Vec::with_capacity(wire::IDENTIFIER_SIZE + payload.len());
        buf.extend_from_slice(&wire::encode_identifier(kind));
        buf.append(&mut payload);
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    pub async fn send_config_file(&mut self, token: &str) -> Result<()> {
        let payload = wire::encode_config_file(token)?;
        self.send_framed(MessageKind::ConfigFile, payload.to_vec()).await
    }

    pub async fn send_config_script(&mut self, text: &str) -> Result<()> {
        self.send_framed(MessageKind::ConfigScript, wire::encode_text_block(text)).await
    }

    pub async fn send_metadata(&mut self, xml: &str) -> Result<()> {
        self.send_framed(MessageKind::ParameterScript, wire::encode_text_block(xml)).await
    }

    pub async fn send_acquisition(&mut self, acq: &wire::Acquisition) -> Result<()> {
        self.send_framed(MessageKind::Acquisition, wire::encode_acquisition(acq)).await
    }

    pub async fn send_waveform(&mut self, wf: &wire::Waveform) -> Result<()> {
        self.send_framed(MessageKind::Waveform, wire::encode_waveform(wf)).await
    }

    pub async fn send_image(&mut self, image: &wire::Image) -> Result<()> {
        self.send_framed(MessageKind::Image, wire::encode_image(image)).await
    }

    pub async fn send_close(&mut self) -> Result<()> {
        self.send_framed(MessageKind::Close, Vec::new()).await
    }

    /// Half-close the underlying stream. Called in the worker's finally
    /// clause; errors here are expected if the peer already hung up and
    /// are swallowed by the caller.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Acquisition, AcquisitionHeader, Complex32};
    use tokio::net::{TcpListener, TcpStream};

    fn sample_acquisition(line: u16, last_in_slice: bool) -> Acquisition {
        Acquisition {
            header: AcquisitionHeader {
                flags: if last_in_slice { wire::ACQ_LAST_IN_SLICE } else { 0 },
                measurement_uid: 1,
                scan_counter: 1,
                active_channels: 1,
                trajectory_dimensions: 0,
                number_of_samples: 2,
                kspace_encode_step_1: line,
                kspace_encode_step_2: 0,
                slice: 0,
            },
            trajectory: vec![],
            data: vec![Complex32::new(1.0, 0.0), Complex32::new(2.0, 0.0)],
        }
    }

    #[tokio::test]
    async fn session_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut out = OutboundConnection::new(stream);
            out.send_config_file("simplefft").await.unwrap();
            out.send_metadata("<hdr/>").await.unwrap();
            out.send_acquisition(&sample_acquisition(0, true)).await.unwrap();
            out.send_close().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut inbound = InboundConnection::new(stream);

        let first = inbound.next_message().await.unwrap().unwrap();
        assert!(matches!(first, Envelope::ConfigFile(ref s) if s == "simplefft"));

        let second = inbound.next_message().await.unwrap().unwrap();
        assert!(matches!(second, Envelope::ParameterScript(ref s) if s == "<hdr/>"));

        let third = inbound.next_message().await.unwrap().unwrap();
        assert!(matches!(third, Envelope::Acquisition(_)));

        let fourth = inbound.next_message().await.unwrap().unwrap();
        assert!(matches!(fourth, Envelope::Close));

        assert!(inbound.next_message().await.unwrap().is_none());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_order_body_record_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut out = OutboundConnection::new(stream);
            out.send_config_file("simplefft").await.unwrap();
            // Body record sent before metadata: out of order.
            out.send_acquisition(&sample_acquisition(0, true)).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut inbound = InboundConnection::new(stream);
        inbound.next_message().await.unwrap();
        let err = inbound.next_message().await;
        assert!(matches!(err, Err(MrdError::Protocol(_))));
        let _ = client.await;
    }

    #[tokio::test]
    async fn close_instead_of_metadata_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut out = OutboundConnection::new(stream);
            out.send_config_file("null").await.unwrap();
            // Close instead of the mandatory ParameterScript: out of order.
            out.send_close().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut inbound = InboundConnection::new(stream);
        inbound.next_message().await.unwrap();
        let err = inbound.next_message().await;
        assert!(matches!(err, Err(MrdError::Protocol(_))));
        let _ = client.await;
    }

    #[tokio::test]
    async fn empty_session_ends_cleanly_without_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let _stream = TcpStream::connect(addr).await.unwrap();
            // Drop immediately without sending anything.
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut inbound = InboundConnection::new(stream);
        assert!(inbound.next_message().await.unwrap().is_none());
        let _ = client.await;
    }
}
