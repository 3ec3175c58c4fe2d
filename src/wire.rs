//! MRD (ISMRMRD) Wire Format
//!
//! Every envelope on the wire begins with a 2-byte little-endian identifier.
//! What follows depends on the identifier: a fixed-size payload, a
//! length-prefixed byte block, or a structured record with embedded
//! sub-lengths. Byte order is little-endian throughout. The framing is not
//! self-synchronising: loss or corruption of a single byte is unrecoverable,
//! so a decode failure always terminates the session.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{MrdError, Result};

/// Length of the fixed config-file payload (NUL-padded token).
pub const CONFIG_FILE_SIZE: usize = 1024;

/// Size in bytes of the 2-byte message identifier.
pub const IDENTIFIER_SIZE: usize = 2;

/// Size in bytes of an 8-byte length prefix.
pub const LENGTH_SIZE: usize = 8;

/// Fixed byte size of an acquisition header, before the trajectory and
/// sample arrays whose element counts it declares.
pub const ACQUISITION_HEADER_SIZE: usize = 28;

/// Fixed byte size of a waveform header, before its sample array.
pub const WAVEFORM_HEADER_SIZE: usize = 26;

/// Fixed byte size of an image header, before the attribute block and the
/// dense numeric array it declares.
pub const IMAGE_HEADER_SIZE: usize = 26;

/// Message kind identifiers, per the MRD streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ConfigFile,
    ConfigScript,
    ParameterScript,
    Close,
    Acquisition,
    Image,
    Waveform,
}

impl MessageKind {
    fn id(self) -> u16 {
        match self {
            MessageKind::ConfigFile => 1,
            MessageKind::ConfigScript => 2,
            MessageKind::ParameterScript => 3,
            MessageKind::Close => 4,
            MessageKind::Acquisition => 1008,
            MessageKind::Image => 1022,
            MessageKind::Waveform => 1026,
        }
    }

    fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            1 => MessageKind::ConfigFile,
            2 => MessageKind::ConfigScript,
            3 => MessageKind::ParameterScript,
            4 => MessageKind::Close,
            1008 => MessageKind::Acquisition,
            1022 => MessageKind::Image,
            1026 => MessageKind::Waveform,
            _ => return None,
        })
    }
}

/// Encode a message kind identifier (2 bytes, little-endian u16).
pub fn encode_identifier(kind: MessageKind) -> [u8; IDENTIFIER_SIZE] {
    kind.id().to_le_bytes()
}

/// Decode a message kind identifier. Unrecognised ids are reported, not
/// silently swallowed: the framing has no generic skip length, so an
/// unknown identifier is unrecoverable.
pub fn decode_identifier(bytes: [u8; IDENTIFIER_SIZE]) -> Result<MessageKind> {
    let id = u16::from_le_bytes(bytes);
    MessageKind::from_id(id).ok_or(MrdError::UnknownKind(id))
}

/// Encode an 8-byte little-endian length prefix.
pub fn encode_length(len: u64) -> [u8; LENGTH_SIZE] {
    len.to_le_bytes()
}

/// Decode an 8-byte little-endian length prefix.
pub fn decode_length(bytes: [u8; LENGTH_SIZE]) -> u64 {
    u64::from_le_bytes(bytes)
}

/// Encode a config selector token as the fixed 1024-byte NUL-padded block.
pub fn encode_config_file(token: &str) -> Result<[u8; CONFIG_FILE_SIZE]> {
    let bytes = token.as_bytes();
    if bytes.len() >= CONFIG_FILE_SIZE {
        return Err(MrdError::ValueTooLong(format!(
            "config selector {} bytes, must be < {}",
            bytes.len(),
            CONFIG_FILE_SIZE
        )));
    }
    let mut buf = [0u8; CONFIG_FILE_SIZE];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Decode a fixed config-file block back to a token, trimming NUL padding.
pub fn decode_config_file(buf: &[u8; CONFIG_FILE_SIZE]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).map_err(|e| MrdError::Codec(e.to_string()))
}

/// ISMRMRD flag bits of interest to the grouping operator. Flags are
/// numbered starting at 1; `is_flag_set` tests bit `(flag_number - 1)`.
pub const ACQ_IS_PHASECORR_DATA: u64 = 1 << (6 - 1);
pub const ACQ_LAST_IN_SLICE: u64 = 1 << (14 - 1);

/// A single complex k-space sample (32-bit float components).
pub type Complex32 = num_complex::Complex<f32>;

/// Acquisition header fields the core reads. The full published MRD
/// acquisition header carries many more vendor fields; the codec collaborator
/// this stands in for is responsible for those, not the streaming core.
#[derive(Debug, Clone)]
pub struct AcquisitionHeader {
    pub flags: u64,
    pub measurement_uid: u32,
    pub scan_counter: u32,
    pub active_channels: u16,
    pub trajectory_dimensions: u16,
    pub number_of_samples: u16,
    pub kspace_encode_step_1: u16,
    pub kspace_encode_step_2: u16,
    pub slice: u16,
}

impl AcquisitionHeader {
    pub fn is_flag_set(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }

    pub fn trajectory_len(&self) -> usize {
        self.trajectory_dimensions as usize * self.number_of_samples as usize
    }

    pub fn sample_len(&self) -> usize {
        self.active_channels as usize * self.number_of_samples as usize
    }
}

#[derive(Debug, Clone)]
pub struct Acquisition {
    pub header: AcquisitionHeader,
    pub trajectory: Vec<f32>,
    pub data: Vec<Complex32>,
}

impl Acquisition {
    pub fn is_flag_set(&self, flag: u64) -> bool {
        self.header.is_flag_set(flag)
    }
}

#[derive(Debug, Clone)]
pub struct WaveformHeader {
    pub flags: u64,
    pub measurement_uid: u32,
    pub scan_counter: u32,
    pub channel_id: u16,
    pub number_of_samples: u32,
    pub sample_time_us: f32,
}

/// Passed through the core without interpretation.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub header: WaveformHeader,
    pub data: Vec<u32>,
}

/// The element type stored in an image's dense numeric array, as named by
/// the header's `data_type` field in the published MRD layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDataType {
    UShort,
    Short,
    UInt,
    Int,
    Float,
    Double,
}

impl ImageDataType {
    fn code(self) -> u16 {
        match self {
            ImageDataType::UShort => 1,
            ImageDataType::Short => 2,
            ImageDataType::UInt => 3,
            ImageDataType::Int => 4,
            ImageDataType::Float => 5,
            ImageDataType::Double => 6,
        }
    }

    fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            1 => ImageDataType::UShort,
            2 => ImageDataType::Short,
            3 => ImageDataType::UInt,
            4 => ImageDataType::Int,
            5 => ImageDataType::Float,
            6 => ImageDataType::Double,
            other => return Err(MrdError::Codec(format!("unknown image data_type {other}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageHeader {
    pub flags: u64,
    pub measurement_uid: u32,
    pub channels: u16,
    pub matrix_x: u16,
    pub matrix_y: u16,
    pub matrix_z: u16,
    pub data_type: ImageDataType,
    pub image_index: u16,
    pub slice: u16,
}

impl ImageHeader {
    pub fn element_count(&self) -> usize {
        self.channels as usize * self.matrix_x as usize * self.matrix_y as usize * self.matrix_z as usize
    }
}

/// The dense numeric array backing an image, tagged by element type so the
/// header's `data_type` and the payload always agree.
#[derive(Debug, Clone)]
pub enum ImageData {
    Short(Vec<i16>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl ImageData {
    pub fn data_type(&self) -> ImageDataType {
        match self {
            ImageData::Short(_) => ImageDataType::Short,
            ImageData::Float(_) => ImageDataType::Float,
            ImageData::Double(_) => ImageDataType::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ImageData::Short(v) => v.len(),
            ImageData::Float(v) => v.len(),
            ImageData::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub header: ImageHeader,
    /// Serialised XML meta attributes.
    pub attributes: String,
    pub data: ImageData,
}

/// A framed unit on the wire: identifier plus kind-specific payload.
#[derive(Debug, Clone)]
pub enum Envelope {
    ConfigFile(String),
    ConfigScript(String),
    ParameterScript(String),
    Close,
    Acquisition(Acquisition),
    Waveform(Waveform),
    Image(Image),
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::ConfigFile(_) => MessageKind::ConfigFile,
            Envelope::ConfigScript(_) => MessageKind::ConfigScript,
            Envelope::ParameterScript(_) => MessageKind::ParameterScript,
            Envelope::Close => MessageKind::Close,
            Envelope::Acquisition(_) => MessageKind::Acquisition,
            Envelope::Waveform(_) => MessageKind::Waveform,
            Envelope::Image(_) => MessageKind::Image,
        }
    }
}

/// Encode a length-prefixed UTF-8 text block (ConfigScript / ParameterScript).
pub fn encode_text_block(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut buf = Vec::with_capacity(LENGTH_SIZE + bytes.len());
    buf.extend_from_slice(&encode_length(bytes.len() as u64));
    buf.extend_from_slice(bytes);
    buf
}

/// Encode an acquisition header + trajectory + k-space samples.
///
/// Stands in for the external MRD codec's `writeInto`/`readFrom`
/// abstractions: the core trusts the declared element counts in the header
/// rather than re-deriving them from payload length.
pub fn encode_acquisition(acq: &Acquisition) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        ACQUISITION_HEADER_SIZE + acq.trajectory.len() * 4 + acq.data.len() * 8,
    );
    encode_acquisition_header(&acq.header, &mut buf);
    for sample in &acq.trajectory {
        buf.write_f32::<LittleEndian>(*sample).unwrap();
    }
    for sample in &acq.data {
        buf.write_f32::<LittleEndian>(sample.re).unwrap();
        buf.write_f32::<LittleEndian>(sample.im).unwrap();
    }
    buf
}

pub fn encode_acquisition_header(header: &AcquisitionHeader, buf: &mut Vec<u8>) {
    buf.write_u64::<LittleEndian>(header.flags).unwrap();
    buf.write_u32::<LittleEndian>(header.measurement_uid).unwrap();
    buf.write_u32::<LittleEndian>(header.scan_counter).unwrap();
    buf.write_u16::<LittleEndian>(header.active_channels).unwrap();
    buf.write_u16::<LittleEndian>(header.trajectory_dimensions).unwrap();
    buf.write_u16::<LittleEndian>(header.number_of_samples).unwrap();
    buf.write_u16::<LittleEndian>(header.kspace_encode_step_1).unwrap();
    buf.write_u16::<LittleEndian>(header.kspace_encode_step_2).unwrap();
    buf.write_u16::<LittleEndian>(header.slice).unwrap();
}

/// Decode a fixed-size acquisition header from exactly
/// [`ACQUISITION_HEADER_SIZE`] bytes.
pub fn decode_acquisition_header(bytes: &[u8; ACQUISITION_HEADER_SIZE]) -> Result<AcquisitionHeader> {
    let mut cursor = Cursor::new(bytes.as_slice());
    let flags = cursor.read_u64::<LittleEndian>().map_err(io_to_codec)?;
    let measurement_uid = cursor.read_u32::<LittleEndian>().map_err(io_to_codec)?;
    let scan_counter = cursor.read_u32::<LittleEndian>().map_err(io_to_codec)?;
    let active_channels = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let trajectory_dimensions = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let number_of_samples = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let kspace_encode_step_1 = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let kspace_encode_step_2 = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let slice = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    Ok(AcquisitionHeader {
        flags,
        measurement_uid,
        scan_counter,
        active_channels,
        trajectory_dimensions,
        number_of_samples,
        kspace_encode_step_1,
        kspace_encode_step_2,
        slice,
    })
}

/// Decode trajectory + sample arrays given an already-decoded header and the
/// exact trailing bytes it declares.
pub fn decode_acquisition_body(header: AcquisitionHeader, bytes: &[u8]) -> Result<Acquisition> {
    let mut cursor = Cursor::new(bytes);
    let traj_count = header.trajectory_len();
    let mut trajectory = Vec::with_capacity(traj_count);
    for _ in 0..traj_count {
        trajectory.push(cursor.read_f32::<LittleEndian>().map_err(io_to_codec)?);
    }
    let sample_count = header.sample_len();
    let mut data = Vec::with_capacity(sample_count);
    for _ in 0..sample_count {
        let re = cursor.read_f32::<LittleEndian>().map_err(io_to_codec)?;
        let im = cursor.read_f32::<LittleEndian>().map_err(io_to_codec)?;
        data.push(Complex32::new(re, im));
    }
    Ok(Acquisition { header, trajectory, data })
}

/// Decode an acquisition from a byte slice known to hold exactly one record
/// (header followed immediately by its declared trailing arrays).
pub fn decode_acquisition(bytes: &[u8]) -> Result<Acquisition> {
    if bytes.len() < ACQUISITION_HEADER_SIZE {
        return Err(MrdError::Codec("acquisition shorter than fixed header".into()));
    }
    let header_bytes: [u8; ACQUISITION_HEADER_SIZE] = bytes[..ACQUISITION_HEADER_SIZE].try_into().unwrap();
    let header = decode_acquisition_header(&header_bytes)?;
    decode_acquisition_body(header, &bytes[ACQUISITION_HEADER_SIZE..])
}

pub fn encode_waveform(wf: &Waveform) -> Vec<u8> {
    let mut buf = Vec::with_capacity(WAVEFORM_HEADER_SIZE + wf.data.len() * 4);
    buf.write_u64::<LittleEndian>(wf.header.flags).unwrap();
    buf.write_u32::<LittleEndian>(wf.header.measurement_uid).unwrap();
    buf.write_u32::<LittleEndian>(wf.header.scan_counter).unwrap();
    buf.write_u16::<LittleEndian>(wf.header.channel_id).unwrap();
    buf.write_u32::<LittleEndian>(wf.header.number_of_samples).unwrap();
    buf.write_f32::<LittleEndian>(wf.header.sample_time_us).unwrap();
    for sample in &wf.data {
        buf.write_u32::<LittleEndian>(*sample).unwrap();
    }
    buf
}

/// Decode a fixed-size waveform header from exactly [`WAVEFORM_HEADER_SIZE`] bytes.
pub fn decode_waveform_header(bytes: &[u8; WAVEFORM_HEADER_SIZE]) -> Result<WaveformHeader> {
    let mut cursor = Cursor::new(bytes.as_slice());
    let flags = cursor.read_u64::<LittleEndian>().map_err(io_to_codec)?;
    let measurement_uid = cursor.read_u32::<LittleEndian>().map_err(io_to_codec)?;
    let scan_counter = cursor.read_u32::<LittleEndian>().map_err(io_to_codec)?;
    let channel_id = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let number_of_samples = cursor.read_u32::<LittleEndian>().map_err(io_to_codec)?;
    let sample_time_us = cursor.read_f32::<LittleEndian>().map_err(io_to_codec)?;
    Ok(WaveformHeader {
        flags,
        measurement_uid,
        scan_counter,
        channel_id,
        number_of_samples,
        sample_time_us,
    })
}

pub fn decode_waveform_body(header: WaveformHeader, bytes: &[u8]) -> Result<Waveform> {
    let mut cursor = Cursor::new(bytes);
    let mut data = Vec::with_capacity(header.number_of_samples as usize);
    for _ in 0..header.number_of_samples {
        data.push(cursor.read_u32::<LittleEndian>().map_err(io_to_codec)?);
    }
    Ok(Waveform { header, data })
}

pub fn decode_waveform(bytes: &[u8]) -> Result<Waveform> {
    if bytes.len() < WAVEFORM_HEADER_SIZE {
        return Err(MrdError::Codec("waveform shorter than fixed header".into()));
    }
    let header_bytes: [u8; WAVEFORM_HEADER_SIZE] = bytes[..WAVEFORM_HEADER_SIZE].try_into().unwrap();
    let header = decode_waveform_header(&header_bytes)?;
    decode_waveform_body(header, &bytes[WAVEFORM_HEADER_SIZE..])
}

pub fn encode_image_header(header: &ImageHeader, buf: &mut Vec<u8>) {
    buf.write_u64::<LittleEndian>(header.flags).unwrap();
    buf.write_u32::<LittleEndian>(header.measurement_uid).unwrap();
    buf.write_u16::<LittleEndian>(header.channels).unwrap();
    buf.write_u16::<LittleEndian>(header.matrix_x).unwrap();
    buf.write_u16::<LittleEndian>(header.matrix_y).unwrap();
    buf.write_u16::<LittleEndian>(header.matrix_z).unwrap();
    buf.write_u16::<LittleEndian>(header.data_type.code()).unwrap();
    buf.write_u16::<LittleEndian>(header.image_index).unwrap();
    buf.write_u16::<LittleEndian>(header.slice).unwrap();
}

/// Encode an image. The attribute string diverges from the codec default in
/// one respect, and this is the canonical wire format: the declared length
/// equals `attributes.len() + 1` (the trailing NUL is included in the
/// count), followed by the bytes and then the NUL itself. This asymmetry
/// must be matched bit-for-bit by any compatible reader.
pub fn encode_image(image: &Image) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_image_header(&image.header, &mut buf);

    let attr_bytes = image.attributes.as_bytes();
    buf.write_u64::<LittleEndian>(attr_bytes.len() as u64 + 1).unwrap();
    buf.extend_from_slice(attr_bytes);
    buf.push(0u8);

    match &image.data {
        ImageData::Short(v) => {
            for s in v {
                buf.write_i16::<LittleEndian>(*s).unwrap();
            }
        }
        ImageData::Float(v) => {
            for s in v {
                buf.write_f32::<LittleEndian>(*s).unwrap();
            }
        }
        ImageData::Double(v) => {
            for s in v {
                buf.write_f64::<LittleEndian>(*s).unwrap();
            }
        }
    }
    buf
}

pub fn decode_image_header(bytes: &[u8; IMAGE_HEADER_SIZE]) -> Result<ImageHeader> {
    let mut cursor = Cursor::new(bytes.as_slice());
    let flags = cursor.read_u64::<LittleEndian>().map_err(io_to_codec)?;
    let measurement_uid = cursor.read_u32::<LittleEndian>().map_err(io_to_codec)?;
    let channels = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let matrix_x = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let matrix_y = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let matrix_z = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let data_type = ImageDataType::from_code(cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?)?;
    let image_index = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    let slice = cursor.read_u16::<LittleEndian>().map_err(io_to_codec)?;
    Ok(ImageHeader {
        flags,
        measurement_uid,
        channels,
        matrix_x,
        matrix_y,
        matrix_z,
        data_type,
        image_index,
        slice,
    })
}

/// Decode the attribute block + dense array given the declared
/// `attr_len_with_nul` and the already-known header.
pub fn decode_image_body(header: ImageHeader, attr_len_with_nul: u64, bytes: &[u8]) -> Result<Image> {
    if attr_len_with_nul == 0 {
        return Err(MrdError::Codec("image attribute length must include the trailing NUL".into()));
    }
    let attr_len_with_nul = attr_len_with_nul as usize;
    let mut cursor = Cursor::new(bytes);
    let mut attr_buf = vec![0u8; attr_len_with_nul];
    std::io::Read::read_exact(&mut cursor, &mut attr_buf).map_err(io_to_codec)?;
    attr_buf.pop(); // strip the trailing NUL included in the declared length
    let attributes = String::from_utf8(attr_buf).map_err(|e| MrdError::Codec(e.to_string()))?;

    let element_count = header.element_count();
    let data = match header.data_type {
        ImageDataType::Short => {
            let mut v = Vec::with_capacity(element_count);
            for _ in 0..element_count {
                v.push(cursor.read_i16::<LittleEndian>().map_err(io_to_codec)?);
            }
            ImageData::Short(v)
        }
        ImageDataType::Float => {
            let mut v = Vec::with_capacity(element_count);
            for _ in 0..element_count {
                v.push(cursor.read_f32::<LittleEndian>().map_err(io_to_codec)?);
            }
            ImageData::Float(v)
        }
        ImageDataType::Double => {
            let mut v = Vec::with_capacity(element_count);
            for _ in 0..element_count {
                v.push(cursor.read_f64::<LittleEndian>().map_err(io_to_codec)?);
            }
            ImageData::Double(v)
        }
        other => return Err(MrdError::Codec(format!("unsupported image data_type {other:?} on read"))),
    };

    Ok(Image { header, attributes, data })
}

pub fn decode_image(bytes: &[u8]) -> Result<Image> {
    if bytes.len() < IMAGE_HEADER_SIZE + LENGTH_SIZE {
        return Err(MrdError::Codec("image shorter than fixed header".into()));
    }
    let header_bytes: [u8; IMAGE_HEADER_SIZE] = bytes[..IMAGE_HEADER_SIZE].try_into().unwrap();
    let header = decode_image_header(&header_bytes)?;
    let len_bytes: [u8; LENGTH_SIZE] =
        bytes[IMAGE_HEADER_SIZE..IMAGE_HEADER_SIZE + LENGTH_SIZE].try_into().unwrap();
    let attr_len_with_nul = decode_length(len_bytes);
    decode_image_body(header, attr_len_with_nul, &bytes[IMAGE_HEADER_SIZE + LENGTH_SIZE..])
}

fn io_to_codec(e: std::io::Error) -> MrdError {
    MrdError::Codec(e.to_string())
}
