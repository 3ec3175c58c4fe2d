//! Reconstruction kernels
//!
//! K-FFT: a minimal Cartesian gridding reconstruction (sum-of-squares coil
//! combine after a centred 2-D inverse FFT) and an image-contrast-inversion
//! kernel. Tensors are flat `Vec`s with manual row-major stride indexing,
//! matching `buffer.rs`'s `MirrorBuffer` rather than reaching for `ndarray`.

use num_complex::Complex;
use rustfft::FftPlanner;

use crate::debug::DebugDumper;
use crate::wire::{Acquisition, Image, ImageData, ImageDataType, ImageHeader};

fn f64_to_le_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i16_to_le_bytes(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

type C64 = Complex<f64>;

const WINDOW_CENTER: &str = "16384";
const WINDOW_WIDTH: &str = "32768";

fn meta_xml(data_role: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?><ismrmrdMeta>\
<meta><name>DataRole</name><value>{data_role}</value></meta>\
<meta><name>ImageProcessingHistory</name><value>FIRE</value><value>PYTHON</value></meta>\
<meta><name>WindowCenter</name><value>{WINDOW_CENTER}</value></meta>\
<meta><name>WindowWidth</name><value>{WINDOW_WIDTH}</value></meta>\
</ismrmrdMeta>"
    )
}

/// Index into a row-major `[rows, cols]` flat buffer.
fn idx(row: usize, col: usize, cols: usize) -> usize {
    row * cols + col
}

fn ifftshift_2d(plane: &mut [C64], rows: usize, cols: usize) {
    shift_2d(plane, rows, cols, |n| n / 2)
}

fn fftshift_2d(plane: &mut [C64], rows: usize, cols: usize) {
    shift_2d(plane, rows, cols, |n| (n + 1) / 2)
}

fn shift_2d(plane: &mut [C64], rows: usize, cols: usize, split: impl Fn(usize) -> usize) {
    let out = plane.to_vec();
    let row_split = split(rows);
    let col_split = split(cols);
    for r in 0..rows {
        let src_r = (r + row_split) % rows;
        for c in 0..cols {
            let src_c = (c + col_split) % cols;
            plane[idx(r, c, cols)] = out[idx(src_r, src_c, cols)];
        }
    }
}

/// In-place 2-D inverse FFT of a `rows x cols` plane, normalised by `1 /
/// (rows * cols)` so magnitudes stay comparable across group sizes.
fn ifft_2d(plane: &mut [C64], rows: usize, cols: usize) {
    let mut planner = FftPlanner::new();
    let row_ifft = planner.plan_fft_inverse(cols);
    let mut row_buf = vec![C64::new(0.0, 0.0); cols];
    for r in 0..rows {
        row_buf.copy_from_slice(&plane[idx(r, 0, cols)..idx(r, 0, cols) + cols]);
        row_ifft.process(&mut row_buf);
        plane[idx(r, 0, cols)..idx(r, 0, cols) + cols].copy_from_slice(&row_buf);
    }

    let col_ifft = planner.plan_fft_inverse(rows);
    let mut col_buf = vec![C64::new(0.0, 0.0); rows];
    for c in 0..cols {
        for r in 0..rows {
            col_buf[r] = plane[idx(r, c, cols)];
        }
        col_ifft.process(&mut col_buf);
        for r in 0..rows {
            plane[idx(r, c, cols)] = col_buf[r];
        }
    }

    let norm = 1.0 / (rows * cols) as f64;
    for v in plane.iter_mut() {
        *v *= norm;
    }
}

/// Scale a real-valued image to signed-16-bit range. `max == 0` yields a
/// zero image of the same shape rather than dividing by zero.
fn scale_to_i16(values: &[f64]) -> Vec<i16> {
    let max = values.iter().cloned().fold(0.0_f64, f64::max);
    if max == 0.0 {
        return vec![0i16; values.len()];
    }
    let scale = 32767.0 / max;
    values.iter().map(|v| (v * scale).round() as i16).collect()
}

fn invert_i16(values: &[i16]) -> Vec<i16> {
    values.iter().map(|&v| (32767i32 - v as i32).unsigned_abs() as i16).collect()
}

/// Run the K-FFT kernel over a slice group. Returns `None` for an empty
/// group (nothing to reconstruct).
pub fn k_fft(group: &[Acquisition], invert_contrast: bool) -> Option<Image> {
    if group.is_empty() {
        return None;
    }
    let dumper = DebugDumper::from_env();

    let mut sorted: Vec<&Acquisition> = group.iter().collect();
    sorted.sort_by_key(|a| a.header.kspace_encode_step_1);

    let channels = sorted[0].header.active_channels as usize;
    let readout = sorted[0].header.number_of_samples as usize;
    let lines = sorted.len();

    // Tensor shape [C, R, N] flattened as channel-major planes of R x N.
    let plane_size = readout * lines;
    let mut tensor = vec![C64::new(0.0, 0.0); channels * plane_size];
    for (n, acq) in sorted.iter().enumerate() {
        for c in 0..channels {
            for r in 0..readout {
                let sample = acq.data.get(c * readout + r).copied().unwrap_or_default();
                tensor[c * plane_size + idx(r, n, lines)] = C64::new(sample.re as f64, sample.im as f64);
            }
        }
    }

    for c in 0..channels {
        let plane = &mut tensor[c * plane_size..(c + 1) * plane_size];
        ifftshift_2d(plane, readout, lines);
        ifft_2d(plane, readout, lines);
        fftshift_2d(plane, readout, lines);
    }

    // Sum-of-squares coil combination.
    let mut combined = vec![0.0_f64; plane_size];
    for c in 0..channels {
        let plane = &tensor[c * plane_size..(c + 1) * plane_size];
        for (i, v) in plane.iter().enumerate() {
            combined[i] += v.norm_sqr();
        }
    }
    for v in combined.iter_mut() {
        *v = v.sqrt();
    }
    if let Some(d) = &dumper {
        d.dump("raw", &f64_to_le_bytes(&combined));
    }

    let mut scaled = scale_to_i16(&combined);
    if invert_contrast {
        scaled = invert_i16(&scaled);
    }

    // Crop oversampling: keep readout rows [R/4, 3R/4).
    let lo = readout / 4;
    let hi = 3 * readout / 4;
    let cropped_rows = hi - lo;
    let mut cropped = Vec::with_capacity(cropped_rows * lines);
    for r in lo..hi {
        cropped.extend_from_slice(&scaled[idx(r, 0, lines)..idx(r, 0, lines) + lines]);
    }
    if let Some(d) = &dumper {
        d.dump("imgCrop", &i16_to_le_bytes(&cropped));
    }

    let header = &sorted[0].header;
    let image_header = ImageHeader {
        flags: 0,
        measurement_uid: header.measurement_uid,
        channels: 1,
        matrix_x: cropped_rows as u16,
        matrix_y: lines as u16,
        matrix_z: 1,
        data_type: ImageDataType::Short,
        image_index: 1,
        slice: header.slice,
    };

    Some(Image {
        header: image_header,
        attributes: meta_xml("Image"),
        data: ImageData::Short(cropped),
    })
}

/// Image-contrast-inversion kernel: rescale to int16, invert, transpose.
pub fn invert_image(image: &Image) -> Image {
    let dumper = DebugDumper::from_env();
    let (rows, cols) = (image.header.matrix_x as usize, image.header.matrix_y as usize);
    let values: Vec<f64> = match &image.data {
        ImageData::Short(v) => v.iter().map(|&x| x as f64).collect(),
        ImageData::Float(v) => v.iter().map(|&x| x as f64).collect(),
        ImageData::Double(v) => v.clone(),
    };

    let scaled = scale_to_i16(&values);
    let inverted = invert_i16(&scaled);
    if let Some(d) = &dumper {
        d.dump("imgInverted", &i16_to_le_bytes(&inverted));
    }

    let mut transposed = vec![0i16; inverted.len()];
    for r in 0..rows {
        for c in 0..cols {
            transposed[idx(c, r, rows)] = inverted[idx(r, c, cols)];
        }
    }

    let mut header = image.header.clone();
    header.matrix_x = cols as u16;
    header.matrix_y = rows as u16;
    header.data_type = ImageDataType::Short;

    Image {
        header,
        attributes: meta_xml("Image"),
        data: ImageData::Short(transposed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{AcquisitionHeader, Complex32};

    fn acq(step: u16, channels: u16, samples: u16, value: f32) -> Acquisition {
        let data = vec![Complex32::new(value, 0.0); channels as usize * samples as usize];
        Acquisition {
            header: AcquisitionHeader {
                flags: 0,
                measurement_uid: 7,
                scan_counter: step as u32,
                active_channels: channels,
                trajectory_dimensions: 0,
                number_of_samples: samples,
                kspace_encode_step_1: step,
                kspace_encode_step_2: 0,
                slice: 2,
            },
            trajectory: vec![],
            data,
        }
    }

    #[test]
    fn empty_group_yields_no_image() {
        assert!(k_fft(&[], false).is_none());
    }

    #[test]
    fn k_fft_produces_cropped_image_of_expected_shape() {
        let group: Vec<Acquisition> = (0..8).map(|i| acq(i, 2, 16, 1.0)).collect();
        let image = k_fft(&group, false).unwrap();
        assert_eq!(image.header.matrix_y, 8);
        assert_eq!(image.header.matrix_x, 8); // 16/4..3*16/4 = 8 rows
        assert_eq!(image.header.channels, 1);
        assert_eq!(image.data.len(), 8 * 8);
    }

    #[test]
    fn zero_signal_group_yields_zero_image_without_panicking() {
        let group: Vec<Acquisition> = (0..4).map(|i| acq(i, 1, 8, 0.0)).collect();
        let image = k_fft(&group, false).unwrap();
        if let ImageData::Short(values) = &image.data {
            assert!(values.iter().all(|&v| v == 0));
        } else {
            panic!("expected Short image data");
        }
    }

    #[test]
    fn invert_contrast_flips_scaled_intensity() {
        let group: Vec<Acquisition> = (0..4).map(|i| acq(i, 1, 8, 1.0)).collect();
        let plain = k_fft(&group, false).unwrap();
        let inverted = k_fft(&group, true).unwrap();
        let (ImageData::Short(a), ImageData::Short(b)) = (&plain.data, &inverted.data) else {
            panic!("expected Short image data");
        };
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(*y, (32767i32 - *x as i32).unsigned_abs() as i16);
        }
    }

    #[test]
    fn invert_image_transposes_matrix_dimensions() {
        let header = ImageHeader {
            flags: 0,
            measurement_uid: 1,
            channels: 1,
            matrix_x: 2,
            matrix_y: 3,
            matrix_z: 1,
            data_type: ImageDataType::Short,
            image_index: 1,
            slice: 0,
        };
        let image = Image {
            header,
            attributes: String::new(),
            data: ImageData::Short(vec![1, 2, 3, 4, 5, 6]),
        };
        let inverted = invert_image(&image);
        assert_eq!(inverted.header.matrix_x, 3);
        assert_eq!(inverted.header.matrix_y, 2);
    }
}
