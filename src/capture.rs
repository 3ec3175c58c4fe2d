//! Capture sink
//!
//! An opaque collaborator that persists received envelopes for audit and
//! replay. Writes are ordered (receive order) and best-effort: a capture
//! failure is logged but does not fail the session unless the sink declares
//! itself fatal via [`CaptureSink::is_fatal`].

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::wire::{self, Envelope};

pub trait CaptureSink: Send {
    fn capture(&mut self, envelope: &Envelope) -> Result<()>;

    /// Whether a capture failure should terminate the session. Defaults to
    /// false: capture is diagnostic, not part of the protocol contract.
    fn is_fatal(&self) -> bool {
        false
    }
}

/// Appends received envelopes, as raw framed bytes, to a single file under
/// `folder`. Mirrors the original server's fixed dataset name `"dataset"`.
pub struct FileCaptureSink {
    file: File,
}

impl FileCaptureSink {
    pub const DATASET_NAME: &'static str = "dataset";

    pub fn create(folder: &Path) -> Result<Self> {
        std::fs::create_dir_all(folder).or_else(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        let path: PathBuf = folder.join(Self::DATASET_NAME);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl CaptureSink for FileCaptureSink {
    fn capture(&mut self, envelope: &Envelope) -> Result<()> {
        let bytes = match envelope {
            Envelope::ParameterScript(xml) => wire::encode_text_block(xml),
            Envelope::Acquisition(acq) => wire::encode_acquisition(acq),
            Envelope::Waveform(wf) => wire::encode_waveform(wf),
            Envelope::Image(img) => wire::encode_image(img),
            _ => return Ok(()),
        };
        self.file.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Acquisition, AcquisitionHeader, Complex32};

    #[test]
    fn capture_appends_acquisitions_to_dataset_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileCaptureSink::create(dir.path()).unwrap();

        let acq = Acquisition {
            header: AcquisitionHeader {
                flags: 0,
                measurement_uid: 1,
                scan_counter: 1,
                active_channels: 1,
                trajectory_dimensions: 0,
                number_of_samples: 1,
                kspace_encode_step_1: 0,
                kspace_encode_step_2: 0,
                slice: 0,
            },
            trajectory: vec![],
            data: vec![Complex32::new(1.0, 0.0)],
        };
        sink.capture(&Envelope::Acquisition(acq)).unwrap();

        let contents = std::fs::read(dir.path().join(FileCaptureSink::DATASET_NAME)).unwrap();
        assert!(!contents.is_empty());
    }

    #[test]
    fn directory_already_existing_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileCaptureSink::create(dir.path()).is_ok());
        assert!(FileCaptureSink::create(dir.path()).is_ok());
    }
}
