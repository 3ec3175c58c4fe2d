//! Debug artefact dumper
//!
//! Optional, best-effort snapshotting of intermediate kernel buffers to disk,
//! gated by the `MRD_DEBUG_DIR` environment variable. Off by default;
//! failures are logged and swallowed, never propagated into the pipeline.

use std::path::PathBuf;

use log::warn;

pub struct DebugDumper {
    dir: PathBuf,
}

impl DebugDumper {
    /// Construct a dumper if `MRD_DEBUG_DIR` is set, otherwise `None`.
    pub fn from_env() -> Option<Self> {
        std::env::var_os("MRD_DEBUG_DIR").map(|dir| Self { dir: PathBuf::from(dir) })
    }

    /// Write `bytes` under `name` inside the debug directory. Creation races
    /// against other connections' workers are tolerated; any failure is
    /// logged, not returned, since this is diagnostic-only.
    pub fn dump(&self, name: &str, bytes: &[u8]) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                warn!("debug dump: failed to create {}: {e}", self.dir.display());
                return;
            }
        }
        let path = self.dir.join(name);
        if let Err(e) = std::fs::write(&path, bytes) {
            warn!("debug dump: failed to write {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_env_var_yields_no_dumper() {
        std::env::remove_var("MRD_DEBUG_DIR");
        assert!(DebugDumper::from_env().is_none());
    }

    #[test]
    fn dump_writes_bytes_under_the_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        // Safety (test-only): no other test in this process relies on
        // MRD_DEBUG_DIR, and `serial_test` isn't in the teacher's stack.
        std::env::set_var("MRD_DEBUG_DIR", dir.path());
        let dumper = DebugDumper::from_env().unwrap();
        dumper.dump("raw", b"hello");
        let contents = std::fs::read(dir.path().join("raw")).unwrap();
        assert_eq!(contents, b"hello");
        std::env::remove_var("MRD_DEBUG_DIR");
    }
}
