//! Local-filesystem sink (spec §4.2).

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use crate::error::SinkError;
use crate::sink::{segment_stem, Sink};

#[cfg(unix)]
fn ensure_root(root: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(root)?;
    fs::set_permissions(root, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn ensure_root(root: &std::path::Path) -> std::io::Result<()> {
    fs::create_dir_all(root)
}

/// Writes one segment per `open()`/`close()` cycle to
/// `<root>/<dd_mm_yy_HH_MM>.<ext>`, appending raw bytes as they arrive.
pub struct FileSink {
    root: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root, file: None }
    }
}

impl Sink for FileSink {
    fn open(&mut self, ext: &str) -> Result<(), SinkError> {
        if self.file.is_some() {
            return Ok(());
        }
        ensure_root(&self.root)?;
        let path = self.root.join(format!("{}.{ext}", segment_stem()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        self.file = Some(file);
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.file.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let file = self.file.as_mut().ok_or(SinkError::NotFound(
            "write called on a closed file sink".to_string(),
        ))?;
        file.write_all(data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_bytes_to_a_new_segment_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("front-door"));
        sink.open("mp4").unwrap();
        assert!(sink.is_opened());
        sink.write(b"hello").unwrap();
        sink.write(b" world").unwrap();
        sink.close().unwrap();
        assert!(!sink.is_opened());

        let entries: Vec<_> = fs::read_dir(dir.path().join("front-door"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        let contents = fs::read(entries[0].path()).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("cam"));
        sink.open("mp4").unwrap();
        sink.write(b"a").unwrap();
        sink.open("mp4").unwrap();
        sink.write(b"b").unwrap();
        sink.close().unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path().join("cam"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1, "re-opening must not start a new segment");
    }

    #[test]
    fn close_without_open_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("cam"));
        sink.close().unwrap();
    }
}
