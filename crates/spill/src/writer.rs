use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use spillway_common::{global_metrics, Result, SpillwayError};
use spillway_serde::{write_serialized_page, SerializedPage};
use tracing::warn;

use crate::layout::BUFFER_SIZE;

/// Owner of one spill file on disk. Dropping it deletes the file.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    metrics_label: &'static str,
    deleted: bool,
}

impl SpillFile {
    /// Create `path`, failing if it already exists.
    pub fn create(path: &Path, metrics_label: &'static str) -> Result<Self> {
        OpenOptions::new().write(true).create_new(true).open(path)?;
        global_metrics().inc_spill_files_open(metrics_label);
        Ok(Self {
            path: path.to_path_buf(),
            metrics_label,
            deleted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove the file now. A file that is already gone counts as deleted.
    pub fn delete(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        self.deleted = true;
        global_metrics().dec_spill_files_open(self.metrics_label);
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), error = %e, "failed to delete spill file");
        }
    }
}

/// Appends pages to an existing spill file through a `BUFFER_SIZE` buffer.
///
/// Either [`SpillWriter::finish`] makes every written page durable in the
/// file, or the file is cut back to the length it had when the writer was
/// opened.
#[derive(Debug)]
pub struct SpillWriter {
    out: BufWriter<File>,
    path: PathBuf,
    committed_len: u64,
    written: u64,
}

impl SpillWriter {
    pub fn open(path: &Path, committed_len: u64) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            out: BufWriter::with_capacity(BUFFER_SIZE, file),
            path: path.to_path_buf(),
            committed_len,
            written: 0,
        })
    }

    pub fn write_page(&mut self, page: &SerializedPage) -> Result<()> {
        let n = write_serialized_page(&mut self.out, page)?;
        self.written += n as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush buffered pages and return the new committed file length.
    pub fn finish(&mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.committed_len + self.written)
    }

    /// Drop buffered bytes and truncate the file to its committed length.
    ///
    /// On failure the file keeps an uncommitted tail and must not be appended
    /// to again.
    pub fn abort(self) -> Result<()> {
        let (file, _) = self.out.into_parts();
        file.set_len(self.committed_len).map_err(|e| {
            SpillwayError::Execution(format!(
                "failed to roll back spill file {} to {} bytes: {e}",
                self.path.display(),
                self.committed_len
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use spillway_serde::{PageCodecMarkers, SerializedPageReader};

    use super::*;

    fn temp_file(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("spillway_writer_{tag}_{nanos}.bin"))
    }

    fn page(fill: u8, len: usize) -> SerializedPage {
        SerializedPage {
            row_count: 1,
            markers: PageCodecMarkers::NONE,
            uncompressed_size: len as u32,
            checksum: 0,
            payload: vec![fill; len],
        }
    }

    #[test]
    fn finish_appends_and_abort_rolls_back() {
        let path = temp_file("rollback");
        let file = SpillFile::create(&path, "none").expect("create");

        let mut writer = SpillWriter::open(file.path(), 0).expect("open");
        writer.write_page(&page(1, 10)).expect("write");
        let committed = writer.finish().expect("finish");
        drop(writer);
        assert_eq!(committed, file.len().expect("len"));

        let mut writer = SpillWriter::open(file.path(), committed).expect("open");
        writer.write_page(&page(2, BUFFER_SIZE * 2)).expect("write");
        writer.write_page(&page(3, 5)).expect("write");
        writer.abort().expect("abort");
        assert_eq!(file.len().expect("len"), committed);

        let pages = SerializedPageReader::new(File::open(file.path()).expect("open"))
            .collect::<Result<Vec<_>>>()
            .expect("read");
        assert_eq!(pages, vec![page(1, 10)]);

        file.delete().expect("delete");
        assert!(!path.exists());
    }

    #[test]
    fn abort_reports_failed_rollback() {
        let path = temp_file("failed_rollback");
        let file = SpillFile::create(&path, "none").expect("create");
        let mut writer = SpillWriter::open(file.path(), u64::MAX).expect("open");
        writer.write_page(&page(4, 8)).expect("write");
        let err = writer.abort().expect_err("length out of range");
        assert!(matches!(err, SpillwayError::Execution(_)));
    }

    #[test]
    fn create_is_exclusive_and_drop_deletes() {
        let path = temp_file("exclusive");
        let file = SpillFile::create(&path, "none").expect("create");
        assert!(SpillFile::create(&path, "none").is_err());
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }
}
