//! Spill directory selection and housekeeping.

use std::fmt::Debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use spillway_common::{Result, SpillwayError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::layout::is_spill_file_name;

/// Source of filesystem usage figures for a spill directory.
pub trait DiskUsage: Send + Sync + Debug {
    /// Fraction of the filesystem holding `path` that is in use, in `[0, 1]`.
    fn used_fraction(&self, path: &Path) -> io::Result<f64>;
}

/// [`DiskUsage`] backed by `statvfs(3)`. Other platforms report every
/// directory as empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDiskUsage;

impl DiskUsage for FsDiskUsage {
    #[cfg(unix)]
    fn used_fraction(&self, path: &Path) -> io::Result<f64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: statvfs only writes into the zeroed struct we pass it.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let fragment = stat.f_frsize as f64;
        let total = stat.f_blocks as f64 * fragment;
        if total <= 0.0 {
            return Ok(0.0);
        }
        let available = stat.f_bavail as f64 * fragment;
        Ok((1.0 - available / total).clamp(0.0, 1.0))
    }

    #[cfg(not(unix))]
    fn used_fraction(&self, _path: &Path) -> io::Result<f64> {
        Ok(0.0)
    }
}

/// Round-robin chooser over the configured spill roots.
///
/// A root is skipped while its filesystem is fuller than
/// `max_used_space_threshold`. The cursor advances once per attempt, so
/// concurrent callers spread over the roots.
#[derive(Debug)]
pub struct SpillPathSelector {
    paths: Vec<PathBuf>,
    max_used_space_threshold: f64,
    cursor: AtomicUsize,
    disk_usage: Arc<dyn DiskUsage>,
}

impl SpillPathSelector {
    pub fn new(paths: Vec<PathBuf>, max_used_space_threshold: f64) -> Self {
        Self {
            paths,
            max_used_space_threshold,
            cursor: AtomicUsize::new(0),
            disk_usage: Arc::new(FsDiskUsage),
        }
    }

    pub fn with_disk_usage(mut self, disk_usage: Arc<dyn DiskUsage>) -> Self {
        self.disk_usage = disk_usage;
        self
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Next root with enough free space.
    pub fn next_path(&self) -> Result<PathBuf> {
        for _ in 0..self.paths.len() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.paths.len();
            let path = &self.paths[idx];
            if self.has_enough_space(path) {
                return Ok(path.clone());
            }
        }
        Err(SpillwayError::ResourceExhausted(
            "no free space available for spill".to_string(),
        ))
    }

    fn has_enough_space(&self, path: &Path) -> bool {
        match self.disk_usage.used_fraction(path) {
            Ok(used) => {
                let usable = used <= self.max_used_space_threshold;
                if !usable {
                    debug!(
                        path = %path.display(),
                        used,
                        threshold = self.max_used_space_threshold,
                        "skipping full spill directory"
                    );
                }
                usable
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat spill directory");
                false
            }
        }
    }
}

/// Create `dir` if needed and make sure files can be created in it.
pub fn prepare_spill_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        SpillwayError::InvalidConfig(format!(
            "cannot create spill path {}: {e}",
            dir.display()
        ))
    })?;
    let check = dir.join(format!(".spillway-write-check-{}", Uuid::new_v4()));
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&check)
        .map_err(|e| {
            SpillwayError::InvalidConfig(format!(
                "spill path {} is not writable: {e}",
                dir.display()
            ))
        })?;
    fs::remove_file(&check)?;
    Ok(())
}

fn swept_roots() -> &'static Mutex<HashSet<PathBuf>> {
    static SWEPT: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    SWEPT.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Like [`cleanup_stale_spill_files`], but only the first call per root in
/// this process sweeps. Files found later belong to live spillers of this
/// process.
pub fn cleanup_stale_spill_files_once(dir: &Path) -> usize {
    let root = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let first = swept_roots()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(root);
    if !first {
        debug!(path = %dir.display(), "spill directory already swept by this process");
        return 0;
    }
    cleanup_stale_spill_files(dir)
}

/// Delete spill files left behind in `dir` by an earlier process. Returns
/// how many were removed.
pub fn cleanup_stale_spill_files(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "cannot list spill directory");
            return 0;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_spill_file_name(name) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!(path = %path.display(), "removed stale spill file");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale spill file"),
        }
    }
    removed
}
