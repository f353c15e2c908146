use std::path::{Path, PathBuf};

use uuid::Uuid;

pub const SPILL_FILE_PREFIX: &str = "spill-";
pub const SPILL_FILE_SUFFIX: &str = ".bin";

/// Size of the write and read buffers, and of the memory a spiller keeps
/// reserved while it is open.
pub const BUFFER_SIZE: usize = 4096;

pub fn spill_file_name(id: Uuid) -> String {
    format!("{SPILL_FILE_PREFIX}{id}{SPILL_FILE_SUFFIX}")
}

pub fn new_spill_file_path(dir: &Path) -> PathBuf {
    dir.join(spill_file_name(Uuid::new_v4()))
}

/// Whether `name` looks like a file produced by [`spill_file_name`].
pub fn is_spill_file_name(name: &str) -> bool {
    name.len() > SPILL_FILE_PREFIX.len() + SPILL_FILE_SUFFIX.len()
        && name.starts_with(SPILL_FILE_PREFIX)
        && name.ends_with(SPILL_FILE_SUFFIX)
}
