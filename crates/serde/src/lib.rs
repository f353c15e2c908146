//! Columnar page serialization for spill files.
//!
//! Architecture role:
//! - flattens Arrow batches into positional column blocks
//! - wraps payloads with optional compression, encryption and checksum
//! - frames pages as length-prefixed records on disk
//!
//! Key modules:
//! - [`block`]
//! - [`compression`]
//! - [`cipher`]
//! - [`markers`]
//! - [`page`]
//! - [`serde`]

pub mod block;
pub mod cipher;
pub mod compression;
pub mod markers;
pub mod page;
pub mod serde;

pub use cipher::{AesSpillCipher, SpillCipher};
pub use markers::PageCodecMarkers;
pub use page::{
    read_page_header, read_serialized_page, write_serialized_page, PageHeader, SerializedPage,
    SerializedPageReader, PAGE_HEADER_LEN,
};
pub use serde::PagesSerde;
