//! Batch <-> page codec.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow_schema::SchemaRef;
use spillway_common::{CompressionCodec, Result, SpillwayError};

use crate::block::{read_columns, write_columns};
use crate::cipher::SpillCipher;
use crate::compression::{compress, decompress};
use crate::markers::PageCodecMarkers;
use crate::page::SerializedPage;

/// Encodes batches into [`SerializedPage`]s and back.
///
/// Encoding applies compression, then encryption, then the checksum, and
/// records each step in the page markers. Decoding looks only at the markers,
/// so a reader configured differently from the writer still decodes the page
/// as long as it holds the cipher for encrypted pages.
#[derive(Debug, Clone)]
pub struct PagesSerde {
    compression: CompressionCodec,
    cipher: Option<Arc<dyn SpillCipher>>,
    checksum: bool,
}

impl PagesSerde {
    pub fn new(
        compression: CompressionCodec,
        cipher: Option<Arc<dyn SpillCipher>>,
        checksum: bool,
    ) -> Self {
        Self {
            compression,
            cipher,
            checksum,
        }
    }

    pub fn compression(&self) -> CompressionCodec {
        self.compression
    }

    pub fn cipher(&self) -> Option<&Arc<dyn SpillCipher>> {
        self.cipher.as_ref()
    }

    /// Markers every page produced by this instance carries.
    pub fn markers(&self) -> PageCodecMarkers {
        let mut markers = PageCodecMarkers::NONE;
        if self.compression.is_compressing() {
            markers = markers | PageCodecMarkers::COMPRESSED;
        }
        if self.cipher.is_some() {
            markers = markers | PageCodecMarkers::ENCRYPTED;
        }
        if self.checksum {
            markers = markers | PageCodecMarkers::CHECKSUMMED;
        }
        markers
    }

    pub fn serialize(&self, batch: &RecordBatch) -> Result<SerializedPage> {
        let row_count = u32::try_from(batch.num_rows()).map_err(|_| {
            SpillwayError::Execution(format!("batch of {} rows is too large", batch.num_rows()))
        })?;

        let mut payload = Vec::new();
        write_columns(batch, &mut payload)?;
        let uncompressed_size = u32::try_from(payload.len()).map_err(|_| {
            SpillwayError::Execution(format!(
                "serialized batch of {} bytes is too large",
                payload.len()
            ))
        })?;

        if self.compression.is_compressing() {
            payload = compress(self.compression, &payload)?;
        }
        if let Some(cipher) = &self.cipher {
            payload = cipher.encrypt(&payload)?;
        }
        let checksum = if self.checksum {
            crc32fast::hash(&payload)
        } else {
            0
        };

        Ok(SerializedPage {
            row_count,
            markers: self.markers(),
            uncompressed_size,
            checksum,
            payload,
        })
    }

    pub fn deserialize(&self, schema: &SchemaRef, page: &SerializedPage) -> Result<RecordBatch> {
        let markers = page.markers;
        page.verify_checksum()?;

        let mut payload = std::borrow::Cow::Borrowed(page.payload.as_slice());
        if markers.is_encrypted() {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                SpillwayError::Execution("page is encrypted but no cipher is available".to_string())
            })?;
            payload = cipher.decrypt(&payload)?.into();
        }
        let expected = page.uncompressed_size as usize;
        if markers.is_compressed() {
            payload = decompress(&payload, expected)?.into();
        } else if payload.len() != expected {
            return Err(SpillwayError::Corruption(format!(
                "page payload is {} bytes, header declares {expected}",
                payload.len()
            )));
        }

        read_columns(schema, page.row_count as usize, payload.into_owned())
    }
}
