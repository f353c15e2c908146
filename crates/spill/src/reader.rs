use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use spillway_common::{global_metrics, Result, SpillerStats};
use spillway_serde::{PagesSerde, SerializedPageReader};

use crate::layout::BUFFER_SIZE;

/// Lazy iterator over the batches of one spill file, in write order.
///
/// Each `next` reads and decodes exactly one page. After the first error the
/// iterator is exhausted.
pub struct SpilledPages {
    pages: SerializedPageReader<BufReader<File>>,
    serde: PagesSerde,
    schema: SchemaRef,
    stats: Arc<SpillerStats>,
    done: bool,
}

impl SpilledPages {
    pub(crate) fn open(
        path: &Path,
        serde: PagesSerde,
        schema: SchemaRef,
        stats: Arc<SpillerStats>,
    ) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            pages: SerializedPageReader::new(BufReader::with_capacity(BUFFER_SIZE, file)),
            serde,
            schema,
            stats,
            done: false,
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }
}

impl Iterator for SpilledPages {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let decoded = match self.pages.next()? {
            Ok(page) => {
                let bytes = page.encoded_len() as u64;
                self.serde.deserialize(&self.schema, &page).map(|batch| {
                    self.stats.add_read(bytes);
                    global_metrics().record_spill_read(self.serde.compression().as_str(), bytes);
                    batch
                })
            }
            Err(e) => Err(e),
        };
        if decoded.is_err() {
            self.done = true;
        }
        Some(decoded)
    }
}

impl std::fmt::Debug for SpilledPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpilledPages")
            .field("schema", &self.schema)
            .field("done", &self.done)
            .finish()
    }
}
