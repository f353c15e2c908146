//! Single-stream spiller backed by one append-only file.
//!
//! Lifecycle:
//! - construction reserves `BUFFER_SIZE` bytes of memory; no file exists yet
//! - each `spill` call appends its batches on the executor, creating the file
//!   on first use
//! - `spilled_pages` switches the spiller to reading; writes are refused from
//!   then on
//! - `close` (or drop) deletes the file and returns every reservation

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::future::BoxFuture;
use futures::FutureExt;
use spillway_common::{
    global_metrics, LocalMemoryContext, Result, SpillerId, SpillerStats, SpillwayError,
};
use spillway_serde::block::check_supported;
use spillway_serde::PagesSerde;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::context::{LocalSpillContext, SpillContext};
use crate::executor::{SpillExecutor, SpillFuture, SpillHandle};
use crate::layout::BUFFER_SIZE;
use crate::reader::SpilledPages;
use crate::writer::{SpillFile, SpillWriter};

/// Spiller for one stream of batches sharing a schema.
pub trait SingleStreamSpiller: Send + Sync + fmt::Debug {
    /// Append one batch. See [`SingleStreamSpiller::spill_batches`].
    fn spill(&self, batch: RecordBatch) -> Result<SpillHandle> {
        self.spill_batches(vec![batch])
    }

    /// Append `batches` in order as one contiguous write. Fails immediately
    /// if another spill is still running. The handle resolves once the bytes
    /// are in the file.
    fn spill_batches(&self, batches: Vec<RecordBatch>) -> Result<SpillHandle>;

    /// Lazily read back every spilled batch from the start of the file.
    fn spilled_pages(&self) -> Result<SpilledPages>;

    /// Read back every spilled batch on the executor.
    fn all_spilled_pages(&self) -> Result<SpillFuture<Vec<RecordBatch>>>;

    fn memory_reserved(&self) -> usize;

    /// Serialized bytes currently held in the spill file.
    fn spilled_bytes(&self) -> u64;

    fn spill_file_path(&self) -> &Path;

    /// Wait for any running spill, then delete the file and release memory
    /// and spill space. Calling it again is a no-op.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Writable,
    Reading,
    Closed,
}

#[derive(Debug, Default)]
struct WriteState {
    file: Option<SpillFile>,
    committed_len: u64,
    pages: u64,
    successful_spills: u64,
    poisoned: bool,
}

pub struct FileSingleStreamSpiller {
    id: SpillerId,
    schema: SchemaRef,
    path: PathBuf,
    serde: PagesSerde,
    executor: SpillExecutor,
    stats: Arc<SpillerStats>,
    spill_context: Arc<LocalSpillContext>,
    memory: Mutex<LocalMemoryContext>,
    write_state: Arc<tokio::sync::Mutex<WriteState>>,
    phase: Mutex<Phase>,
}

impl FileSingleStreamSpiller {
    pub fn try_new(
        schema: SchemaRef,
        path: PathBuf,
        serde: PagesSerde,
        executor: SpillExecutor,
        stats: Arc<SpillerStats>,
        spill_context: Arc<dyn SpillContext>,
        mut memory: LocalMemoryContext,
    ) -> Result<Self> {
        if schema.fields().is_empty() {
            return Err(SpillwayError::InvalidConfig(
                "spiller needs at least one column type".to_string(),
            ));
        }
        for field in schema.fields() {
            check_supported(field.data_type())?;
        }
        memory.set_bytes(BUFFER_SIZE)?;

        Ok(Self {
            id: SpillerId::next(),
            schema,
            path,
            serde,
            executor,
            stats,
            spill_context: LocalSpillContext::new(spill_context),
            memory: Mutex::new(memory),
            write_state: Arc::new(tokio::sync::Mutex::new(WriteState::default())),
            phase: Mutex::new(Phase::Writable),
        })
    }

    pub fn id(&self) -> SpillerId {
        self.id
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn memory(&self) -> MutexGuard<'_, LocalMemoryContext> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_batch(&self, batch: &RecordBatch) -> Result<()> {
        let expected = self.schema.fields();
        let actual = batch.schema();
        let matches = actual.fields().len() == expected.len()
            && actual
                .fields()
                .iter()
                .zip(expected.iter())
                .all(|(a, e)| a.data_type() == e.data_type());
        if !matches {
            let types = |fields: &arrow_schema::Fields| {
                fields
                    .iter()
                    .map(|f| f.data_type().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            return Err(SpillwayError::Execution(format!(
                "batch types [{}] do not match spiller types [{}]",
                types(actual.fields()),
                types(expected)
            )));
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.memory().close();
        let reverted = self.spill_context.close();
        if let Some(cipher) = self.serde.cipher() {
            cipher.destroy();
        }
        reverted
    }
}

impl SingleStreamSpiller for FileSingleStreamSpiller {
    fn spill_batches(&self, batches: Vec<RecordBatch>) -> Result<SpillHandle> {
        let phase = self.phase();
        match *phase {
            Phase::Writable => {}
            Phase::Reading => {
                return Err(SpillwayError::Execution(
                    "cannot spill after spilled pages were read".to_string(),
                ));
            }
            Phase::Closed => {
                return Err(SpillwayError::Execution("spiller is closed".to_string()));
            }
        }
        for batch in &batches {
            self.check_batch(batch)?;
        }
        self.memory().set_bytes(BUFFER_SIZE)?;

        let state = Arc::clone(&self.write_state)
            .try_lock_owned()
            .map_err(|_| SpillwayError::Execution("spill already in progress".to_string()))?;
        if state.poisoned {
            return Err(SpillwayError::Execution(format!(
                "spiller {} is unusable after a failed spill file create or rollback",
                self.id
            )));
        }
        drop(phase);

        let job = SpillJob {
            id: self.id,
            path: self.path.clone(),
            serde: self.serde.clone(),
            spill_context: Arc::clone(&self.spill_context),
            stats: Arc::clone(&self.stats),
        };
        Ok(self.executor.spawn(move || job.run(state, batches)))
    }

    fn spilled_pages(&self) -> Result<SpilledPages> {
        let mut phase = self.phase();
        if *phase == Phase::Closed {
            return Err(SpillwayError::Execution("spiller is closed".to_string()));
        }
        let state = self
            .write_state
            .try_lock()
            .map_err(|_| SpillwayError::Execution("spill still in progress".to_string()))?;
        if state.successful_spills == 0 {
            return Err(SpillwayError::Execution(
                "nothing has been spilled yet".to_string(),
            ));
        }

        self.memory().set_bytes(BUFFER_SIZE)?;
        let pages = SpilledPages::open(
            &self.path,
            self.serde.clone(),
            Arc::clone(&self.schema),
            Arc::clone(&self.stats),
        )?;
        *phase = Phase::Reading;
        debug!(
            spiller_id = %self.id,
            path = %self.path.display(),
            pages = state.pages,
            bytes = state.committed_len,
            "reading spilled pages"
        );
        Ok(pages)
    }

    fn all_spilled_pages(&self) -> Result<SpillFuture<Vec<RecordBatch>>> {
        let pages = self.spilled_pages()?;
        Ok(self
            .executor
            .spawn(move || pages.collect::<Result<Vec<_>>>()))
    }

    fn memory_reserved(&self) -> usize {
        self.memory().bytes()
    }

    fn spilled_bytes(&self) -> u64 {
        self.spill_context.spilled_bytes()
    }

    fn spill_file_path(&self) -> &Path {
        &self.path
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            {
                let mut phase = self.phase();
                if *phase == Phase::Closed {
                    return Ok(());
                }
                *phase = Phase::Closed;
            }
            let file = self.write_state.lock().await.file.take();
            let released = self.release();
            if let Some(file) = file {
                file.delete()?;
            }
            debug!(spiller_id = %self.id, path = %self.path.display(), "closed spiller");
            released
        }
        .boxed()
    }
}

impl Drop for FileSingleStreamSpiller {
    fn drop(&mut self) {
        let phase = self.phase.get_mut().unwrap_or_else(PoisonError::into_inner);
        if std::mem::replace(phase, Phase::Closed) == Phase::Closed {
            return;
        }
        // A running write keeps the state alive; its file goes when the job
        // drops the last reference.
        if let Ok(mut state) = self.write_state.try_lock() {
            state.file.take();
        }
        self.memory().close();
        if let Err(e) = self.spill_context.close() {
            warn!(spiller_id = %self.id, error = %e, "failed to revert spill bytes");
        }
    }
}

impl fmt::Debug for FileSingleStreamSpiller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSingleStreamSpiller")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("compression", &self.serde.compression())
            .field("encrypted", &self.serde.cipher().is_some())
            .field("phase", &*self.phase())
            .finish()
    }
}

struct SpillJob {
    id: SpillerId,
    path: PathBuf,
    serde: PagesSerde,
    spill_context: Arc<LocalSpillContext>,
    stats: Arc<SpillerStats>,
}

impl SpillJob {
    fn run(self, mut state: OwnedMutexGuard<WriteState>, batches: Vec<RecordBatch>) -> Result<()> {
        let started = Instant::now();
        let codec = self.serde.compression().as_str();
        if state.file.is_none() {
            match SpillFile::create(&self.path, codec) {
                Ok(file) => state.file = Some(file),
                Err(e) => {
                    state.poisoned = true;
                    return Err(SpillwayError::Execution(format!(
                        "failed to create spill file {}: {e}",
                        self.path.display()
                    )));
                }
            }
        }

        let mut writer = SpillWriter::open(&self.path, state.committed_len)?;
        let mut charged = 0i64;
        let written = self
            .write_batches(&mut writer, &batches, &mut charged)
            .and_then(|pages| Ok((pages, writer.finish()?)));
        let (pages, committed_len) = match written {
            Ok(done) => done,
            Err(e) => {
                if let Err(rollback) = writer.abort() {
                    state.poisoned = true;
                    warn!(spiller_id = %self.id, error = %rollback, "spiller poisoned");
                }
                self.uncharge(charged);
                return Err(e);
            }
        };
        let bytes = committed_len - state.committed_len;
        state.committed_len = committed_len;
        state.pages += pages;
        state.successful_spills += 1;

        let elapsed = started.elapsed();
        self.stats.add_spilled(bytes, pages, elapsed);
        global_metrics().record_spill(codec, bytes, pages, elapsed.as_secs_f64());
        debug!(
            spiller_id = %self.id,
            path = %self.path.display(),
            pages,
            bytes,
            file_bytes = state.committed_len,
            elapsed_ms = elapsed.as_millis() as u64,
            "spilled batches"
        );
        Ok(())
    }

    fn write_batches(
        &self,
        writer: &mut SpillWriter,
        batches: &[RecordBatch],
        charged: &mut i64,
    ) -> Result<u64> {
        let mut pages = 0;
        for batch in batches {
            let page = self.serde.serialize(batch)?;
            let size = page.encoded_len() as i64;
            self.spill_context.update_bytes(size)?;
            *charged += size;
            writer.write_page(&page)?;
            pages += 1;
        }
        Ok(pages)
    }

    fn uncharge(&self, charged: i64) {
        // A closed context already returned everything it held.
        if charged == 0 || self.spill_context.is_closed() {
            return;
        }
        if let Err(e) = self.spill_context.update_bytes(-charged) {
            warn!(
                spiller_id = %self.id,
                error = %e,
                "failed to revert spill bytes after a failed spill"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use arrow::array::{Int32Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use spillway_common::{AggregatedMemoryContext, CompressionCodec, QueryId};

    use super::*;
    use crate::context::{QuerySpillContext, SpillSpaceTracker};
    use crate::layout::new_spill_file_path;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("spillway_spiller_{tag}_{nanos}"));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    fn batch(ids: Vec<i32>) -> RecordBatch {
        let names = ids.iter().map(|i| Some(format!("row-{i}"))).collect::<Vec<_>>();
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int32Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .expect("batch")
    }

    fn spiller_at(
        path: PathBuf,
        executor: SpillExecutor,
        spill_context: Arc<dyn SpillContext>,
    ) -> FileSingleStreamSpiller {
        spiller_with_codec(path, executor, spill_context, CompressionCodec::Lz4)
    }

    fn spiller_with_codec(
        path: PathBuf,
        executor: SpillExecutor,
        spill_context: Arc<dyn SpillContext>,
        codec: CompressionCodec,
    ) -> FileSingleStreamSpiller {
        let memory = AggregatedMemoryContext::new_simple().new_local("spiller");
        FileSingleStreamSpiller::try_new(
            schema(),
            path,
            PagesSerde::new(codec, None, true),
            executor,
            SpillerStats::new(),
            spill_context,
            memory,
        )
        .expect("spiller")
    }

    fn unlimited() -> Arc<dyn SpillContext> {
        SpillSpaceTracker::new(u64::MAX)
    }

    async fn wait_for_busy_executor(executor: &SpillExecutor) {
        while executor.available_slots() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_spill_while_writing_is_rejected() {
        let dir = temp_dir("busy");
        let executor = SpillExecutor::current(1).expect("executor");
        let spiller = spiller_at(new_spill_file_path(&dir), executor.clone(), unlimited());

        let (release, blocked) = std::sync::mpsc::channel::<()>();
        let blocker = executor.spawn(move || {
            let _ = blocked.recv();
            Ok(())
        });
        wait_for_busy_executor(&executor).await;

        let first = spiller.spill(batch(vec![1, 2])).expect("first spill");
        let err = spiller.spill(batch(vec![3])).expect_err("second spill");
        assert!(err.to_string().contains("spill already in progress"));
        assert!(spiller.spilled_pages().is_err());

        release.send(()).expect("release");
        blocker.await.expect("blocker");
        first.await.expect("first write");

        spiller.spill(batch(vec![3])).expect("third").await.expect("write");
        let rows = spiller
            .all_spilled_pages()
            .expect("read")
            .await
            .expect("batches")
            .iter()
            .map(|b| b.num_rows())
            .collect::<Vec<_>>();
        assert_eq!(rows, vec![2, 1]);
        spiller.close().await.expect("close");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_waits_for_running_write() {
        let dir = temp_dir("close_wait");
        let executor = SpillExecutor::current(1).expect("executor");
        let spiller = spiller_at(new_spill_file_path(&dir), executor.clone(), unlimited());

        let (release, blocked) = std::sync::mpsc::channel::<()>();
        let _blocker = executor.spawn(move || {
            let _ = blocked.recv();
            Ok(())
        });
        wait_for_busy_executor(&executor).await;
        let write = spiller.spill(batch(vec![1])).expect("spill");

        let mut closing = spiller.close();
        let pending = tokio::time::timeout(Duration::from_millis(20), &mut closing).await;
        assert!(pending.is_err(), "close must wait for the running write");
        assert!(spiller.spill(batch(vec![2])).is_err());

        release.send(()).expect("release");
        closing.await.expect("close");
        write.await.expect("write");
        assert!(!spiller.spill_file_path().exists());
        assert_eq!(spiller.memory_reserved(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_to_create_file_poisons_spiller() {
        let dir = temp_dir("poison");
        let path = dir.join("missing").join("spill-x.bin");
        let spiller = spiller_at(path, SpillExecutor::current(1).expect("executor"), unlimited());

        let err = spiller
            .spill(batch(vec![1]))
            .expect("submit")
            .await
            .expect_err("create fails");
        assert!(matches!(err, SpillwayError::Execution(_)));
        assert!(spiller.spill(batch(vec![2])).is_err());
        spiller.close().await.expect("close");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spill_limit_rolls_back_partial_write() {
        let dir = temp_dir("limit");
        // Pages larger than BUFFER_SIZE reach the file before the limit trips.
        let big = batch((0..1_000).collect());
        let page_size = PagesSerde::new(CompressionCodec::None, None, true)
            .serialize(&big)
            .expect("page")
            .encoded_len() as u64;
        assert!(page_size > BUFFER_SIZE as u64);

        let tracker = SpillSpaceTracker::new(u64::MAX);
        let query = QuerySpillContext::new(
            QueryId("limited".to_string()),
            Some(page_size * 2 + page_size / 2),
            Some(Arc::clone(&tracker)),
        );
        let spiller = spiller_with_codec(
            new_spill_file_path(&dir),
            SpillExecutor::current(2).expect("executor"),
            query.clone(),
            CompressionCodec::None,
        );

        spiller
            .spill(big.clone())
            .expect("submit")
            .await
            .expect("first fits");
        let committed = std::fs::metadata(spiller.spill_file_path())
            .expect("metadata")
            .len();
        assert_eq!(committed, page_size);

        let err = spiller
            .spill_batches(vec![big.clone(), big.clone()])
            .expect("submit")
            .await
            .expect_err("limit hit");
        assert!(matches!(err, SpillwayError::ResourceExhausted(_)));
        assert_eq!(
            std::fs::metadata(spiller.spill_file_path())
                .expect("metadata")
                .len(),
            committed
        );
        assert_eq!(spiller.spilled_bytes(), page_size);
        assert_eq!(query.spilled_bytes(), page_size);

        let batches = spiller
            .spilled_pages()
            .expect("pages")
            .collect::<Result<Vec<_>>>()
            .expect("decode");
        assert_eq!(batches, vec![big]);

        spiller.close().await.expect("close");
        assert_eq!(query.spilled_bytes(), 0);
        assert_eq!(tracker.current_bytes(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_batch_types_are_rejected() {
        let dir = temp_dir("types");
        let spiller = spiller_at(
            new_spill_file_path(&dir),
            SpillExecutor::current(1).expect("executor"),
            unlimited(),
        );
        let other = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)])),
            vec![Arc::new(arrow::array::Int64Array::from(vec![1_i64]))],
        )
        .expect("batch");
        assert!(matches!(
            spiller.spill(other),
            Err(SpillwayError::Execution(_))
        ));
        spiller.close().await.expect("close");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drop_without_close_cleans_up() {
        let dir = temp_dir("drop");
        let root = AggregatedMemoryContext::new_simple();
        let tracker = SpillSpaceTracker::new(u64::MAX);
        let spiller = FileSingleStreamSpiller::try_new(
            schema(),
            new_spill_file_path(&dir),
            PagesSerde::new(CompressionCodec::None, None, false),
            SpillExecutor::current(1).expect("executor"),
            SpillerStats::new(),
            tracker.clone(),
            root.new_local("spiller"),
        )
        .expect("spiller");
        spiller.spill(batch(vec![1])).expect("spill").await.expect("write");
        let path = spiller.spill_file_path().to_path_buf();
        assert!(path.exists());
        assert!(tracker.current_bytes() > 0);

        drop(spiller);
        assert!(!path.exists());
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(tracker.current_bytes(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_spiller_mid_write_returns_spill_space() {
        let dir = temp_dir("drop_mid_write");
        let executor = SpillExecutor::current(1).expect("executor");
        let tracker = SpillSpaceTracker::new(u64::MAX);
        let spiller = spiller_at(new_spill_file_path(&dir), executor.clone(), tracker.clone());
        let path = spiller.spill_file_path().to_path_buf();

        let (release, blocked) = std::sync::mpsc::channel::<()>();
        let blocker = executor.spawn(move || {
            let _ = blocked.recv();
            Ok(())
        });
        wait_for_busy_executor(&executor).await;

        let pending = spiller
            .spill_batches((0..8).map(|i| batch(vec![i, i + 1])).collect())
            .expect("submit");
        drop(spiller);
        release.send(()).expect("release");
        blocker.await.expect("blocker");
        assert!(pending.await.is_err());

        assert_eq!(tracker.current_bytes(), 0);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[derive(Debug, Default)]
    struct RefuseAfterFirst(std::sync::atomic::AtomicBool);

    impl SpillContext for RefuseAfterFirst {
        fn update_bytes(&self, delta: i64) -> Result<()> {
            if delta > 0 && self.0.swap(true, std::sync::atomic::Ordering::AcqRel) {
                return Err(SpillwayError::ResourceExhausted("refused".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_rollback_poisons_spiller() {
        let dir = temp_dir("failed_rollback");
        let spiller = spiller_at(
            new_spill_file_path(&dir),
            SpillExecutor::current(1).expect("executor"),
            Arc::new(RefuseAfterFirst::default()),
        );
        spiller.spill(batch(vec![1])).expect("submit").await.expect("first");
        // A length the file cannot be truncated to.
        spiller.write_state.lock().await.committed_len = u64::MAX;

        let err = spiller
            .spill(batch(vec![2]))
            .expect("submit")
            .await
            .expect_err("refused");
        assert!(matches!(err, SpillwayError::ResourceExhausted(_)));
        let err = spiller.spill(batch(vec![3])).expect_err("poisoned");
        assert!(err.to_string().contains("unusable"));
        spiller.close().await.expect("close");
        let _ = std::fs::remove_dir_all(dir);
    }
}
