use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use spillway_common::{LocalMemoryContext, QueryId, Result, SpillConfig, SpillerStats};
use spillway_serde::{AesSpillCipher, PagesSerde, SpillCipher};
use tracing::{debug, info};

use crate::context::{QuerySpillContext, SpillContext, SpillSpaceTracker};
use crate::executor::SpillExecutor;
use crate::layout::new_spill_file_path;
use crate::paths::{
    cleanup_stale_spill_files_once, prepare_spill_dir, DiskUsage, SpillPathSelector,
};
use crate::spiller::{FileSingleStreamSpiller, SingleStreamSpiller};

/// Creates spillers that share directories, executor and stats.
pub trait SingleStreamSpillerFactory: Send + Sync + Debug {
    /// Create a spiller charging its file bytes to `spill_context`.
    ///
    /// The node-wide limit only applies if `spill_context` forwards to the
    /// factory's space tracker, as contexts from
    /// [`FileSingleStreamSpillerFactory::query_spill_context`] do.
    fn create(
        &self,
        schema: SchemaRef,
        spill_context: Arc<dyn SpillContext>,
        memory_context: LocalMemoryContext,
    ) -> Result<Box<dyn SingleStreamSpiller>>;
}

#[derive(Debug)]
pub struct FileSingleStreamSpillerFactory {
    config: SpillConfig,
    executor: SpillExecutor,
    stats: Arc<SpillerStats>,
    paths: SpillPathSelector,
    space_tracker: Arc<SpillSpaceTracker>,
}

impl FileSingleStreamSpillerFactory {
    /// Validate `config`, prepare every spill directory and remove spill
    /// files left there by a previous process. Roots already swept by an
    /// earlier factory of this process are left alone.
    pub fn try_new(
        config: SpillConfig,
        executor: SpillExecutor,
        stats: Arc<SpillerStats>,
    ) -> Result<Self> {
        config.validate()?;
        let mut removed = 0;
        for dir in &config.spill_paths {
            prepare_spill_dir(dir)?;
            removed += cleanup_stale_spill_files_once(dir);
        }
        let paths =
            SpillPathSelector::new(config.spill_paths.clone(), config.max_used_space_threshold);
        let space_tracker = SpillSpaceTracker::new(config.max_spill_bytes_per_node);
        info!(
            paths = ?config.spill_paths,
            compression = %config.compression_codec,
            encryption = config.spill_encryption_enabled,
            checksum = config.spill_checksum_enabled,
            io_threads = config.spill_io_threads,
            stale_files_removed = removed,
            "spiller factory ready"
        );
        Ok(Self {
            config,
            executor,
            stats,
            paths,
            space_tracker,
        })
    }

    pub fn with_disk_usage(mut self, disk_usage: Arc<dyn DiskUsage>) -> Self {
        self.paths = self.paths.with_disk_usage(disk_usage);
        self
    }

    pub fn config(&self) -> &SpillConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<SpillerStats> {
        &self.stats
    }

    /// Node-wide tracker sized by `max_spill_bytes_per_node`. Query spill
    /// contexts forward to it.
    pub fn space_tracker(&self) -> &Arc<SpillSpaceTracker> {
        &self.space_tracker
    }

    /// Spill context for one query, chained to [`Self::space_tracker`].
    pub fn query_spill_context(
        &self,
        query_id: QueryId,
        max_bytes: Option<u64>,
    ) -> Arc<QuerySpillContext> {
        QuerySpillContext::new(query_id, max_bytes, Some(Arc::clone(&self.space_tracker)))
    }

    pub fn spill_paths(&self) -> &[PathBuf] {
        self.paths.paths()
    }

    /// Same as [`SingleStreamSpillerFactory::create`], returning the concrete type.
    /// `spill_context` is not chained to the node tracker here.
    pub fn create_file_spiller(
        &self,
        schema: SchemaRef,
        spill_context: Arc<dyn SpillContext>,
        memory_context: LocalMemoryContext,
    ) -> Result<FileSingleStreamSpiller> {
        let dir = self.paths.next_path()?;
        let cipher: Option<Arc<dyn SpillCipher>> = if self.config.spill_encryption_enabled {
            Some(Arc::new(AesSpillCipher::new()?))
        } else {
            None
        };
        let serde = PagesSerde::new(
            self.config.compression_codec,
            cipher,
            self.config.spill_checksum_enabled,
        );
        let spiller = FileSingleStreamSpiller::try_new(
            schema,
            new_spill_file_path(&dir),
            serde,
            self.executor.clone(),
            Arc::clone(&self.stats),
            spill_context,
            memory_context,
        )?;
        debug!(
            spiller_id = %spiller.id(),
            path = %spiller.spill_file_path().display(),
            "created spiller"
        );
        Ok(spiller)
    }
}

impl SingleStreamSpillerFactory for FileSingleStreamSpillerFactory {
    fn create(
        &self,
        schema: SchemaRef,
        spill_context: Arc<dyn SpillContext>,
        memory_context: LocalMemoryContext,
    ) -> Result<Box<dyn SingleStreamSpiller>> {
        Ok(Box::new(self.create_file_spiller(
            schema,
            spill_context,
            memory_context,
        )?))
    }
}
