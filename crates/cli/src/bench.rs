//! `spillway bench`: spill synthetic batches through the configured factory
//! and read them back.

use std::sync::Arc;
use std::time::Instant;

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use spillway_common::{global_spiller_stats, run_metrics_exporter, AggregatedMemoryContext, QueryId};
use spillway_spill::{FileSingleStreamSpillerFactory, SingleStreamSpiller, SpillExecutor};
use tracing::{info, warn};

use crate::{load_config, BenchOpts, CliResult};

pub(crate) async fn run(opts: BenchOpts) -> CliResult<()> {
    if let Some(addr) = opts.metrics_addr {
        tokio::spawn(async move {
            if let Err(e) = run_metrics_exporter(addr).await {
                warn!(%addr, error = %e, "metrics exporter stopped");
            }
        });
        info!(%addr, "metrics exporter listening");
    }

    let config = load_config(opts.config.clone())?;
    let executor = SpillExecutor::current(config.spill_io_threads)?;
    let factory =
        FileSingleStreamSpillerFactory::try_new(config, executor, global_spiller_stats())?;

    let memory = AggregatedMemoryContext::new_root("bench", None);
    let query = factory.query_spill_context(QueryId("bench".to_string()), None);
    let schema = bench_schema();
    let spiller = factory.create_file_spiller(
        schema.clone(),
        query.clone(),
        memory.new_local("bench-spiller"),
    )?;

    let started = Instant::now();
    for i in 0..opts.batches {
        spiller.spill(bench_batch(&schema, i, opts.rows)?)?.await?;
    }
    let write_elapsed = started.elapsed();

    let started = Instant::now();
    let mut rows = 0usize;
    for batch in spiller.spilled_pages()? {
        rows += batch?.num_rows();
    }
    let read_elapsed = started.elapsed();

    let expected = opts.batches * opts.rows;
    if rows != expected {
        return Err(format!("read back {rows} row(s), expected {expected}").into());
    }
    println!(
        "spilled {} batch(es), {} byte(s) to {}",
        opts.batches,
        spiller.spilled_bytes(),
        spiller.spill_file_path().display()
    );
    println!("write: {write_elapsed:?}, read: {read_elapsed:?}");
    spiller.close().await?;
    println!("query spilled bytes after close: {}", query.spilled_bytes());
    println!(
        "{}",
        serde_json::to_string_pretty(&global_spiller_stats().snapshot())?
    );
    Ok(())
}

fn bench_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("score", DataType::Float64, false),
        Field::new("label", DataType::Utf8, true),
    ]))
}

fn bench_batch(schema: &SchemaRef, batch: usize, rows: usize) -> CliResult<RecordBatch> {
    let base = (batch * rows) as i64;
    let ids = (0..rows as i64).map(|r| base + r).collect::<Vec<_>>();
    let scores = ids.iter().map(|id| *id as f64 * 0.5).collect::<Vec<_>>();
    let labels = ids
        .iter()
        .map(|id| (id % 7 != 0).then(|| format!("row-{}", id % 1024)))
        .collect::<Vec<_>>();
    Ok(RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(Float64Array::from(scores)),
            Arc::new(StringArray::from(labels)),
        ],
    )?)
}
