//! Chunked fact insertion with per-row fallback.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::record::FactRow;
use crate::store::FactSink;

/// Postgres accepts at most `u16::MAX` bind parameters per statement
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize / FactRow::COLUMNS;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub inserted: u64,
    pub failed: u64,
    pub chunks: usize,
    /// Chunks whose batched insert failed and were retried row by row
    pub fallback_chunks: usize,
    pub reconnects: usize,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub chunk_size: usize,
    /// Throttle between chunks
    pub pause: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            chunk_size: 300,
            pause: Duration::from_millis(100),
        }
    }
}

enum ChunkOutcome {
    Done { inserted: u64, failed: u64 },
    ConnectionLost(StoreError),
}

async fn insert_rows_individually<S: FactSink>(
    sink: &mut S,
    chunk: &[FactRow],
) -> Result<ChunkOutcome, StoreError> {
    let outcomes = match sink.insert_each(chunk).await {
        Ok(outcomes) => outcomes,
        Err(e) if e.is_connection() => return Ok(ChunkOutcome::ConnectionLost(e)),
        Err(e @ StoreError::Fatal(_)) => return Err(e),
        Err(e) => {
            warn!(error = %e, rows = chunk.len(), "row-by-row insert lost the whole chunk");
            return Ok(ChunkOutcome::Done {
                inserted: 0,
                failed: chunk.len() as u64,
            });
        }
    };

    let mut inserted = 0;
    let mut failed = 0;
    for (row, outcome) in chunk.iter().zip(outcomes) {
        match outcome {
            Ok(()) => inserted += 1,
            Err(e) => {
                warn!(row = row.source_row, error = %e, "row skipped");
                failed += 1;
            }
        }
    }
    Ok(ChunkOutcome::Done { inserted, failed })
}

async fn insert_chunk<S: FactSink>(
    sink: &mut S,
    chunk: &[FactRow],
    report: &mut LoadReport,
) -> Result<ChunkOutcome, StoreError> {
    match sink.insert_chunk(chunk).await {
        Ok(inserted) => Ok(ChunkOutcome::Done { inserted, failed: 0 }),
        Err(e) if e.is_connection() => Ok(ChunkOutcome::ConnectionLost(e)),
        Err(e @ StoreError::Fatal(_)) => Err(e),
        Err(e) => {
            warn!(
                first_row = chunk.first().map(|r| r.source_row),
                error = %e,
                "batched insert failed, retrying rows one at a time"
            );
            report.fallback_chunks += 1;
            insert_rows_individually(sink, chunk).await
        }
    }
}

/// Insert `rows` in order, one chunk at a time.
///
/// A chunk interrupted by a lost connection is counted as failed (its
/// transaction rolled back or its commit is unknown) and loading resumes
/// with the next chunk on a fresh connection. Failing to reconnect, or a
/// fatal schema/permission error, aborts the load.
pub async fn load<S: FactSink>(
    sink: &mut S,
    rows: &[FactRow],
    options: &LoadOptions,
) -> Result<LoadReport, StoreError> {
    let chunk_size = options.chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let total_chunks = rows.len().div_ceil(chunk_size);
    let mut report = LoadReport::default();

    for (idx, chunk) in rows.chunks(chunk_size).enumerate() {
        if idx > 0 && !options.pause.is_zero() {
            tokio::time::sleep(options.pause).await;
        }

        match insert_chunk(sink, chunk, &mut report).await? {
            ChunkOutcome::Done { inserted, failed } => {
                report.inserted += inserted;
                report.failed += failed;
            }
            ChunkOutcome::ConnectionLost(e) => {
                warn!(chunk = idx + 1, rows = chunk.len(), error = %e, "connection lost during chunk, reconnecting");
                if let Err(reconnect_err) = sink.reconnect().await {
                    error!(error = %reconnect_err, "reconnect failed, aborting load");
                    return Err(reconnect_err);
                }
                report.reconnects += 1;
                report.failed += chunk.len() as u64;
            }
        }
        report.chunks += 1;

        info!(
            chunk = idx + 1,
            of = total_chunks,
            inserted = report.inserted,
            failed = report.failed,
            "chunk {}/{} done",
            idx + 1,
            total_chunks
        );
    }

    Ok(report)
}
