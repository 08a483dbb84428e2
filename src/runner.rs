//! The split orchestrator.
//!
//! Topology of one run:
//!
//! ```text
//! [external decompressor] -> reader thread -> rayon pool (N workers)
//!                                                 |  unordered results
//!                                                 v
//!                                calling thread: ShardWriter (single writer)
//! ```
//!
//! The reader takes a permit before dispatching each chunk and the consumer
//! hands the permit back once the chunk's groups are written, so at most
//! `2 * workers` chunks are in memory. Results are consumed in completion
//! order: within a key, lines of one chunk stay in input order, lines of
//! different chunks may interleave in either order.
//!
//! Whatever happens after the writer exists (success, worker failure, write
//! failure, interrupt), `close_all` runs before the function returns, so no
//! shard is left straddling its temp and final names.

use crate::checkpoint::ProgressRecorder;
use crate::config::SplitConfig;
use crate::error::SplitError;
use crate::io::source::{Chunk, ChunkSource};
use crate::key::{FieldPrefixExtractor, InvalidPolicy, KeyExtractor};
use crate::metrics::{RunOutcome, RunSummary};
use crate::processor::{ChunkOutput, process_chunk};
use crate::resume::{ResumeState, reconcile, scan_existing};
use crate::writer::ShardWriter;
use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rayon::ThreadPool;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Shared flag that stops a run at the next chunk boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for signal handlers.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

enum Event {
    Chunk(Result<ChunkOutput, SplitError>),
    Exhausted { dispatched: u64 },
    Failed(anyhow::Error),
}

/// Immutable inputs every worker task gets a handle to.
#[derive(Clone)]
struct WorkCtx {
    skip: Arc<HashSet<String>>,
    extractor: Arc<dyn KeyExtractor>,
    policy: InvalidPolicy,
}

pub struct Runner {
    config: SplitConfig,
    extractor: Arc<dyn KeyExtractor>,
    cancel: CancelToken,
}

impl Runner {
    /// A runner using the default [`FieldPrefixExtractor`].
    #[must_use]
    pub fn new(config: SplitConfig) -> Self {
        Self {
            config,
            extractor: Arc::new(FieldPrefixExtractor::default()),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Execute one split run.
    ///
    /// Returns the summary of a completed run, or of a run whose input was
    /// shorter than the start offset ([`RunOutcome::ShortInput`]). Fatal
    /// failures are returned as errors after the summary has been logged and
    /// progress saved.
    ///
    /// # Errors
    /// Configuration errors, unreadable input, decompression failures, chunk
    /// processing failures, shard write failures and interrupts.
    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let cfg = &self.config;
        cfg.validate()?;
        fs::create_dir_all(&cfg.output_dir)
            .with_context(|| format!("mkdir -p {}", cfg.output_dir.display()))?;

        let mut recorder = ProgressRecorder::open(cfg.progress_path(), cfg.progress_policy);
        // Without skipping nothing is trusted, so there is nothing to reconcile.
        let resume = if cfg.skip_existing {
            let resume = scan_existing(&cfg.output_dir, &cfg.naming)?;
            let dropped = reconcile(recorder.record_mut(), &resume);
            for key in dropped.iter().take(10) {
                warn!(key = %key, "recorded as complete but no complete shard on disk; reprocessing");
            }
            resume
        } else {
            ResumeState::default()
        };

        info!(input = %cfg.input.display(), output = %cfg.output_dir.display(), "starting split");
        info!(
            workers = cfg.workers,
            chunk_size = cfg.chunk_size,
            max_handles = cfg.max_handles,
            skip_existing = cfg.skip_existing,
            start_offset = cfg.start_offset,
            "settings"
        );

        let mut source = ChunkSource::open(&cfg.input, &cfg.decompressor, cfg.chunk_size)?;
        info!(strategy = %source.strategy(), header = %String::from_utf8_lossy(source.header()), "input opened");

        let mut summary = RunSummary {
            strategy: source.strategy().to_string(),
            invalid_policy: cfg.invalid_policy.to_string(),
            catch_all: matches!(cfg.invalid_policy, InvalidPolicy::CatchAll(_)),
            keys_preexisting: resume.complete.len(),
            shards_repaired: resume.removed.len(),
            ..Default::default()
        };

        if cfg.start_offset > 0 {
            info!(records = cfg.start_offset, "fast-forwarding");
            let cancel = &self.cancel;
            let ff = match source.fast_forward_until(cfg.start_offset, || cancel.is_cancelled()) {
                Ok(ff) => ff,
                Err(err) => {
                    source.abort();
                    return Err(err);
                }
            };
            summary.fast_forwarded = ff.skipped;
            if ff.shortfall() > 0 {
                warn!(
                    reached = ff.skipped,
                    requested = ff.requested,
                    "input ended before the start offset; nothing to do"
                );
                source.finish()?;
                summary.shortfall = ff.shortfall();
                summary.outcome = RunOutcome::ShortInput;
                summary.elapsed = started.elapsed();
                summary.log();
                return Ok(summary);
            }
        }

        let skip = Arc::new(resume.complete);
        let mut writer = ShardWriter::new(
            &cfg.output_dir,
            cfg.naming.clone(),
            source.header(),
            cfg.writer_options(),
            Arc::clone(&skip),
        )?;
        let ctx = WorkCtx {
            skip,
            extractor: Arc::clone(&self.extractor),
            policy: cfg.invalid_policy.clone(),
        };

        let mut watermark = Watermark::default();
        let result = self.pipeline(source, ctx, &mut writer, &mut recorder, &mut summary, &mut watermark, started);

        // Unconditional: promote everything still open.
        let closed = writer.close_all();
        let stats = writer.stats();
        summary.lines_written = stats.lines;
        summary.keys_written = stats.keys;
        summary.shards_finalized = stats.finalized;
        summary.evictions = stats.evictions;
        summary.peak_open_handles = stats.peak_open_handles;

        let result = match (result, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) => Err(err.context("finalizing shards")),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %format!("{close_err:#}"), "best-effort close after failure also failed");
                Err(err)
            }
        };

        // Out-of-order completions past a gap were never all written; an
        // aborted run may only claim the contiguous prefix.
        let consumed = summary.fast_forwarded
            + if result.is_ok() {
                summary.records_read
            } else {
                watermark.lines
            };
        recorder.update(
            writer.finalized_keys().map(str::to_string),
            summary.lines_routed,
            consumed,
        );
        summary.progress_saved = match recorder.save(result.is_ok()) {
            Ok(saved) => saved,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not save progress");
                false
            }
        };

        summary.elapsed = started.elapsed();
        if let Err(err) = &result {
            summary.outcome = match err.downcast_ref::<SplitError>() {
                Some(SplitError::Interrupted) => RunOutcome::Interrupted,
                _ => RunOutcome::Failed(format!("{err:#}")),
            };
        }
        summary.log();
        result.map(|()| summary)
    }

    /// Reader thread + worker pool + this thread as the single consumer.
    #[allow(clippy::too_many_arguments)]
    fn pipeline(
        &self,
        source: ChunkSource,
        ctx: WorkCtx,
        writer: &mut ShardWriter,
        recorder: &mut ProgressRecorder,
        summary: &mut RunSummary,
        watermark: &mut Watermark,
        started: Instant,
    ) -> Result<()> {
        let cfg = &self.config;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.workers)
            .thread_name(|i| format!("ironshard-worker-{i}"))
            .build()
            .context("build worker pool")?;

        let in_flight = cfg.in_flight();
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<Event>();
        let (permit_tx, permit_rx) = crossbeam_channel::bounded::<()>(in_flight);
        for _ in 0..in_flight {
            permit_tx.send(()).ok();
        }
        let halt = AtomicBool::new(false);

        let (pool, halt, cancel) = (&pool, &halt, &self.cancel);
        std::thread::scope(|scope| {
            // The reader owns the only event sender outside the pool, so the
            // channel disconnects if it dies without reporting.
            let reader = scope.spawn(move || read_loop(source, pool, &permit_rx, &event_tx, &ctx, halt, cancel));

            let consumed = self.consume(&event_rx, &permit_tx, writer, recorder, summary, watermark, started);

            // Wake the reader whatever happened, then collect the source.
            halt.store(true, Ordering::SeqCst);
            drop(permit_tx);
            let source = reader.join().map_err(|_| anyhow!("reader thread panicked"));

            match (consumed, source) {
                (Ok(()), Ok(source)) => source.finish(),
                (Err(err), Ok(source)) => {
                    source.abort();
                    Err(err)
                }
                (Ok(()), Err(err)) | (Err(_), Err(err)) => Err(err),
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn consume(
        &self,
        events: &Receiver<Event>,
        permits: &Sender<()>,
        writer: &mut ShardWriter,
        recorder: &mut ProgressRecorder,
        summary: &mut RunSummary,
        watermark: &mut Watermark,
        started: Instant,
    ) -> Result<()> {
        let cfg = &self.config;
        let mut dispatched: Option<u64> = None;
        let mut last_log = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(SplitError::Interrupted.into());
            }
            if dispatched == Some(summary.chunks) {
                return Ok(());
            }
            let event = match events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => bail!("pipeline channel closed before the input was exhausted"),
            };

            match event {
                Event::Chunk(Ok(out)) => {
                    summary.chunks += 1;
                    summary.records_read += out.lines;
                    summary.lines_routed += out.routed;
                    summary.lines_skipped += out.skipped;
                    summary.invalid_records += out.invalid;
                    for (key, batch) in &out.grouped {
                        writer.write(key, batch)?;
                    }
                    watermark.complete(out.index, out.lines);
                    permits.send(()).ok();

                    if cfg.flush_every_chunks > 0 && summary.chunks % cfg.flush_every_chunks == 0 {
                        writer.flush_all()?;
                    }
                }
                Event::Chunk(Err(err)) => return Err(err.into()),
                Event::Exhausted { dispatched: n } => dispatched = Some(n),
                Event::Failed(err) => return Err(err.context("reading input")),
            }

            if last_log.elapsed() >= cfg.log_interval {
                let stats = writer.stats();
                let secs = started.elapsed().as_secs_f64();
                #[allow(clippy::cast_precision_loss)]
                let rate = if secs > 0.0 { summary.records_read as f64 / secs } else { 0.0 };
                info!(
                    chunks = summary.chunks,
                    lines = summary.records_read,
                    skipped = summary.lines_skipped,
                    keys = stats.keys,
                    open = stats.open_handles,
                    rate = %format_args!("{:.0} lines/s", rate),
                    "progress"
                );
                last_log = Instant::now();
            }

            if recorder.interval_due() {
                recorder.update(
                    writer.finalized_keys().map(str::to_string),
                    summary.lines_routed,
                    summary.fast_forwarded + watermark.lines,
                );
                if let Err(err) = recorder.save(false) {
                    warn!(error = %format!("{err:#}"), "could not save interim progress");
                }
            }
        }
    }
}

/// Records covered by the longest prefix of fully consumed chunks.
#[derive(Default)]
struct Watermark {
    next: u64,
    lines: u64,
    pending: BTreeMap<u64, u64>,
}

impl Watermark {
    fn complete(&mut self, index: u64, lines: u64) {
        self.pending.insert(index, lines);
        while let Some(lines) = self.pending.remove(&self.next) {
            self.lines += lines;
            self.next += 1;
        }
    }
}

fn read_loop(
    mut source: ChunkSource,
    pool: &ThreadPool,
    permits: &Receiver<()>,
    events: &Sender<Event>,
    ctx: &WorkCtx,
    halt: &AtomicBool,
    cancel: &CancelToken,
) -> ChunkSource {
    let mut dispatched = 0u64;
    loop {
        if halt.load(Ordering::SeqCst) || cancel.is_cancelled() {
            break;
        }
        if permits.recv().is_err() {
            break;
        }
        match source.next_chunk() {
            Ok(Some(chunk)) => {
                dispatch(pool, chunk, ctx.clone(), events.clone());
                dispatched += 1;
            }
            Ok(None) => {
                events.send(Event::Exhausted { dispatched }).ok();
                break;
            }
            Err(err) => {
                events.send(Event::Failed(err)).ok();
                break;
            }
        }
    }
    source
}

fn dispatch(pool: &ThreadPool, chunk: Chunk, ctx: WorkCtx, events: Sender<Event>) {
    pool.spawn(move || {
        let index = chunk.index;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            process_chunk(&chunk, &ctx.skip, ctx.extractor.as_ref(), &ctx.policy)
        }))
        .map_err(|payload| SplitError::ChunkProcessing {
            chunk: index,
            message: panic_message(payload.as_ref()),
        });
        events.send(Event::Chunk(result)).ok();
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_waits_for_gaps() {
        let mut w = Watermark::default();
        w.complete(1, 10);
        assert_eq!(w.lines, 0);
        w.complete(0, 10);
        assert_eq!(w.lines, 20);
        w.complete(3, 5);
        w.complete(2, 10);
        assert_eq!(w.lines, 35);
        assert!(w.pending.is_empty());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
    }
}
