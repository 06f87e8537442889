//! Batch orchestration: the heart of the processing pipeline.
//!
//! The engine exposes asynchronous verbs — `process_ocr`, `process_ai`,
//! `process_ocr_ai` — that validate arguments, spawn one batch job, and
//! return immediately; all progress flows through the event bus. One batch
//! runs at a time.
//!
//! ## Per-page flow
//!
//! ```text
//! fingerprint ─▶ cache hit? ──yes──▶ apply + page-processed(from_cache)
//!      │no
//!      ▼
//! single-flight slot
//!   ├─ render page (primary → extracted → placeholder)
//!   ├─ extract native text (first touch only)
//!   ├─ model call (rate-limited, retrying, cancellable)
//!   └─ store: document + cache + history
//! ```
//!
//! ## Ordering and control
//!
//! Up to `burst_limit` workers run concurrently; completions funnel
//! through a [`dispatch::OrderedDispatcher`] so `page-processed` events
//! leave in ascending page order no matter how workers interleave.
//! Between pages every worker passes a [`job::JobControl::checkpoint`]:
//! pausing parks new page starts while in-flight requests finish; cancel
//! propagates through the job's `CancellationToken` into rate-limiter
//! waits, HTTP calls, and single-flight waiters. A page whose response
//! arrived before the worker observed cancellation is persisted and its
//! completion event emitted before the terminal event.

pub mod dispatch;
pub mod job;

use crate::cache::{Cache, CacheKind, Produced};
use crate::client::{AdjacentContext, ModelApi};
use crate::config::ConfigHandle;
use crate::document::DocumentSession;
use crate::error::{EngineError, ErrorKind, PageFailure};
use crate::events::{Event, EventBus, JobStatus};
use crate::fingerprint;
use crate::history::{HistoryPage, HistoryStore, NewRecord, RecordStatus};
use crate::prompts;
use crate::render::Renderer;
use chrono::Utc;
use dispatch::{OrderedDispatcher, OutcomeKind, PageOutcome};
use job::{JobControl, JobMode, JobPhase, JobStateSnapshot};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// Records in `processing` older than this at startup cannot be live.
pub const STALE_RECORD_RECOVERY: std::time::Duration =
    std::time::Duration::from_secs(60 * 60);

struct ActiveJob {
    job_id: u64,
    mode: JobMode,
    pages: Vec<u32>,
    force: bool,
    context_mode: bool,
    control: Arc<JobControl>,
    processed: Arc<AtomicUsize>,
    current_page: Arc<AtomicU32>,
}

/// Orchestrates batch jobs over the injected collaborators.
pub struct Engine {
    session: Arc<DocumentSession>,
    cache: Arc<Cache>,
    history: Arc<HistoryStore>,
    renderer: Arc<Renderer>,
    model: Arc<dyn ModelApi>,
    events: Arc<EventBus>,
    config: ConfigHandle,
    active: Arc<StdMutex<Option<ActiveJob>>>,
    job_counter: AtomicU64,
}

/// Everything a batch task and its workers share.
struct BatchCtx {
    job_id: u64,
    mode: JobMode,
    pages: Vec<u32>,
    force: bool,
    context_mode: bool,
    prompt: Option<String>,
    control: Arc<JobControl>,
    processed: Arc<AtomicUsize>,
    current_page: Arc<AtomicU32>,
    tokens: AtomicU64,
    record_id: StdMutex<Option<i64>>,

    session: Arc<DocumentSession>,
    cache: Arc<Cache>,
    history: Arc<HistoryStore>,
    renderer: Arc<Renderer>,
    model: Arc<dyn ModelApi>,
    events: Arc<EventBus>,
    config: ConfigHandle,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<DocumentSession>,
        cache: Arc<Cache>,
        history: Arc<HistoryStore>,
        renderer: Arc<Renderer>,
        model: Arc<dyn ModelApi>,
        events: Arc<EventBus>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            session,
            cache,
            history,
            renderer,
            model,
            events,
            config,
            active: Arc::new(StdMutex::new(None)),
            job_counter: AtomicU64::new(1),
        }
    }

    /// Start an OCR batch over the selected pages.
    pub async fn process_ocr(&self, pages: Vec<u32>, force: bool) -> Result<u64, EngineError> {
        self.start_job(pages, JobMode::Ocr, force, false, None).await
    }

    /// Start an AI transformation batch over the selected pages.
    pub async fn process_ai(
        &self,
        pages: Vec<u32>,
        prompt: String,
        context_mode: bool,
        force: bool,
    ) -> Result<u64, EngineError> {
        if prompt.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "AI prompt must not be empty".into(),
            ));
        }
        self.start_job(pages, JobMode::Ai, force, context_mode, Some(prompt))
            .await
    }

    /// Start a combined batch: recognize each page, then transform it.
    pub async fn process_ocr_ai(
        &self,
        pages: Vec<u32>,
        prompt: String,
        context_mode: bool,
        force: bool,
    ) -> Result<u64, EngineError> {
        if prompt.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "AI prompt must not be empty".into(),
            ));
        }
        self.start_job(pages, JobMode::OcrAi, force, context_mode, Some(prompt))
            .await
    }

    /// Park the active job after in-flight pages finish. No-op when idle.
    pub fn pause(&self) {
        let active = self.active.lock().expect("active job lock poisoned");
        if let Some(job) = active.as_ref() {
            if job.control.pause() {
                info!(job_id = job.job_id, "processing paused");
                self.events.publish(Event::ProcessingPaused);
            }
        }
    }

    /// Resume a paused job. No-op when idle or running.
    pub fn resume(&self) {
        let active = self.active.lock().expect("active job lock poisoned");
        if let Some(job) = active.as_ref() {
            if job.control.resume() {
                info!(job_id = job.job_id, "processing resumed");
                self.events.publish(Event::ProcessingResumed);
            }
        }
    }

    /// Cancel the active job; the batch task emits the terminal event once
    /// in-flight work unwinds. No-op when idle.
    pub fn cancel(&self) {
        let active = self.active.lock().expect("active job lock poisoned");
        if let Some(job) = active.as_ref() {
            if job.control.cancel() {
                info!(job_id = job.job_id, "processing cancelling");
            }
        }
    }

    /// Snapshot of the active job, or the idle state.
    pub fn job_state(&self) -> JobStateSnapshot {
        let active = self.active.lock().expect("active job lock poisoned");
        match active.as_ref() {
            Some(job) => JobStateSnapshot {
                job_id: job.job_id,
                selected_pages: job.pages.clone(),
                mode: job.mode,
                force_reprocess: job.force,
                context_mode: job.context_mode,
                state: job.control.phase().status(),
                processed_count: job.processed.load(Ordering::Acquire),
                current_page: job.current_page.load(Ordering::Acquire),
            },
            None => JobStateSnapshot {
                job_id: 0,
                selected_pages: Vec::new(),
                mode: JobMode::Ocr,
                force_reprocess: false,
                context_mode: false,
                state: JobStatus::Idle,
                processed_count: 0,
                current_page: 0,
            },
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active
            .lock()
            .expect("active job lock poisoned")
            .is_none()
    }

    async fn start_job(
        &self,
        pages: Vec<u32>,
        mode: JobMode,
        force: bool,
        context_mode: bool,
        prompt: Option<String>,
    ) -> Result<u64, EngineError> {
        let mut pages = pages;
        pages.sort_unstable();
        pages.dedup();
        if pages.is_empty() {
            return Err(EngineError::EmptySelection);
        }
        self.session.validate_pages(&pages).await?;

        let control = Arc::new(JobControl::new());
        let processed = Arc::new(AtomicUsize::new(0));
        let current_page = Arc::new(AtomicU32::new(0));
        let job_id = self.job_counter.fetch_add(1, Ordering::Relaxed);

        {
            let mut active = self.active.lock().expect("active job lock poisoned");
            if active.is_some() {
                return Err(EngineError::JobAlreadyRunning);
            }
            *active = Some(ActiveJob {
                job_id,
                mode,
                pages: pages.clone(),
                force,
                context_mode,
                control: control.clone(),
                processed: processed.clone(),
                current_page: current_page.clone(),
            });
        }

        let ctx = Arc::new(BatchCtx {
            job_id,
            mode,
            pages,
            force,
            context_mode,
            prompt,
            control,
            processed,
            current_page,
            tokens: AtomicU64::new(0),
            record_id: StdMutex::new(None),
            session: self.session.clone(),
            cache: self.cache.clone(),
            history: self.history.clone(),
            renderer: self.renderer.clone(),
            model: self.model.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        });

        let active = self.active.clone();
        tokio::spawn(async move {
            run_batch(ctx).await;
            *active.lock().expect("active job lock poisoned") = None;
        });

        Ok(job_id)
    }
}

// ── Batch execution ──────────────────────────────────────────────────────

async fn run_batch(ctx: Arc<BatchCtx>) {
    info!(
        job_id = ctx.job_id,
        mode = ?ctx.mode,
        pages = ctx.pages.len(),
        force = ctx.force,
        "batch started"
    );

    create_history_record(&ctx).await;

    let burst = ctx.config.current().ai.burst_limit.max(1);
    let semaphore = Arc::new(Semaphore::new(burst));
    let (tx, mut rx) = mpsc::unbounded_channel::<PageOutcome>();

    for &page in &ctx.pages {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let cancel = ctx.control.cancel_token().clone();
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let outcome = if permit.is_none() {
                PageOutcome {
                    page,
                    kind: OutcomeKind::Failed(PageFailure::cancelled(page)),
                    ai: None,
                }
            } else if let Err(failure) = ctx.control.checkpoint(page).await {
                PageOutcome {
                    page,
                    kind: OutcomeKind::Failed(failure),
                    ai: None,
                }
            } else {
                process_page(&ctx, page).await
            };
            let _ = tx.send(outcome);
        });
    }
    drop(tx);

    let mut dispatcher = OrderedDispatcher::new(&ctx.pages);
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    while let Some(outcome) = rx.recv().await {
        for released in dispatcher.push(outcome) {
            emit_outcome(&ctx, &released, &mut succeeded, &mut failed);
        }
    }
    for released in dispatcher.drain() {
        emit_outcome(&ctx, &released, &mut succeeded, &mut failed);
    }

    finalize_batch(&ctx, succeeded, failed).await;
}

async fn create_history_record(ctx: &BatchCtx) {
    let meta = match ctx.session.descriptor().await {
        Ok(desc) => {
            let config = ctx.config.current();
            let ai_model = match ctx.mode {
                JobMode::Ocr => config.ai.ocr_model.clone(),
                JobMode::Ai | JobMode::OcrAi => config.ai.text_model.clone(),
            };
            NewRecord {
                document_path: desc.path.to_string_lossy().into_owned(),
                document_name: desc
                    .path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                page_count: desc.page_count,
                ai_model,
            }
        }
        Err(_) => return,
    };

    match ctx.history.create_record(&meta) {
        Ok(id) => *ctx.record_id.lock().expect("record id lock poisoned") = Some(id),
        Err(e) => warn!(error = %e, "history record creation failed; run will not be logged"),
    }
}

/// Emit the events for one released outcome and update counters.
fn emit_outcome(
    ctx: &BatchCtx,
    outcome: &PageOutcome,
    succeeded: &mut usize,
    failed: &mut usize,
) {
    let primary_is_ai = ctx.mode == JobMode::Ai;
    match &outcome.kind {
        OutcomeKind::Done { from_cache } => {
            *succeeded += 1;
            if primary_is_ai {
                ctx.events.publish(Event::AiPageProcessed {
                    page_number: outcome.page,
                    from_cache: *from_cache,
                });
            } else {
                ctx.events.publish(Event::PageProcessed {
                    page_number: outcome.page,
                    from_cache: *from_cache,
                });
            }
        }
        OutcomeKind::Failed(failure) => {
            *failed += 1;
            if !failure.is_cancelled() {
                if primary_is_ai {
                    ctx.events.publish(Event::AiProcessingError {
                        error: failure.clone(),
                    });
                } else {
                    ctx.events.publish(Event::ProcessingError {
                        error: failure.clone(),
                    });
                }
            }
        }
        OutcomeKind::Skipped { reason } => {
            // The page could not participate; tell the shell why, but the
            // batch keeps its pace.
            warn!(page = outcome.page, reason = %reason, "page skipped");
            ctx.events.publish(Event::AiProcessingError {
                error: PageFailure::new(outcome.page, ErrorKind::BadRequest, reason.clone()),
            });
        }
    }

    if let Some(ai) = &outcome.ai {
        match ai {
            OutcomeKind::Done { from_cache } => {
                ctx.events.publish(Event::AiPageProcessed {
                    page_number: outcome.page,
                    from_cache: *from_cache,
                });
            }
            OutcomeKind::Failed(failure) => {
                if !failure.is_cancelled() {
                    ctx.events.publish(Event::AiProcessingError {
                        error: failure.clone(),
                    });
                }
            }
            OutcomeKind::Skipped { reason } => {
                ctx.events.publish(Event::AiProcessingError {
                    error: PageFailure::new(
                        outcome.page,
                        ErrorKind::BadRequest,
                        reason.clone(),
                    ),
                });
            }
        }
    }

    let processed = ctx.processed.fetch_add(1, Ordering::AcqRel) + 1;
    ctx.current_page.store(outcome.page, Ordering::Release);
    ctx.events.publish(Event::ProcessingProgress {
        total: ctx.pages.len(),
        processed,
        current_page: outcome.page,
        status: ctx.control.phase().status(),
    });
}

async fn finalize_batch(ctx: &BatchCtx, succeeded: usize, failed: usize) {
    let cancelled = ctx.control.phase() == JobPhase::Cancelling;
    let status = if cancelled {
        RecordStatus::Cancelled
    } else if succeeded == 0 && failed > 0 {
        RecordStatus::Failed
    } else {
        RecordStatus::Completed
    };

    let record_id = *ctx.record_id.lock().expect("record id lock poisoned");
    if let Some(id) = record_id {
        let cost = ctx.tokens.load(Ordering::Acquire);
        if let Err(e) = ctx.history.finish_record(id, status, cost) {
            warn!(record_id = id, error = %e, "history finalization failed");
        }
    }

    info!(
        job_id = ctx.job_id,
        succeeded,
        failed,
        status = status.as_str(),
        "batch finished"
    );

    if cancelled {
        ctx.events.publish(Event::ProcessingCancelled);
    } else {
        match ctx.mode {
            JobMode::Ocr => ctx.events.publish(Event::ProcessingComplete {
                total: ctx.pages.len(),
                processed: succeeded,
            }),
            JobMode::Ai | JobMode::OcrAi => ctx.events.publish(Event::AiProcessingComplete {
                total: ctx.pages.len(),
                processed: succeeded,
            }),
        }
    }
}

// ── Per-page processing ──────────────────────────────────────────────────

async fn process_page(ctx: &BatchCtx, page: u32) -> PageOutcome {
    match ctx.mode {
        JobMode::Ocr => PageOutcome {
            page,
            kind: ocr_stage(ctx, page).await,
            ai: None,
        },
        JobMode::Ai => PageOutcome {
            page,
            kind: ai_stage(ctx, page).await,
            ai: None,
        },
        JobMode::OcrAi => {
            let ocr = ocr_stage(ctx, page).await;
            let ai = match &ocr {
                OutcomeKind::Done { .. } => Some(ai_stage(ctx, page).await),
                _ => None,
            };
            PageOutcome {
                page,
                kind: ocr,
                ai,
            }
        }
    }
}

/// The per-page OCR algorithm.
async fn ocr_stage(ctx: &BatchCtx, page: u32) -> OutcomeKind {
    let config = ctx.config.current();
    let desc = match ctx.session.descriptor().await {
        Ok(desc) => desc,
        Err(_) => {
            return OutcomeKind::Failed(PageFailure::new(
                page,
                ErrorKind::DocumentNotLoaded,
                "document was unloaded mid-batch",
            ))
        }
    };

    let fp = fingerprint::ocr_fingerprint(
        &desc.content_id,
        page,
        &config.ai.ocr_model,
        prompts::OCR_PROMPT_TEMPLATE_ID,
    );

    if !ctx.force {
        match ctx.cache.get(&fp) {
            Ok(Some(entry)) => {
                debug!(page, "OCR cache hit");
                if let Err(failure) = apply_ocr_result(ctx, page, &entry.payload_text, 0).await {
                    return OutcomeKind::Failed(failure);
                }
                return OutcomeKind::Done { from_cache: true };
            }
            Ok(None) => {}
            Err(e) => warn!(page, error = %e, "cache lookup failed; treating as miss"),
        }
    } else if let Err(e) = ctx.cache.invalidate(&fp) {
        warn!(page, error = %e, "cache invalidation failed");
    }

    let started = Instant::now();
    let cancel = ctx.control.cancel_token().clone();
    let producer_cancel = cancel.clone();
    let producer_config = config.clone();
    let result = ctx
        .cache
        .compute_or_wait(&fp, &cancel, move || async move {
            let cancel = producer_cancel;
            let config = producer_config;
            let page_state = ctx
                .session
                .page(page)
                .await
                .map_err(|e| PageFailure::new(page, ErrorKind::DocumentNotLoaded, e.to_string()))?;

            let rendered = ctx
                .renderer
                .render(&desc, page, page_state.image_path.as_deref())
                .await
                .map_err(|e| PageFailure::new(page, ErrorKind::DecodeError, e.to_string()))?;
            let _ = ctx
                .session
                .record_render(page, rendered.width, rendered.height, &rendered.image_path)
                .await;

            // First touch populates the native text; later passes reuse it.
            let native_text = if page_state.native_text.is_empty() && !page_state.has_native_text {
                match ctx.renderer.extract_native_text(&desc, page).await {
                    Ok((text, _)) => {
                        let _ = ctx.session.record_native_text(page, text.clone()).await;
                        text
                    }
                    Err(e) => {
                        debug!(page, error = %e, "native text extraction failed");
                        String::new()
                    }
                }
            } else {
                page_state.native_text.clone()
            };

            let instructions = if native_text.trim().is_empty() {
                prompts::OCR_SYSTEM_PROMPT.to_string()
            } else {
                format!(
                    "{}\n\n{}",
                    prompts::OCR_SYSTEM_PROMPT,
                    prompts::ocr_native_text_hint(&native_text)
                )
            };

            let output = ctx
                .model
                .ocr(&rendered.bytes, &config.ai.ocr_model, &instructions, &cancel)
                .await
                .map_err(|e| e.into_failure(page))?;
            ctx.tokens
                .fetch_add(output.total_tokens(), Ordering::AcqRel);

            Ok(Produced {
                kind: CacheKind::Ocr,
                payload_text: output.text,
                model_id: config.ai.ocr_model.clone(),
            })
        })
        .await;

    match result {
        Ok(entry) => {
            let elapsed = started.elapsed().as_millis() as u64;
            match apply_ocr_result(ctx, page, &entry.payload_text, elapsed).await {
                Ok(()) => OutcomeKind::Done { from_cache: false },
                Err(failure) => OutcomeKind::Failed(failure),
            }
        }
        Err(failure) => OutcomeKind::Failed(failure),
    }
}

/// Store OCR text into the document and the history record.
async fn apply_ocr_result(
    ctx: &BatchCtx,
    page: u32,
    text: &str,
    processing_time_ms: u64,
) -> Result<(), PageFailure> {
    ctx.session
        .record_ocr_text(page, text)
        .await
        .map_err(|e| PageFailure::new(page, ErrorKind::DocumentNotLoaded, e.to_string()))?;
    append_history_page(ctx, page, processing_time_ms).await;
    Ok(())
}

/// The per-page AI algorithm.
async fn ai_stage(ctx: &BatchCtx, page: u32) -> OutcomeKind {
    let config = ctx.config.current();
    let prompt = match ctx.prompt.as_deref() {
        Some(prompt) => prompt,
        None => {
            return OutcomeKind::Failed(PageFailure::new(
                page,
                ErrorKind::BadRequest,
                "AI stage without a prompt",
            ))
        }
    };

    let page_state = match ctx.session.page(page).await {
        Ok(state) => state,
        Err(e) => {
            return OutcomeKind::Failed(PageFailure::new(
                page,
                ErrorKind::DocumentNotLoaded,
                e.to_string(),
            ))
        }
    };

    let source = page_state.source_text().to_string();
    if source.trim().is_empty() {
        return OutcomeKind::Skipped {
            reason: format!("page {page} has no OCR or native text to transform"),
        };
    }

    // Neighbor text in reading order; absent neighbors contribute nothing.
    let (previous, next) = if ctx.context_mode {
        let previous = match page.checked_sub(1) {
            Some(0) | None => None,
            Some(prev) => ctx
                .session
                .page(prev)
                .await
                .ok()
                .map(|p| p.source_text().to_string())
                .filter(|text| !text.trim().is_empty()),
        };
        let next = ctx
            .session
            .page(page + 1)
            .await
            .ok()
            .map(|p| p.source_text().to_string())
            .filter(|text| !text.trim().is_empty());
        (previous, next)
    } else {
        (None, None)
    };

    let adjacent: Vec<&str> = previous
        .iter()
        .chain(next.iter())
        .map(|s| s.as_str())
        .collect();
    let fp = fingerprint::ai_fingerprint(
        &source,
        &config.ai.text_model,
        prompt,
        ctx.context_mode,
        &adjacent,
    );

    if !ctx.force {
        match ctx.cache.get(&fp) {
            Ok(Some(entry)) => {
                debug!(page, "AI cache hit");
                if let Err(failure) = apply_ai_result(ctx, page, &entry.payload_text, 0).await {
                    return OutcomeKind::Failed(failure);
                }
                return OutcomeKind::Done { from_cache: true };
            }
            Ok(None) => {}
            Err(e) => warn!(page, error = %e, "cache lookup failed; treating as miss"),
        }
    } else if let Err(e) = ctx.cache.invalidate(&fp) {
        warn!(page, error = %e, "cache invalidation failed");
    }

    let started = Instant::now();
    let cancel = ctx.control.cancel_token().clone();
    let context = if ctx.context_mode {
        Some(AdjacentContext { previous, next })
    } else {
        None
    };

    let producer_cancel = cancel.clone();
    let producer_config = config.clone();
    let result = ctx
        .cache
        .compute_or_wait(&fp, &cancel, move || async move {
            let cancel = producer_cancel;
            let config = producer_config;
            let output = ctx
                .model
                .transform(
                    &source,
                    &config.ai.text_model,
                    prompt,
                    context.as_ref(),
                    &cancel,
                )
                .await
                .map_err(|e| e.into_failure(page))?;
            ctx.tokens
                .fetch_add(output.total_tokens(), Ordering::AcqRel);

            Ok(Produced {
                kind: CacheKind::Ai,
                payload_text: output.text,
                model_id: config.ai.text_model.clone(),
            })
        })
        .await;

    match result {
        Ok(entry) => {
            let elapsed = started.elapsed().as_millis() as u64;
            match apply_ai_result(ctx, page, &entry.payload_text, elapsed).await {
                Ok(()) => OutcomeKind::Done { from_cache: false },
                Err(failure) => OutcomeKind::Failed(failure),
            }
        }
        Err(failure) => OutcomeKind::Failed(failure),
    }
}

/// Store AI text into the document and the history record.
async fn apply_ai_result(
    ctx: &BatchCtx,
    page: u32,
    text: &str,
    processing_time_ms: u64,
) -> Result<(), PageFailure> {
    ctx.session
        .record_ai_text(page, text)
        .await
        .map_err(|e| PageFailure::new(page, ErrorKind::DocumentNotLoaded, e.to_string()))?;
    append_history_page(ctx, page, processing_time_ms).await;
    Ok(())
}

/// Write the page's current text state into the run's history. A failed
/// write is logged and never aborts the page — the result already reached
/// the document.
async fn append_history_page(ctx: &BatchCtx, page: u32, processing_time_ms: u64) {
    let record_id = *ctx.record_id.lock().expect("record id lock poisoned");
    let Some(record_id) = record_id else {
        return;
    };
    let Ok(state) = ctx.session.page(page).await else {
        return;
    };

    let entry = HistoryPage {
        record_id,
        page_number: page,
        original_text: state.native_text,
        ocr_text: state.ocr_text,
        ai_processed_text: state.ai_text,
        processing_time_ms,
        created_at: Utc::now(),
    };
    if let Err(e) = ctx.history.append_page(&entry) {
        warn!(
            page,
            record_id,
            error = %e,
            kind = ErrorKind::HistoryWriteFailed.as_str(),
            "history page write failed"
        );
    }
}
