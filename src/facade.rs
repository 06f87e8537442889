//! The single entry point the shell calls.
//!
//! Every method validates its arguments, consults the collaborators
//! read-only, and either returns a serializable snapshot or delegates to
//! the engine and returns immediately — progress then flows through the
//! event bus. The facade owns construction wiring: collaborators are built
//! once here and passed by dependency injection, never reached through
//! globals.

use crate::cache::Cache;
use crate::client::{HttpModelClient, ModelApi};
use crate::config::{AppConfig, ConfigHandle};
use crate::document::{DocumentSession, DocumentSnapshot, TextKind};
use crate::engine::job::JobStateSnapshot;
use crate::engine::{Engine, STALE_RECORD_RECOVERY};
use crate::error::EngineError;
use crate::events::{DependencyReport, Event, EventBus, Subscriber};
use crate::fingerprint;
use crate::history::{HistoryPage, HistoryRecord, HistoryStore, SearchMatch};
use crate::limiter::RateLimiter;
use crate::probe;
use crate::prompts;
use crate::render::{Renderer, SUPPORTED_FORMATS};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Split of a selection into already-processed and still-unprocessed
/// pages, for the shell's confirmation dialog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSplit {
    pub processed: Vec<u32>,
    pub unprocessed: Vec<u32>,
    pub total: usize,
}

/// Static application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppVersion {
    pub version: String,
    pub author: String,
    pub email: String,
    pub copyright: String,
    pub build_date: Option<String>,
}

/// Builder for [`RequestFacade`]; lets tests swap the model seam and the
/// storage location.
pub struct FacadeBuilder {
    data_dir: PathBuf,
    config: Option<AppConfig>,
    config_path: Option<PathBuf>,
    model: Option<Arc<dyn ModelApi>>,
}

impl FacadeBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config: None,
            config_path: None,
            model: None,
        }
    }

    /// Use an explicit configuration instead of loading from disk.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load (and persist updates to) the configuration at this path.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Substitute the model seam (tests use a scripted implementation).
    pub fn model(mut self, model: Arc<dyn ModelApi>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn build(self) -> Result<RequestFacade, EngineError> {
        let config_path = self
            .config_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("config.json"));
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => AppConfig::load(&config_path)?,
        };

        let handle = ConfigHandle::new(config.clone());
        let limiter = Arc::new(RateLimiter::new(
            config.request_interval(),
            config.ai.burst_limit,
        ));
        let session = Arc::new(DocumentSession::new());
        let renderer = Arc::new(Renderer::new()?);
        let cache = Arc::new(Cache::open(&self.data_dir.join("cache.db"), handle.clone())?);
        let history = Arc::new(HistoryStore::open(&self.data_dir.join("history.db"))?);

        // Startup housekeeping: crashed runs become cancelled, old runs age
        // out.
        history.recover_stale(STALE_RECORD_RECOVERY)?;
        history.retention_sweep(config.storage.history_retention)?;

        let events = Arc::new(EventBus::new());
        let model: Arc<dyn ModelApi> = match self.model {
            Some(model) => model,
            None => Arc::new(HttpModelClient::new(handle.clone(), limiter.clone())),
        };

        let engine = Engine::new(
            session.clone(),
            cache.clone(),
            history.clone(),
            renderer.clone(),
            model,
            events.clone(),
            handle.clone(),
        );

        Ok(RequestFacade {
            config: handle,
            config_path,
            data_dir: self.data_dir,
            session,
            cache,
            history,
            renderer,
            limiter,
            engine,
            events,
        })
    }
}

/// The synchronous surface exposed to the shell.
pub struct RequestFacade {
    config: ConfigHandle,
    config_path: PathBuf,
    data_dir: PathBuf,
    session: Arc<DocumentSession>,
    cache: Arc<Cache>,
    history: Arc<HistoryStore>,
    renderer: Arc<Renderer>,
    limiter: Arc<RateLimiter>,
    engine: Engine,
    events: Arc<EventBus>,
}

impl RequestFacade {
    pub fn builder(data_dir: impl Into<PathBuf>) -> FacadeBuilder {
        FacadeBuilder::new(data_dir)
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> Subscriber {
        self.events.subscribe()
    }

    // ── Document surface ─────────────────────────────────────────────────

    /// Load a document, replacing the current one.
    pub async fn load_document(&self, path: &Path) -> Result<DocumentSnapshot, EngineError> {
        if !self.engine.is_idle() {
            return Err(EngineError::JobAlreadyRunning);
        }
        let document = self.renderer.load(path).await?;
        info!(path = %path.display(), pages = document.page_count, "document loaded");
        let loaded = Event::DocumentLoaded {
            path: document.path.to_string_lossy().into_owned(),
            title: document.title.clone(),
            page_count: document.page_count,
        };
        self.session.replace(document).await;
        self.events.publish(loaded);
        self.session.snapshot().await
    }

    /// Snapshot of the loaded document; safe during a batch.
    pub async fn current_document(&self) -> Result<DocumentSnapshot, EngineError> {
        self.session.snapshot().await
    }

    /// Render (or re-serve) one page image.
    pub async fn page_image(&self, page: u32) -> Result<Vec<u8>, EngineError> {
        let desc = self.session.descriptor().await?;
        self.session.validate_pages(&[page]).await?;
        let existing = self.session.page(page).await?.image_path;
        let rendered = self
            .renderer
            .render(&desc, page, existing.as_deref())
            .await?;
        self.session
            .record_render(page, rendered.width, rendered.height, &rendered.image_path)
            .await?;
        Ok(rendered.bytes)
    }

    /// Extract a page's embedded text and persist it into the document.
    pub async fn extract_native_text(&self, page: u32) -> Result<String, EngineError> {
        let desc = self.session.descriptor().await?;
        self.session.validate_pages(&[page]).await?;
        let (text, _has_text) = self.renderer.extract_native_text(&desc, page).await?;
        self.session.record_native_text(page, text.clone()).await?;
        Ok(text)
    }

    pub fn supported_formats(&self) -> Vec<String> {
        SUPPORTED_FORMATS.iter().map(|s| s.to_string()).collect()
    }

    // ── Processing surface ───────────────────────────────────────────────

    /// OCR-only batch; returns once the job is spawned.
    pub async fn process_pages(&self, pages: Vec<u32>, force: bool) -> Result<(), EngineError> {
        self.engine.process_ocr(pages, force).await.map(|_| ())
    }

    /// AI transform batch over existing page text.
    pub async fn process_with_ai(
        &self,
        pages: Vec<u32>,
        prompt: String,
        context_mode: bool,
        force: bool,
    ) -> Result<(), EngineError> {
        self.engine
            .process_ai(pages, prompt, context_mode, force)
            .await
            .map(|_| ())
    }

    /// Combined batch: recognize, then transform each page.
    pub async fn process_full(
        &self,
        pages: Vec<u32>,
        prompt: String,
        context_mode: bool,
        force: bool,
    ) -> Result<(), EngineError> {
        self.engine
            .process_ocr_ai(pages, prompt, context_mode, force)
            .await
            .map(|_| ())
    }

    /// Which of the selected pages already have a fresh OCR result.
    pub async fn check_processed(&self, pages: Vec<u32>) -> Result<ProcessedSplit, EngineError> {
        let desc = self.session.descriptor().await?;
        self.session.validate_pages(&pages).await?;
        let config = self.config.current();

        let mut processed = Vec::new();
        let mut unprocessed = Vec::new();
        for &page in &pages {
            let fp = fingerprint::ocr_fingerprint(
                &desc.content_id,
                page,
                &config.ai.ocr_model,
                prompts::OCR_PROMPT_TEMPLATE_ID,
            );
            let in_document = self.session.page(page).await?.processed;
            if in_document || self.cache.contains_fresh(&fp)? {
                processed.push(page);
            } else {
                unprocessed.push(page);
            }
        }
        Ok(ProcessedSplit {
            total: pages.len(),
            processed,
            unprocessed,
        })
    }

    /// Which of the selected pages already carry AI output.
    pub async fn check_ai_processed(
        &self,
        pages: Vec<u32>,
    ) -> Result<ProcessedSplit, EngineError> {
        self.session.validate_pages(&pages).await?;
        let mut processed = Vec::new();
        let mut unprocessed = Vec::new();
        for &page in &pages {
            if self.session.page(page).await?.ai_text.trim().is_empty() {
                unprocessed.push(page);
            } else {
                processed.push(page);
            }
        }
        Ok(ProcessedSplit {
            total: pages.len(),
            processed,
            unprocessed,
        })
    }

    /// Apply a user edit to a page's OCR or AI text.
    pub async fn update_page_text(
        &self,
        page: u32,
        kind: TextKind,
        text: String,
    ) -> Result<(), EngineError> {
        match kind {
            TextKind::Ocr => self.session.record_ocr_text(page, &text).await?,
            TextKind::Ai => self.session.record_ai_text(page, &text).await?,
        }
        self.events.publish(Event::PageTextUpdated {
            page_number: page,
            kind,
        });
        Ok(())
    }

    pub fn pause(&self) {
        self.engine.pause();
    }

    pub fn resume(&self) {
        self.engine.resume();
    }

    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Snapshot of the active (or idle) job state.
    pub fn job_state(&self) -> JobStateSnapshot {
        self.engine.job_state()
    }

    // ── Config surface ───────────────────────────────────────────────────

    pub fn get_config(&self) -> AppConfig {
        (*self.config.current()).clone()
    }

    /// Atomically swap the configuration, reconfigure the rate limiter, and
    /// persist to the config file.
    pub fn update_config(&self, config: AppConfig) -> Result<(), EngineError> {
        self.config.update(config.clone())?;
        self.limiter
            .update(config.request_interval(), config.ai.burst_limit);

        let serialized = serde_json::to_string_pretty(&config)
            .map_err(|e| EngineError::Internal(format!("config serialize: {e}")))?;
        atomic_write(&self.config_path, serialized.as_bytes())?;
        Ok(())
    }

    // ── History surface ──────────────────────────────────────────────────

    pub fn history_list(&self, limit: usize) -> Result<Vec<HistoryRecord>, EngineError> {
        self.history.list_recent(limit)
    }

    pub fn history_pages(&self, record_id: i64) -> Result<Vec<HistoryPage>, EngineError> {
        self.history.get_pages(record_id)
    }

    pub fn history_doc_pages(&self, document_path: &str) -> Result<Vec<HistoryPage>, EngineError> {
        self.history.get_all_pages(document_path)
    }

    pub fn history_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchMatch>, EngineError> {
        self.history.search(query, limit)
    }

    pub fn history_delete(&self, record_id: i64) -> Result<(), EngineError> {
        self.history.delete_record(record_id)?;
        self.events
            .publish(Event::HistoryRecordDeleted { record_id });
        Ok(())
    }

    // ── Platform surface ─────────────────────────────────────────────────

    /// Probe the platform; the report is both returned and published.
    pub fn check_system_dependencies(&self) -> DependencyReport {
        let report = probe::check_system_dependencies(&self.data_dir, self.renderer.temp_path());
        self.events.publish(Event::DependencyCheck {
            report: report.clone(),
        });
        report
    }

    /// Write text to the path the shell's save dialog chose. Atomic
    /// (temp + rename); returns the absolute path.
    pub fn save_text_file(&self, content: &str, target: &Path) -> Result<PathBuf, EngineError> {
        atomic_write(target, content.as_bytes())?;
        absolute(target)
    }

    /// Write base64-encoded binary content to the chosen path.
    pub fn save_binary_file(&self, base64_data: &str, target: &Path) -> Result<PathBuf, EngineError> {
        let bytes = BASE64
            .decode(base64_data.trim())
            .map_err(|e| EngineError::InvalidArgument(format!("invalid base64 payload: {e}")))?;
        atomic_write(target, &bytes)?;
        absolute(target)
    }

    /// Default file name for exporting the loaded document's text.
    pub async fn default_export_name(&self, extension: &str) -> Result<String, EngineError> {
        let snapshot = self.session.snapshot().await?;
        Ok(format!("{}.{}", snapshot.title, extension.trim_start_matches('.')))
    }

    pub fn app_version(&self) -> AppVersion {
        AppVersion {
            version: env!("CARGO_PKG_VERSION").to_string(),
            author: "pagesmith developers".to_string(),
            email: "dev@pagesmith.io".to_string(),
            copyright: "© 2026 pagesmith developers".to_string(),
            build_date: option_env!("PAGESMITH_BUILD_DATE").map(|s| s.to_string()),
        }
    }
}

/// Write a file via temp + rename so readers never observe a partial file.
fn atomic_write(target: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| EngineError::Io {
        path: parent.to_path_buf(),
        source: e,
    })?;
    let tmp = target.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(|e| EngineError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, target).map_err(|e| EngineError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, EngineError> {
    std::fs::canonicalize(path).map_err(|e| EngineError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
