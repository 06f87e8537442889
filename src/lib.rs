//! # pagesmith
//!
//! A concurrent, cancellable, cache-aware OCR processing engine for
//! multi-page documents (PDF and single-page raster images) backed by a
//! remote vision language model.
//!
//! ## Why this crate?
//!
//! Scanned documents and image-heavy PDFs carry no usable text layer, and
//! classic OCR stacks stumble over layout, tables, and mixed scripts.
//! pagesmith renders each page to an image, lets a vision model read it,
//! optionally runs a user-directed text transformation (correction,
//! summary, translation) over the result, and remembers everything: a
//! content-addressed cache makes re-runs free and a searchable history
//! store keeps every artifact of every run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Load      establish identity + page count (no rendering)
//!  ├─ 2. Select    shell picks pages, engine spawns one batch job
//!  ├─ 3. Cache     fingerprint lookup; hits short-circuit the page
//!  ├─ 4. Render    pdfium → extracted mini-PDF → placeholder
//!  ├─ 5. OCR       rate-limited, retrying vision-model call
//!  ├─ 6. AI        optional transform with adjacent-page context
//!  └─ 7. Persist   document + cache + history; events to the shell
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagesmith::{AppConfig, RequestFacade};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let facade = RequestFacade::builder("./data")
//!         .config(AppConfig::default())
//!         .build()?;
//!
//!     let mut events = facade.subscribe();
//!     let doc = facade.load_document("scan.pdf".as_ref()).await?;
//!     facade
//!         .process_pages((1..=doc.page_count).collect(), false)
//!         .await?;
//!
//!     loop {
//!         match events.recv().await {
//!             pagesmith::Event::PageProcessed { page_number, from_cache } => {
//!                 eprintln!("page {page_number} done (cached: {from_cache})");
//!             }
//!             pagesmith::Event::ProcessingComplete { processed, total } => {
//!                 eprintln!("{processed}/{total} pages recognized");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagesmith` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pagesmith = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod client;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod facade;
pub mod fingerprint;
pub mod history;
pub mod limiter;
pub mod probe;
pub mod prompts;
pub mod render;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{Cache, CacheEntry, CacheKind};
pub use client::{AdjacentContext, HttpModelClient, ModelApi, ModelError, ModelOutput};
pub use config::{AiConfig, AppConfig, ConfigHandle, StorageConfig};
pub use document::{Document, DocumentKind, DocumentSession, DocumentSnapshot, Page, TextKind};
pub use engine::job::{JobMode, JobStateSnapshot};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, PageFailure};
pub use events::{DependencyReport, DependencyStatus, Event, EventBus, JobStatus, Subscriber};
pub use facade::{AppVersion, FacadeBuilder, ProcessedSplit, RequestFacade};
pub use history::{HistoryPage, HistoryRecord, HistoryStore, RecordStatus, SearchMatch};
pub use limiter::RateLimiter;
pub use render::{RenderBackend, RenderedPage, Renderer};
