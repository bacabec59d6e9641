//! The end-to-end conversion pipeline.
//!
//! A single sequential driver loop advances an explicit state machine
//! across all pages: analyze, render, recognize, compose, assemble.
//! Cancellation is cooperative and polled at every stage transition and
//! every per-page iteration; the mutable [`ConversionRun`] state is only
//! ever written here.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use lopdf::content::Operation;

use crate::{
    analyze::{PageAnalysis, analyze_page},
    authoring::SearchablePdfBuilder,
    compose::compose_text_layer,
    prelude::*,
    render::{PageRenderer, PageTransform, RENDER_SCALE, Raster},
    vision::{RecognitionService, RecognizeError},
};

/// Suffix appended to the input file stem for the suggested output name.
const OUTPUT_SUFFIX: &str = "_OCR.pdf";

/// Maximum number of log entries retained in a run.
const LOG_CAP: usize = 200;

/// Where the state machine currently is. Transitions are strictly
/// forward; the only way back to `Idle` is a reset, which starts a fresh
/// [`ConversionRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    LoadingResources,
    ReadingDocument,
    AnalyzingPages,
    RecognizingPages,
    GeneratingOutput,
    Done,
    Error,
    Cancelled,
}

impl RunStatus {
    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::Error | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Idle => "idle",
            RunStatus::LoadingResources => "loading resources",
            RunStatus::ReadingDocument => "reading document",
            RunStatus::AnalyzingPages => "analyzing pages",
            RunStatus::RecognizingPages => "recognizing pages",
            RunStatus::GeneratingOutput => "generating output",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// Read-only view of a run's progress, handed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub status: RunStatus,
    pub pages_total: usize,
    pub pages_with_embedded_text: usize,
    pub pages_requiring_recognition: usize,
    pub pages_recognized_so_far: usize,
}

/// Mutable state of one end-to-end pipeline execution.
pub struct ConversionRun {
    status: RunStatus,
    pages_total: usize,
    pages_with_embedded_text: usize,
    pages_requiring_recognition: usize,
    pages_recognized_so_far: usize,
    log: VecDeque<String>,
    /// Set once by the caller, never cleared within a run.
    cancel: Arc<AtomicBool>,
}

impl ConversionRun {
    fn new() -> Self {
        Self {
            status: RunStatus::Idle,
            pages_total: 0,
            pages_with_embedded_text: 0,
            pages_requiring_recognition: 0,
            pages_recognized_so_far: 0,
            log: VecDeque::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take a read-only snapshot of the run's progress.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            status: self.status,
            pages_total: self.pages_total,
            pages_with_embedded_text: self.pages_with_embedded_text,
            pages_requiring_recognition: self.pages_requiring_recognition,
            pages_recognized_so_far: self.pages_recognized_so_far,
        }
    }

    /// The append-only log, oldest first.
    pub fn log_entries(&self) -> impl Iterator<Item = &str> {
        self.log.iter().map(String::as_str)
    }

    fn push_log(&mut self, entry: String) {
        info!("{entry}");
        if self.log.len() == LOG_CAP {
            self.log.pop_front();
        }
        self.log.push_back(entry);
    }
}

/// How a run can fail. Only failures that abort the whole run appear
/// here; a transient recognition failure degrades a single page and is
/// logged instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("rendering tools are unavailable: {0}")]
    Resources(#[source] anyhow::Error),

    #[error("failed to read input document: {0}")]
    DocumentRead(#[source] anyhow::Error),

    #[error("failed to rasterize page {page}: {source}")]
    Rasterization {
        page: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A configuration-class recognition failure. These recur identically
    /// on every page, so we fail fast instead of burning quota.
    #[error(transparent)]
    Recognition(#[from] RecognizeError),

    #[error("failed to assemble output document: {0}")]
    Assembly(#[source] anyhow::Error),
}

/// How a run can end without failing.
#[derive(Debug)]
pub enum RunOutcome {
    /// The output document, plus a suggested filename derived from the
    /// input name.
    Done {
        bytes: Vec<u8>,
        suggested_name: String,
    },
    /// Cancellation was observed; no output was produced.
    Cancelled,
}

/// A page's contribution to the output document, retained between the
/// recognition stage and final assembly. The encoded image sticks
/// around; no decoded bitmap does.
struct ComposedPage {
    raster: Raster,
    transform: PageTransform,
    text_ops: Vec<Operation>,
}

/// Drives one conversion from input PDF to searchable output.
pub struct Pipeline<R, S> {
    renderer: R,
    recognizer: S,
    /// Input file stem, used for the suggested output name.
    input_stem: String,
    run: ConversionRun,
    observer: Option<Box<dyn Fn(ProgressSnapshot) + Send>>,
}

impl<R: PageRenderer, S: RecognitionService> Pipeline<R, S> {
    pub fn new(renderer: R, recognizer: S, input_stem: impl Into<String>) -> Self {
        Self {
            renderer,
            recognizer,
            input_stem: input_stem.into(),
            run: ConversionRun::new(),
            observer: None,
        }
    }

    /// Register a callback invoked with a fresh snapshot at every
    /// checkpoint (stage transitions and per-page progress).
    pub fn with_observer(
        mut self,
        observer: impl Fn(ProgressSnapshot) + Send + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// The cancellation flag for this run. Setting it ends the run at
    /// the next checkpoint, without a partial page write.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.run.cancel.clone()
    }

    /// The current run's state.
    pub fn run_state(&self) -> &ConversionRun {
        &self.run
    }

    /// Discard the current run and return to `Idle` with a fresh
    /// [`ConversionRun`] and a fresh cancellation flag.
    pub fn reset(&mut self) {
        self.run = ConversionRun::new();
        self.notify();
    }

    /// Execute the full state machine.
    #[instrument(level = "debug", skip_all)]
    pub async fn run(&mut self) -> Result<RunOutcome, PipelineError> {
        let result = self.run_stages().await;
        match &result {
            Ok(RunOutcome::Done { .. }) => {}
            Ok(RunOutcome::Cancelled) => {
                self.enter(RunStatus::Cancelled);
                self.log("Cancelled".to_string());
            }
            Err(err) => {
                self.enter(RunStatus::Error);
                self.log(format!("Run failed: {err}"));
            }
        }
        result
    }

    async fn run_stages(&mut self) -> Result<RunOutcome, PipelineError> {
        self.enter(RunStatus::LoadingResources);
        self.renderer
            .prepare()
            .await
            .map_err(PipelineError::Resources)?;
        if self.cancel_requested() {
            return Ok(RunOutcome::Cancelled);
        }

        self.enter(RunStatus::ReadingDocument);
        let pages_total = self
            .renderer
            .page_count()
            .await
            .map_err(PipelineError::DocumentRead)?;
        if pages_total == 0 {
            return Err(PipelineError::DocumentRead(anyhow!(
                "document has no pages"
            )));
        }
        self.run.pages_total = pages_total;
        self.log(format!("Document: {pages_total} pages"));
        if self.cancel_requested() {
            return Ok(RunOutcome::Cancelled);
        }

        self.enter(RunStatus::AnalyzingPages);
        let mut analyses = Vec::with_capacity(pages_total);
        for page_no in 1..=pages_total {
            if self.cancel_requested() {
                return Ok(RunOutcome::Cancelled);
            }
            let text = self
                .renderer
                .embedded_text(page_no)
                .await
                .map_err(PipelineError::DocumentRead)?;
            analyses.push(analyze_page(&text));
        }
        // Totals are computed exactly once, when analysis completes.
        self.run.pages_with_embedded_text =
            analyses.iter().filter(|a| !a.needs_recognition).count();
        self.run.pages_requiring_recognition =
            pages_total - self.run.pages_with_embedded_text;
        self.log(format!(
            "{} pages with embedded text, {} need recognition",
            self.run.pages_with_embedded_text, self.run.pages_requiring_recognition
        ));
        self.notify();

        self.enter(RunStatus::RecognizingPages);
        let mut composed = Vec::with_capacity(pages_total);
        for (page_no, analysis) in (1..=pages_total).zip(&analyses) {
            if self.cancel_requested() {
                return Ok(RunOutcome::Cancelled);
            }
            composed.push(self.process_page(page_no, *analysis).await?);
            self.notify();
        }
        if self.cancel_requested() {
            return Ok(RunOutcome::Cancelled);
        }

        self.enter(RunStatus::GeneratingOutput);
        let mut builder = SearchablePdfBuilder::new();
        for page in &composed {
            if self.cancel_requested() {
                return Ok(RunOutcome::Cancelled);
            }
            builder
                .add_page(&page.raster, &page.transform, page.text_ops.clone())
                .map_err(PipelineError::Assembly)?;
        }
        let bytes = builder.finish().map_err(PipelineError::Assembly)?;
        self.log(format!("Output: {} bytes", bytes.len()));
        self.enter(RunStatus::Done);
        Ok(RunOutcome::Done {
            bytes,
            suggested_name: format!("{}{}", self.input_stem, OUTPUT_SUFFIX),
        })
    }

    /// Render one page and, if it needs recognition, OCR and compose its
    /// text layer. A transient recognition failure degrades the page to
    /// image-only; everything else aborts the run.
    async fn process_page(
        &mut self,
        page_no: usize,
        analysis: PageAnalysis,
    ) -> Result<ComposedPage, PipelineError> {
        let raster = self
            .renderer
            .render_page(page_no)
            .await
            .map_err(|source| PipelineError::Rasterization {
                page: page_no,
                source,
            })?;
        let transform = PageTransform::new(&raster, RENDER_SCALE);

        let text_ops = if analysis.needs_recognition {
            match self.recognizer.recognize(&raster).await {
                Ok(words) => {
                    self.run.pages_recognized_so_far += 1;
                    self.log(format!("Page {page_no}: {} words", words.len()));
                    compose_text_layer(&words, &transform)
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    self.log(format!(
                        "Page {page_no}: recognition failed, keeping image only ({err})"
                    ));
                    Vec::new()
                }
            }
        } else {
            self.log(format!(
                "Page {page_no}: has embedded text ({} chars), skipping",
                analysis.embedded_text_len
            ));
            Vec::new()
        };

        Ok(ComposedPage {
            raster,
            transform,
            text_ops,
        })
    }

    fn cancel_requested(&self) -> bool {
        self.run.cancel.load(Ordering::Relaxed)
    }

    fn enter(&mut self, status: RunStatus) {
        debug!(from = %self.run.status, to = %status, "stage transition");
        self.run.status = status;
        self.notify();
    }

    fn log(&mut self, entry: String) {
        self.run.push_log(entry);
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer(self.run.snapshot());
        }
    }
}
