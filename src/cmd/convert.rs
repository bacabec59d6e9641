//! The `convert` subcommand.

use std::sync::{Mutex, atomic::Ordering};

use clap::Args;
use indicatif::ProgressBar;

use crate::{
    pipeline::{Pipeline, ProgressSnapshot, RunOutcome, RunStatus},
    prelude::*,
    render::PopplerRenderer,
    ui::Ui,
    vision::VisionClient,
};

/// Options for the `convert` subcommand.
#[derive(Debug, Args)]
pub struct ConvertOpts {
    /// The scanned PDF to convert.
    pub input: PathBuf,

    /// Where to write the searchable PDF. Defaults to the input name
    /// with an `_OCR.pdf` suffix, next to the input.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    /// Google Cloud API key. Defaults to `GOOGLE_VISION_API_KEY`, which
    /// may be set in a `.env` file.
    #[clap(long)]
    pub api_key: Option<String>,

    /// Language hints passed to the recognition service. Repeatable.
    #[clap(long = "lang", default_values_t = vec!["es".to_string(), "en".to_string()])]
    pub languages: Vec<String>,

    /// How many times to retry a transient recognition failure per page.
    #[clap(long, default_value = "0")]
    pub max_retries: u32,
}

/// The `convert` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_convert(ui: Ui, opts: &ConvertOpts) -> Result<()> {
    let api_key = match &opts.api_key {
        Some(key) => key.clone(),
        None => std::env::var("GOOGLE_VISION_API_KEY").map_err(|_| {
            anyhow!(
                "no API key: pass --api-key or set GOOGLE_VISION_API_KEY \
                 (a `.env` file works too)"
            )
        })?,
    };
    let input_stem = opts
        .input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| anyhow!("cannot derive a name from {:?}", opts.input.display()))?;

    let renderer = PopplerRenderer::new(&opts.input);
    let recognizer = VisionClient::new(api_key, opts.languages.clone(), opts.max_retries)?;

    let mut pipeline = Pipeline::new(renderer, recognizer, input_stem)
        .with_observer(progress_observer(ui.clone()));

    // Ctrl-C requests cooperative cancellation; the run stops at the next
    // page boundary.
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::Relaxed);
        }
    });

    match pipeline.run().await? {
        RunOutcome::Done {
            bytes,
            suggested_name,
        } => {
            let output_path = opts
                .output_path
                .clone()
                .unwrap_or_else(|| opts.input.with_file_name(suggested_name));
            tokio::fs::write(&output_path, &bytes)
                .await
                .with_context(|| {
                    format!("failed to write output to {:?}", output_path.display())
                })?;
            info!(
                "Wrote {} ({} pages, {} recognized)",
                output_path.display(),
                pipeline.run_state().snapshot().pages_total,
                pipeline.run_state().snapshot().pages_recognized_so_far,
            );
            Ok(())
        }
        RunOutcome::Cancelled => {
            warn!("Cancelled; no output written");
            Ok(())
        }
    }
}

/// Map pipeline snapshots onto an indicatif bar: a spinner per stage,
/// upgraded to a real bar once we know how many pages need recognition.
fn progress_observer(ui: Ui) -> impl Fn(ProgressSnapshot) + Send + 'static {
    let bar: Mutex<Option<ProgressBar>> = Mutex::new(None);
    move |snapshot| {
        let mut guard = bar.lock().expect("progress bar mutex poisoned");
        match snapshot.status {
            RunStatus::RecognizingPages if snapshot.pages_requiring_recognition > 0 => {
                // Replace any stage spinner with a real bar.
                if guard.as_ref().is_none_or(|pb| pb.length().is_none()) {
                    if let Some(spinner) = guard.take() {
                        spinner.finish_and_clear();
                    }
                    *guard = Some(ui.new_progress_bar(
                        "Recognizing pages",
                        snapshot.pages_requiring_recognition as u64,
                    ));
                }
                if let Some(pb) = guard.as_ref() {
                    pb.set_position(snapshot.pages_recognized_so_far as u64);
                }
            }
            status if status.is_terminal() => {
                if let Some(pb) = guard.take() {
                    pb.finish_and_clear();
                }
            }
            _ => {
                if guard.is_none() && !matches!(snapshot.status, RunStatus::Idle) {
                    // Keep a lightweight spinner during the other stages.
                    let sp = ui.new_spinner(&snapshot.status.to_string());
                    *guard = Some(sp);
                } else if let Some(pb) = guard.as_ref() {
                    pb.set_message(snapshot.status.to_string());
                }
            }
        }
    }
}
