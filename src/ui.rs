//! Terminal UI: progress bars, and keeping them out of the way of logs.
//!
//! The suspend-on-write pattern here is adapted from `substudy` by Eric
//! Kidd, which is licensed under Apache-2.0 OR MIT. Used with permission.

use std::{io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    /// Our progress bars, shared so log output can suspend them.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI.
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// Get a writer for stderr that cooperates with the progress bars,
    /// for use with `tracing`.
    pub fn stderr_writer(&self) -> UiStderrWriter {
        UiStderrWriter { ui: self.clone() }
    }

    /// Create a progress bar with our default style.
    pub fn new_progress_bar(&self, msg: &str, len: u64) -> ProgressBar {
        let pb = ProgressBar::new(len).with_style(progress_style());
        let pb = self.multi_progress.add(pb);
        pb.set_message(msg.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb
    }

    /// Create a spinner for stages without a known length.
    pub fn new_spinner(&self, msg: &str) -> ProgressBar {
        let sp = ProgressBar::new_spinner().with_style(spinner_style());
        let sp = self.multi_progress.add(sp);
        sp.set_message(msg.to_owned());
        sp.enable_steady_tick(Duration::from_millis(250));
        sp
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg:25} {pos:>4}/{len:4} {wide_bar:.cyan/blue} {elapsed_precise}")
        .expect("bad progress bar template")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {msg}")
        .expect("bad spinner template")
}

/// A stderr writer that suspends the progress bars while writing, so log
/// lines and bars don't scribble over each other.
#[derive(Clone)]
pub struct UiStderrWriter {
    ui: Ui,
}

impl io::Write for UiStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress
            .suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for UiStderrWriter {
    type Writer = UiStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
