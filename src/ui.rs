//! Terminal output: a per-document page progress bar, and a stderr writer
//! that keeps log lines from tearing it.
//!
//! The progress-bar/log interplay is adapted from `substudy` by Eric Kidd,
//! which is licensed under Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};

/// Layout of the page progress bar. `{prefix}` holds the document name.
const PAGE_PROGRESS_TEMPLATE: &str =
    "  {spinner:.green} {prefix:24} page {pos:>4}/{len:4} [{elapsed_precise}] {wide_bar:.cyan/blue} {eta}";

/// Shared terminal state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    bars: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            bars: Arc::new(MultiProgress::new()),
        }
    }

    /// Stop drawing progress entirely. Used when page results go to stdout.
    pub fn hide_progress_bars(&self) {
        self.bars.set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A writer for `tracing` that suspends the progress bars around each
    /// write.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Progress over the pages of one document. The length starts at zero and
    /// is set by the extractor once the page count is known.
    pub fn page_progress(&self, document: &str) -> ProgressBar {
        let bar = self.bars.add(ProgressBar::new(0).with_style(page_progress_style()));
        bar.set_prefix(document.to_owned());
        bar.enable_steady_tick(Duration::from_millis(250));
        bar.with_finish(ProgressFinish::WithMessage(Cow::Borrowed("done")))
    }
}

fn page_progress_style() -> ProgressStyle {
    ProgressStyle::with_template(PAGE_PROGRESS_TEMPLATE).expect("bad page progress template")
}

/// Writes to `stderr` with the progress bars suspended, so log lines never
/// interleave with a half-drawn bar.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.bars.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.bars.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.bars.suspend(|| io::stderr().flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
