use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod cpu_limit;
mod imaging;
mod ocr;
mod policy;
mod prelude;
mod raster;
mod toml_utils;
mod ui;

/// OCR scanned invoices and receipts, even when they're skewed, faded or
/// signed over.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Requirements:
  - `tesseract` (with the language data you ask for) must be on `PATH`.
  - `pdfinfo` and `pdftocairo` from poppler-utils are needed for PDF input.

Environment Variables:
  - RUST_LOG (optional): Logging filter, for example `fiscal_ocr=debug`.
  - TESSDATA_PREFIX (optional): Where tesseract looks for language data.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR a PDF or image and print per-page results as JSON.
    Extract(cmd::DocumentOpts),
    /// OCR a PDF or image and print the text, with page break markers.
    Text(cmd::DocumentOpts),
    /// OCR a PDF or image and print document statistics as JSON.
    Stats(cmd::DocumentOpts),
    /// List the available processing presets.
    Presets(cmd::presets::PresetsOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Extract(opts) | Cmd::Text(opts) | Cmd::Stats(opts) => {
                opts.output_path.is_none()
            }
            Cmd::Presets(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Extract(opts) => cmd::extract::cmd_extract(&ui, opts).await,
        Cmd::Text(opts) => cmd::text::cmd_text(&ui, opts).await,
        Cmd::Stats(opts) => cmd::stats::cmd_stats(&ui, opts).await,
        Cmd::Presets(opts) => cmd::presets::cmd_presets(opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
