//! Command-line entry points.

use std::sync::Arc;

use clap::Args;

use crate::{
    async_utils::io::{read_bytes_or_stdin, read_json_or_toml},
    ocr::{Extractor, engines::tesseract::TesseractEngine},
    policy::ProcessingPolicy,
    prelude::*,
    raster::PopplerRasterizer,
    ui::Ui,
};

pub mod extract;
pub mod presets;
pub mod schema;
pub mod stats;
pub mod text;

/// Options for choosing and tuning the processing policy.
#[derive(Debug, Clone, Args)]
pub struct PolicyOpts {
    /// Preset to start from. Run the `presets` subcommand for a list.
    #[clap(long, default_value = "default")]
    preset: String,

    /// JSON or TOML file with policy fields to override.
    #[clap(long = "policy", value_name = "FILE")]
    policy_path: Option<PathBuf>,

    /// Tesseract language(s), for example `por` or `por+eng`.
    #[clap(long)]
    language: Option<String>,

    /// Resolution used to render PDF pages.
    #[clap(long)]
    dpi: Option<u32>,

    /// Max number of pages to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "1")]
    job_count: usize,
}

impl PolicyOpts {
    /// Build the policy: preset, then override file, then individual flags.
    pub async fn resolve(&self) -> Result<ProcessingPolicy> {
        let mut policy = ProcessingPolicy::for_preset(&self.preset);
        if let Some(path) = &self.policy_path {
            let overrides = read_json_or_toml(path).await?;
            policy = policy
                .with_overrides(overrides)
                .with_context(|| format!("invalid policy file {:?}", path.display()))?;
        }
        if let Some(language) = &self.language {
            policy.language = language.clone();
        }
        if let Some(dpi) = self.dpi {
            policy.dpi = dpi;
        }
        debug!(?policy, "Resolved policy");
        Ok(policy)
    }
}

/// Options shared by subcommands that OCR a document.
#[derive(Debug, Args)]
pub struct DocumentOpts {
    /// Input PDF or image. Reads standard input if omitted.
    input_path: Option<PathBuf>,

    #[clap(flatten)]
    policy: PolicyOpts,

    /// Output path. Writes to standard output if omitted.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

impl DocumentOpts {
    /// Read the input document.
    pub async fn read_input(&self) -> Result<Vec<u8>> {
        read_bytes_or_stdin(self.input_path.as_deref()).await
    }

    /// Build an [`Extractor`] using Poppler and Tesseract.
    pub async fn extractor(&self, ui: &Ui) -> Result<Extractor> {
        let policy = self.policy.resolve().await?;
        let document = self
            .input_path
            .as_deref()
            .and_then(Path::file_name)
            .map_or_else(|| "stdin".to_owned(), |name| name.to_string_lossy().into_owned());
        let pb = ui.page_progress(&document);
        Ok(Extractor::new(
            policy,
            Arc::new(PopplerRasterizer),
            Arc::new(TesseractEngine::new()),
        )
        .with_page_concurrency(self.policy.job_count)
        .with_progress(pb))
    }
}
