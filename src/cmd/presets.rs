//! The `presets` subcommand.

use clap::Args;

use crate::{async_utils::io::write_text, policy::Preset, prelude::*};

/// Presets command line arguments.
#[derive(Debug, Args)]
pub struct PresetsOpts {
    /// Print each preset's full policy as JSON instead of a summary.
    #[clap(long)]
    pub json: bool,

    /// The output path to write to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `presets` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_presets(opts: &PresetsOpts) -> Result<()> {
    let output = if opts.json {
        let policies = Preset::ALL
            .iter()
            .map(|&preset| -> Result<(String, Value)> {
                Ok((preset.name().to_owned(), serde_json::to_value(preset.policy())?))
            })
            .collect::<Result<serde_json::Map<_, _>>>()?;
        serde_json::to_string_pretty(&policies).context("failed to serialize presets")?
    } else {
        Preset::ALL
            .iter()
            .map(|&preset| {
                let kind = if preset.policy().receipt_mode {
                    "receipt"
                } else {
                    "general"
                };
                format!("{:<24} {:<8} {}", preset.name(), kind, preset.description())
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    write_text(opts.output_path.as_deref(), &output).await
}
