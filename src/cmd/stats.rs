//! The `stats` subcommand.

use super::DocumentOpts;
use crate::{async_utils::io::write_json, prelude::*, ui::Ui};

/// The `stats` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_stats(ui: &Ui, opts: &DocumentOpts) -> Result<()> {
    let extractor = opts.extractor(ui).await?;
    let stats = extractor.statistics(opts.read_input().await?).await?;
    info!(
        pages = stats.total_pages,
        errors = stats.pages_with_errors,
        success_rate = stats.success_rate,
        "Document processed"
    );
    write_json(opts.output_path.as_deref(), &stats).await
}
