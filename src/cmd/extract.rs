//! The `extract` subcommand.

use super::DocumentOpts;
use crate::{async_utils::io::write_json, prelude::*, ui::Ui};

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: &Ui, opts: &DocumentOpts) -> Result<()> {
    let extractor = opts.extractor(ui).await?;
    let pages = extractor.extract(opts.read_input().await?).await?;
    write_json(opts.output_path.as_deref(), &pages).await
}
