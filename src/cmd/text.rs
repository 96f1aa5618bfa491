//! The `text` subcommand.

use super::DocumentOpts;
use crate::{async_utils::io::write_text, prelude::*, ui::Ui};

/// The `text` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_text(ui: &Ui, opts: &DocumentOpts) -> Result<()> {
    let extractor = opts.extractor(ui).await?;
    let text = extractor.extract_as_text(opts.read_input().await?).await?;
    write_text(opts.output_path.as_deref(), &text).await
}
