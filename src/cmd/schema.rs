//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json,
    ocr::{DocumentStatistics, PageResult},
    policy::ProcessingPolicy,
    prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// One page of `extract` output.
    PageResult,
    /// A processing policy, as accepted by `--policy`.
    ProcessingPolicy,
    /// Output of `stats`.
    DocumentStatistics,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::PageResult => schema_for!(PageResult),
        SchemaType::ProcessingPolicy => schema_for!(ProcessingPolicy),
        SchemaType::DocumentStatistics => schema_for!(DocumentStatistics),
    };
    write_json(schema_opts.output_path.as_deref(), &schema).await
}
