//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    aggregate::{AggregateOutput, AggregateRequest, HumanResponses},
    confidence::ConfidenceEvaluation,
    fields::Flattened,
    io::write_json_output,
    pipeline::{
        pages::{PageRequest, PageRequestOutput, ReviewContext},
        review::{HumanCompletionOutput, HumanLoopEvent, HumanPageOutput},
    },
    prelude::*,
    tracker::{DocumentCompletion, PageRecord},
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// Output of `flatten`.
    Flattened,
    /// Output of `evaluate`.
    ConfidenceEvaluation,
    /// Input of `process-page`.
    PageRequest,
    /// Output of `process-page`.
    PageRequestOutput,
    /// What a reviewer saw for one page.
    ReviewContext,
    /// Input of `human-complete`.
    HumanLoopEvent,
    /// Output of `human-complete`.
    HumanCompletionOutput,
    /// A reviewed page.
    HumanPageOutput,
    /// A page record in the state store.
    PageRecord,
    /// Output of `status`.
    DocumentCompletion,
    /// Input of `aggregate`.
    AggregateRequest,
    /// Output of `aggregate`.
    AggregateOutput,
    /// Merged human responses written by `aggregate`.
    HumanResponses,
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
        SchemaType::Flattened => schema_for!(Flattened),
        SchemaType::ConfidenceEvaluation => schema_for!(ConfidenceEvaluation),
        SchemaType::PageRequest => schema_for!(PageRequest),
        SchemaType::PageRequestOutput => schema_for!(PageRequestOutput),
        SchemaType::ReviewContext => schema_for!(ReviewContext),
        SchemaType::HumanLoopEvent => schema_for!(HumanLoopEvent),
        SchemaType::HumanCompletionOutput => schema_for!(HumanCompletionOutput),
        SchemaType::HumanPageOutput => schema_for!(HumanPageOutput),
        SchemaType::PageRecord => schema_for!(PageRecord),
        SchemaType::DocumentCompletion => schema_for!(DocumentCompletion),
        SchemaType::AggregateRequest => schema_for!(AggregateRequest),
        SchemaType::AggregateOutput => schema_for!(AggregateOutput),
        SchemaType::HumanResponses => schema_for!(HumanResponses),
    };
    write_json_output(schema_opts.output_path.as_deref(), &schema).await
}
