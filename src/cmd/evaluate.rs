//! The `evaluate` subcommand.

use clap::Args;

use crate::{
    confidence::{DEFAULT_CONFIDENCE_THRESHOLD, evaluate_segment},
    io::write_json_output,
    prelude::*,
    stores::{BackendOpts, ObjectUri},
};

/// Evaluate command line arguments.
#[derive(Debug, Args)]
pub struct EvaluateOpts {
    /// The segment's extraction artifact, as an `s3://` URI.
    pub segment_uri: ObjectUri,

    /// The source document, used as the review target.
    #[clap(long, value_name = "URI")]
    pub document: Option<ObjectUri>,

    /// Fields below this confidence need review.
    #[clap(
        long,
        env = "CONFIDENCE_THRESHOLD",
        default_value_t = DEFAULT_CONFIDENCE_THRESHOLD
    )]
    pub confidence_threshold: f64,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `evaluate` subcommand.
#[instrument(level = "debug", skip_all, fields(segment_uri = %opts.segment_uri))]
pub async fn cmd_evaluate(opts: &EvaluateOpts) -> Result<()> {
    let backend = opts.backend.connect().await?;
    let objects = backend.object_store()?;
    let evaluation = evaluate_segment(
        objects.as_ref(),
        &opts.segment_uri,
        opts.confidence_threshold,
        opts.document.as_ref(),
    )
    .await;
    info!(
        needs_review = evaluation.needs_review,
        page_index = evaluation.page_index,
        "Evaluated segment"
    );
    write_json_output(opts.output_path.as_deref(), &evaluation).await
}
