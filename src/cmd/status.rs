//! The `status` subcommand.

use clap::Args;

use super::connect_tracker;
use crate::{io::write_json_output, prelude::*, stores::BackendOpts};

/// Status command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// The document to check.
    pub document_id: String,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all, fields(document_id = %opts.document_id))]
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let (_backend, tracker) = connect_tracker(&opts.backend).await?;
    let completion = tracker.query_document_completion(&opts.document_id).await?;
    write_json_output(opts.output_path.as_deref(), &completion).await
}
