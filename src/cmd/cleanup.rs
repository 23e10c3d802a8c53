//! The `cleanup` subcommand.

use clap::Args;

use crate::{
    io::write_json_output,
    pipeline::cleanup,
    prelude::*,
    stores::{BackendOpts, ObjectUri},
};

/// Cleanup command line arguments.
#[derive(Debug, Args)]
pub struct CleanupOpts {
    /// The bucket holding the document's artifacts.
    #[clap(long)]
    pub bucket: String,

    /// The document whose artifacts should be deleted.
    pub document_id: String,

    /// Also delete the output folder of this extraction job.
    #[clap(long, value_name = "URI")]
    pub job_metadata: Option<ObjectUri>,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `cleanup` subcommand.
#[instrument(level = "debug", skip_all, fields(document_id = %opts.document_id))]
pub async fn cmd_cleanup(opts: &CleanupOpts) -> Result<()> {
    let backend = opts.backend.connect().await?;
    let objects = backend.object_store()?;
    let output = cleanup(
        objects.as_ref(),
        &opts.bucket,
        &opts.document_id,
        opts.job_metadata.as_ref(),
    )
    .await?;
    write_json_output(opts.output_path.as_deref(), &output).await
}
