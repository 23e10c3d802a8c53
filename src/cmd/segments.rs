//! The `segments` subcommand.

use clap::Args;

use crate::{
    io::write_json_output,
    pipeline::segments::find_segments,
    prelude::*,
    stores::{BackendOpts, ObjectUri},
};

/// Segments command line arguments.
#[derive(Debug, Args)]
pub struct SegmentsOpts {
    /// The extraction job's `job_metadata.json`, as an `s3://` URI.
    pub job_metadata_uri: ObjectUri,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `segments` subcommand. Problems reading the metadata are reported in
/// the output, not as an error.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_segments(opts: &SegmentsOpts) -> Result<()> {
    let backend = opts.backend.connect().await?;
    let objects = backend.object_store()?;
    let output = find_segments(objects.as_ref(), &opts.job_metadata_uri).await;
    write_json_output(opts.output_path.as_deref(), &output).await
}
