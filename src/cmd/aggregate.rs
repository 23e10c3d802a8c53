//! The `aggregate` subcommand.

use clap::Args;

use crate::{
    aggregate::{AggregateRequest, ResultAggregator},
    io::{read_json_input, write_json_output},
    pipeline::WorkStatus,
    prelude::*,
    stores::BackendOpts,
};

/// Aggregate command line arguments.
#[derive(Debug, Args)]
pub struct AggregateOpts {
    /// An aggregation request. Reads standard input if omitted.
    pub input_path: Option<PathBuf>,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `aggregate` subcommand. Partial results still succeed; only a document
/// with nothing to aggregate is an error.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_aggregate(opts: &AggregateOpts) -> Result<()> {
    let request = read_json_input::<AggregateRequest>(opts.input_path.as_deref()).await?;
    let backend = opts.backend.connect().await?;
    let aggregator = ResultAggregator::new(backend.object_store()?);
    let output = aggregator.aggregate(&request).await;
    write_json_output(opts.output_path.as_deref(), &output).await?;
    if output.status == WorkStatus::Failed {
        return Err(anyhow!(
            "failed to aggregate {}: {}",
            request.id,
            output.errors.join("; ")
        ));
    }
    Ok(())
}
