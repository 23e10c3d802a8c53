//! The `human-complete` subcommand.

use clap::Args;

use super::connect_tracker;
use crate::{
    io::{read_json_input, write_json_output},
    pipeline::review::{HumanCompletionHandler, HumanLoopEvent},
    prelude::*,
    stores::BackendOpts,
};

/// Human-complete command line arguments.
#[derive(Debug, Args)]
pub struct HumanCompleteOpts {
    /// A review status-change event. Reads standard input if omitted.
    pub input_path: Option<PathBuf>,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `human-complete` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_human_complete(opts: &HumanCompleteOpts) -> Result<()> {
    let event = read_json_input::<HumanLoopEvent>(opts.input_path.as_deref()).await?;
    let (backend, tracker) = connect_tracker(&opts.backend).await?;
    let handler = HumanCompletionHandler::new(
        backend.object_store()?,
        tracker,
        backend.resumer()?,
        backend.claim_aggregation(),
    );
    let output = handler.handle(&event).await?;
    write_json_output(opts.output_path.as_deref(), &output).await
}
