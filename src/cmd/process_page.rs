//! The `process-page` subcommand.

use clap::Args;

use super::connect_tracker;
use crate::{
    io::{read_json_input, write_json_output},
    pipeline::{WorkStatus, pages::PageProcessor},
    prelude::*,
    stores::BackendOpts,
};

/// Process-page command line arguments.
#[derive(Debug, Args)]
pub struct ProcessPageOpts {
    /// A page request. Reads standard input if omitted.
    pub input_path: Option<PathBuf>,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `process-page` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process_page(opts: &ProcessPageOpts) -> Result<()> {
    let request = read_json_input::<Value>(opts.input_path.as_deref()).await?;
    let (backend, tracker) = connect_tracker(&opts.backend).await?;
    let processor = PageProcessor::new(
        backend.object_store()?,
        tracker,
        backend.resumer()?,
        backend.review_service()?,
    );
    let output = processor.process_request(&request).await;
    write_json_output(opts.output_path.as_deref(), &output).await?;
    if output.status != WorkStatus::Ok {
        return Err(anyhow!(
            "failed to process page request: {}",
            output.errors.join("; ")
        ));
    }
    Ok(())
}
