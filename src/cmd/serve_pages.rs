//! The `serve-pages` subcommand.

use clap::Args;

use super::connect_tracker;
use crate::{
    io::write_json_output,
    pipeline::pages::{PageProcessor, ServeOpts, serve_pages},
    prelude::*,
    stores::BackendOpts,
    ui::Ui,
};

/// Serve-pages command line arguments.
#[derive(Debug, Args)]
pub struct ServePagesOpts {
    /// Max number of requests to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// Exit once the queue is empty, instead of waiting for more requests.
    #[clap(long)]
    pub until_empty: bool,

    #[clap(flatten)]
    pub backend: BackendOpts,

    /// Where to write a summary on exit. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `serve-pages` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve_pages(ui: Ui, opts: &ServePagesOpts) -> Result<()> {
    let (backend, tracker) = connect_tracker(&opts.backend).await?;
    let processor = PageProcessor::new(
        backend.object_store()?,
        tracker,
        backend.resumer()?,
        backend.review_service()?,
    );
    let summary = serve_pages(
        &ui,
        backend.queue()?,
        processor,
        ServeOpts {
            jobs: opts.job_count,
            until_empty: opts.until_empty,
        },
    )
    .await?;
    info!(
        received = summary.received,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Stopped serving page requests"
    );
    write_json_output(opts.output_path.as_deref(), &summary).await
}
