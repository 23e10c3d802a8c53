use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod aggregate;
mod aws;
mod cmd;
mod confidence;
mod fields;
mod io;
mod pipeline;
mod prelude;
mod retry;
mod stores;
mod tracker;
mod ui;

/// Track human review of multi-page documents, and reassemble the results.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - REVIEW_BACKEND: `aws` (default) or `local`.
  - REVIEW_LOCAL_ROOT: Directory used by the `local` backend.
  - REVIEW_VISIBILITY_TIMEOUT: Seconds before the `local` queue
    redelivers an undeleted message (default 300).
  - DDB_TABLENAME, DDB_DOCUMENT_INDEX: Page-record table and index.
  - SQS_URL: Queue delivering page requests.
  - HUMAN_WORKFLOW_ARN: Human review flow definition.
  - CONFIDENCE_THRESHOLD: Fields below this need review (default 0.7).
  - RUST_LOG: Log filter (default `info`).

  Standard AWS environment variables and credential files
  are used for the `aws` backend.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Flatten an extraction result into reviewable fields.
    Flatten(cmd::flatten::FlattenOpts),
    /// Decide whether one segment needs human review.
    Evaluate(cmd::evaluate::EvaluateOpts),
    /// List the matching segments of an extraction job.
    Segments(cmd::segments::SegmentsOpts),
    /// Process one page request.
    ProcessPage(cmd::process_page::ProcessPageOpts),
    /// Process page requests from the queue.
    ServePages(cmd::serve_pages::ServePagesOpts),
    /// Handle a human review status-change event.
    HumanComplete(cmd::human_complete::HumanCompleteOpts),
    /// Show whether every page of a document has been reviewed.
    Status(cmd::status::StatusOpts),
    /// Combine every page's results into document-level outputs.
    Aggregate(cmd::aggregate::AggregateOpts),
    /// Delete a document's intermediate artifacts.
    Cleanup(cmd::cleanup::CleanupOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Flatten(opts) => opts.output_path.is_none(),
            Cmd::Evaluate(opts) => opts.output_path.is_none(),
            Cmd::Segments(opts) => opts.output_path.is_none(),
            Cmd::ProcessPage(opts) => opts.output_path.is_none(),
            Cmd::ServePages(opts) => opts.output_path.is_none(),
            Cmd::HumanComplete(opts) => opts.output_path.is_none(),
            Cmd::Status(opts) => opts.output_path.is_none(),
            Cmd::Aggregate(opts) => opts.output_path.is_none(),
            Cmd::Cleanup(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Keep the spinner off our JSON output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Flatten(opts) => cmd::flatten::cmd_flatten(opts).await,
        Cmd::Evaluate(opts) => cmd::evaluate::cmd_evaluate(opts).await,
        Cmd::Segments(opts) => cmd::segments::cmd_segments(opts).await,
        Cmd::ProcessPage(opts) => cmd::process_page::cmd_process_page(opts).await,
        Cmd::ServePages(opts) => cmd::serve_pages::cmd_serve_pages(ui, opts).await,
        Cmd::HumanComplete(opts) => cmd::human_complete::cmd_human_complete(opts).await,
        Cmd::Status(opts) => cmd::status::cmd_status(opts).await,
        Cmd::Aggregate(opts) => cmd::aggregate::cmd_aggregate(opts).await,
        Cmd::Cleanup(opts) => cmd::cleanup::cmd_cleanup(opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
