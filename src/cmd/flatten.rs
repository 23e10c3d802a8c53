//! The `flatten` subcommand.

use clap::Args;

use crate::{
    confidence::DEFAULT_CONFIDENCE_THRESHOLD,
    fields::flatten::flatten_json,
    io::{read_json_input, write_json_output},
    prelude::*,
};

/// Flatten command line arguments.
#[derive(Debug, Args)]
pub struct FlattenOpts {
    /// An extraction result, or a whole artifact with an `explainability_info`
    /// key. Reads standard input if omitted.
    pub input_path: Option<PathBuf>,

    /// Fields below this confidence need review.
    #[clap(
        long,
        env = "CONFIDENCE_THRESHOLD",
        default_value_t = DEFAULT_CONFIDENCE_THRESHOLD
    )]
    pub confidence_threshold: f64,

    /// Where to write the output. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `flatten` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_flatten(opts: &FlattenOpts) -> Result<()> {
    let input = read_json_input::<Value>(opts.input_path.as_deref()).await?;
    let result = input.get("explainability_info").unwrap_or(&input);
    let flattened = flatten_json(result, opts.confidence_threshold)?;
    debug!(
        fields = flattened.fields.len(),
        has_low_confidence = flattened.has_low_confidence,
        "Flattened extraction result"
    );
    write_json_output(opts.output_path.as_deref(), &flattened).await
}
