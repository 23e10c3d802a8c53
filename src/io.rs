//! Reading command inputs and writing command outputs.

use serde::de::DeserializeOwned;
use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

/// Read and parse JSON from a file, or from standard input if `path` is
/// `None` or `-`.
pub async fn read_json_input<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned,
{
    let mut data = String::new();
    let description = match path {
        Some(path) if path != Path::new("-") => {
            let mut file = File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            file.read_to_string(&mut data)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            path.display().to_string()
        }
        _ => {
            tokio::io::stdin()
                .read_to_string(&mut data)
                .await
                .context("failed to read standard input")?;
            "standard input".to_owned()
        }
    };
    serde_json::from_str(&data).with_context(|| format!("failed to parse JSON from {description}"))
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write `value` as pretty-printed JSON to a file or stdout.
pub async fn write_json_output<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let mut json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    json.push('\n');
    let mut wtr = create_writer(path).await?;
    wtr.write_all(json.as_bytes())
        .await
        .context("failed to write output")?;
    wtr.flush().await.context("failed to flush output")?;
    Ok(())
}
