//! I/O utilities.
//!
//! Reading JSON or TOML configuration files, and writing JSON or text output to
//! either a file or standard output.

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::{prelude::*, toml_utils::toml_to_json};

/// Read a JSON or TOML file as a JSON [`Value`]. Files ending in `.toml` are
/// parsed as TOML, and everything else as JSON.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn read_json_or_toml(path: &Path) -> Result<Value> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    if is_toml {
        toml_to_json(&data)
            .with_context(|| format!("Failed to parse TOML from file at path: {:?}", path))
    } else {
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))
    }
}

/// Read an input document, or standard input if no path is given.
pub async fn read_bytes_or_stdin(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read file at path: {:?}", path)),
        None => {
            let mut data = vec![];
            tokio::io::AsyncReadExt::read_to_end(&mut tokio::io::stdin(), &mut data)
                .await
                .context("Failed to read standard input")?;
            Ok(data)
        }
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write text to either standard output or a file, with a trailing newline.
pub async fn write_text(path: Option<&Path>, text: &str) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    writer
        .write_all(text.as_bytes())
        .await
        .context("Failed to write output")?;
    if !text.ends_with('\n') {
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write a value as pretty-printed JSON to either standard output or a file.
pub async fn write_json<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let json =
        serde_json::to_string_pretty(value).context("Failed to serialize JSON output")?;
    write_text(path, &json).await
}
