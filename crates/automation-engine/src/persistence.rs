//! Rule persistence using JSON file storage

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Load a list of items from a JSON file.
///
/// A missing or unreadable file yields an empty list.
pub async fn load_list<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<Vec<T>>(&contents) {
            Ok(items) => {
                tracing::info!("Loaded {} entries from {:?}", items.len(), path);
                items
            }
            Err(e) => {
                tracing::warn!("Failed to parse {:?}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No file found at {:?}, starting fresh", path);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Save a list of items to a JSON file atomically
#[allow(clippy::missing_errors_doc)]
pub async fn save_list<T: Serialize>(path: &Path, items: &[T]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(items)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json).await?;
    fs::rename(&tmp_path, path).await?;

    tracing::debug!("Saved {} entries to {:?}", items.len(), path);
    Ok(())
}

/// Load every parseable line of a JSON-lines file
pub async fn load_lines<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {}", path, e);
            return Vec::new();
        }
    };

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Skipping bad line in {:?}: {}", path, e);
                None
            }
        })
        .collect()
}

/// Append one item as a line to a JSON-lines file
#[allow(clippy::missing_errors_doc)]
pub async fn append_line<T: Serialize>(path: &Path, item: &T) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut line = serde_json::to_string(item)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
