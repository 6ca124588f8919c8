//! Embedded audio tag extraction.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Tags read from an audio file's container metadata.
#[derive(Debug, Clone, Default)]
pub struct AudioTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Extract embedded tags from an audio file using ffprobe.
pub async fn read_tags(path: &Path) -> Result<AudioTags> {
    use tokio::process::Command;

    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .output()
        .await
        .context("Failed to run ffprobe")?;

    if !output.status.success() {
        anyhow::bail!("ffprobe failed for {:?}", path);
    }

    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;

    let mut tags = HashMap::new();
    if let Some(format_tags) = json.get("format").and_then(|f| f.get("tags")) {
        if let Some(obj) = format_tags.as_object() {
            for (key, value) in obj {
                if let Some(v) = value.as_str() {
                    tags.insert(key.to_lowercase(), v.to_string());
                }
            }
        }
    }

    let duration_secs = json
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|d| d.as_str())
        .and_then(|d| d.parse::<f64>().ok());

    Ok(AudioTags {
        title: tags.get("title").cloned(),
        artist: tags.get("artist").cloned(),
        album: tags.get("album").cloned(),
        duration_secs,
    })
}
