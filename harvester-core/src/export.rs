//! Rendering of unique authors for download.

use crate::error::{ConfigError, CoreError};
use crate::types::{ChannelRef, UniqueAuthor};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

pub const CSV_HEADER: [&str; 5] = ["first_name", "username", "user_id", "comment_text", "post_url"];

const UTF8_BOM: &str = "\u{feff}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(ConfigError::InvalidValue {
                field: "format".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Quote a field when it contains the delimiter, a quote or a line break.
fn escape_csv_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn push_csv_row<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    let row: Vec<Cow<'_, str>> = fields.into_iter().map(escape_csv_field).collect();
    out.push_str(&row.join(","));
    out.push_str("\r\n");
}

/// CSV with the header row. The BOM lets spreadsheet tools pick up UTF-8.
pub fn to_csv(authors: &[UniqueAuthor], with_bom: bool) -> String {
    let mut out = String::new();
    if with_bom {
        out.push_str(UTF8_BOM);
    }
    push_csv_row(&mut out, CSV_HEADER);

    for author in authors {
        let user_id = author.author_id.to_string();
        push_csv_row(
            &mut out,
            [
                author.display_name.as_str(),
                author.handle.as_deref().unwrap_or(""),
                user_id.as_str(),
                author.first_comment_text.as_str(),
                author.post_url.as_str(),
            ],
        );
    }
    out
}

pub fn to_json(authors: &[UniqueAuthor]) -> Result<String, CoreError> {
    Ok(serde_json::to_string_pretty(authors)?)
}

pub fn export_file_name(channel: &ChannelRef, format: ExportFormat, at: DateTime<Local>) -> String {
    format!(
        "{}_commenters_{}.{}",
        channel.username(),
        at.format("%Y-%m-%d_%H-%M-%S"),
        format.extension()
    )
}

/// Write the export into `dir`, creating it when needed, and return the file path.
pub async fn write_export(
    dir: &Path,
    channel: &ChannelRef,
    format: ExportFormat,
    authors: &[UniqueAuthor],
) -> Result<PathBuf, CoreError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(export_file_name(channel, format, Local::now()));

    let body = match format {
        ExportFormat::Csv => to_csv(authors, true),
        ExportFormat::Json => to_json(authors)?,
    };
    tokio::fs::write(&path, body).await?;

    info!("Exported {} authors to {}", authors.len(), path.display());
    Ok(path)
}
