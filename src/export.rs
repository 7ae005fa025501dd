use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::fetch;
use crate::gmail::client::GmailClient;
use crate::mbox::{self, MboxWriter};
use crate::parser::{self, ParsedMessage};

pub const DEFAULT_MAX_EXPORT_RESULTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Mbox,
    Json,
    Eml,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Mbox => "mbox",
            ExportFormat::Json => "json",
            ExportFormat::Eml => "eml",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Mbox => "mbox",
            ExportFormat::Json => "json",
            ExportFormat::Eml => "eml",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<ExportFormat, String> {
        match s.to_lowercase().as_str() {
            "mbox" => Ok(ExportFormat::Mbox),
            "json" => Ok(ExportFormat::Json),
            "eml" => Ok(ExportFormat::Eml),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!(
                "unknown export format '{}' (expected mbox, json, eml, or csv)",
                other
            )),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportResult {
    pub format: String,
    pub output_path: String,
    pub message_count: u64,
    pub messages_failed: u64,
    pub file_size: u64,
}

/// What to export: an explicit id list, or a search query.
pub enum ExportSelection<'a> {
    Ids(Vec<String>),
    Query {
        query: Option<&'a str>,
        max_results: u32,
    },
}

/// Fetch the selected messages and serialize them in `format`.
///
/// The fetch side is the backup pipeline unchanged; only the terminal
/// serialization differs per format. For `Eml` the output path is a
/// directory of `<id>.eml` files.
pub fn export_messages(
    client: &GmailClient,
    user_id: &str,
    selection: ExportSelection<'_>,
    format: ExportFormat,
    output_path: Option<&Path>,
    export_folder: &Path,
) -> Result<ExportResult, String> {
    let ids = match selection {
        ExportSelection::Ids(ids) => ids,
        ExportSelection::Query { query, max_results } => {
            fetch::collect_message_ids(client, user_id, query, max_results)
                .map_err(|e| format!("listing messages: {}", e))?
        }
    };

    let path = match output_path {
        Some(path) => path.to_path_buf(),
        None => export_folder.join(format!(
            "gmail_export_{}.{}",
            mbox::timestamp_slug(),
            format.extension()
        )),
    };

    log_info!(
        "[Export] exporting {} messages as {} to {}",
        ids.len(),
        format.name(),
        path.display()
    );

    let stats = match format {
        ExportFormat::Mbox => export_mbox(client, user_id, &ids, &path)?,
        ExportFormat::Json => export_json(client, user_id, &ids, &path)?,
        ExportFormat::Eml => export_eml(client, user_id, &ids, &path)?,
        ExportFormat::Csv => export_csv(client, user_id, &ids, &path)?,
    };

    let file_size = path_size(&path);
    Ok(ExportResult {
        format: format.name().to_string(),
        output_path: path.display().to_string(),
        message_count: stats.processed,
        messages_failed: stats.failed,
        file_size,
    })
}

fn export_mbox(
    client: &GmailClient,
    user_id: &str,
    ids: &[String],
    path: &Path,
) -> Result<fetch::FetchStats, String> {
    let mut writer = MboxWriter::create(path).map_err(|e| format!("opening archive: {}", e))?;
    fetch::fetch_messages(client, user_id, ids, |message| writer.add_message(&message))
        .map_err(|e| format!("writing archive: {}", e))
}

fn export_json(
    client: &GmailClient,
    user_id: &str,
    ids: &[String],
    path: &Path,
) -> Result<fetch::FetchStats, String> {
    let mut collected: Vec<ParsedMessage> = Vec::new();
    let stats = fetch::fetch_messages(client, user_id, ids, |message| {
        collected.push(message);
        Ok(())
    })
    .map_err(|e| format!("fetching messages: {}", e))?;

    create_parent(path).map_err(|e| format!("creating output folder: {}", e))?;
    let data = serde_json::to_string_pretty(&collected)
        .map_err(|e| format!("serializing messages: {}", e))?;
    std::fs::write(path, data).map_err(|e| format!("writing {}: {}", path.display(), e))?;
    Ok(stats)
}

fn export_eml(
    client: &GmailClient,
    user_id: &str,
    ids: &[String],
    dir: &Path,
) -> Result<fetch::FetchStats, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("creating {}: {}", dir.display(), e))?;
    fetch::fetch_messages(client, user_id, ids, |message| {
        let file = dir.join(format!("{}.eml", message.id));
        std::fs::write(file, parser::to_rfc822(&message))
    })
    .map_err(|e| format!("writing eml files: {}", e))
}

const CSV_COLUMNS: &str = "id,thread_id,date,from,to,subject,snippet,\
label_ids,size_estimate,has_attachments,attachment_count";

fn export_csv(
    client: &GmailClient,
    user_id: &str,
    ids: &[String],
    path: &Path,
) -> Result<fetch::FetchStats, String> {
    create_parent(path).map_err(|e| format!("creating output folder: {}", e))?;
    let mut file =
        std::fs::File::create(path).map_err(|e| format!("creating {}: {}", path.display(), e))?;
    writeln!(file, "{}", CSV_COLUMNS).map_err(|e| format!("writing header: {}", e))?;

    fetch::fetch_messages(client, user_id, ids, |message| {
        writeln!(file, "{}", csv_row(&message))
    })
    .map_err(|e| format!("writing rows: {}", e))
}

fn csv_row(message: &ParsedMessage) -> String {
    let fields = [
        message.id.clone(),
        message.thread_id.clone(),
        message
            .date
            .map(|d| d.to_rfc3339())
            .unwrap_or_default(),
        message.from.clone(),
        message.to.clone(),
        message.subject.clone(),
        message.snippet.clone(),
        message.label_ids.join(","),
        message.size_estimate.to_string(),
        (!message.attachments.is_empty()).to_string(),
        message.attachments.len().to_string(),
    ];
    fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Quote a field when it contains a comma, quote, or newline; embedded
/// quotes are doubled.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn create_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn path_size(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::read_dir(path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0),
        Ok(meta) => meta.len(),
        Err(_) => 0,
    }
}
