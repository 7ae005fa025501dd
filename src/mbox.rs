use chrono::{Local, Utc};
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::parser::{self, ParsedMessage};

/// Loose address pattern for the envelope sender. Extraction is
/// best-effort; anything unmatched falls back to the sentinel.
fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\w.\-]+@[\w.\-]+\.\w+").expect("static pattern compiles"))
}

const UNKNOWN_SENDER: &str = "unknown@unknown";

/// RFC 4155 mbox archive writer.
///
/// Opens the target in append mode, so writing to an existing path extends
/// the archive. Callers wanting a fresh archive pick a fresh path. Not safe
/// for two concurrent writers on one file.
pub struct MboxWriter {
    path: PathBuf,
    file: File,
    message_count: u64,
}

impl MboxWriter {
    pub fn create(path: &Path) -> io::Result<MboxWriter> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log_debug!("[Mbox] opened {} for append", path.display());
        Ok(MboxWriter {
            path: path.to_path_buf(),
            file,
            message_count: 0,
        })
    }

    /// Append one message record: envelope line, RFC 822 bytes ending in
    /// exactly one newline, then a blank separator line. I/O errors are
    /// fatal to the run and propagate.
    pub fn add_message(&mut self, message: &ParsedMessage) -> io::Result<()> {
        let sender = envelope_sender(&message.from);
        let date = message
            .date
            .map(|d| d.with_timezone(&Local))
            .unwrap_or_else(Local::now)
            .to_rfc2822();

        self.file
            .write_all(format!("From {}  {}\n", sender, date).as_bytes())?;

        let mut body = parser::to_rfc822(message);
        while body.ends_with(b"\n\n") {
            body.pop();
        }
        if !body.ends_with(b"\n") {
            body.push(b'\n');
        }
        self.file.write_all(&body)?;
        self.file.write_all(b"\n")?;

        self.message_count += 1;
        Ok(())
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn file_size(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn envelope_sender(from: &str) -> String {
    email_pattern()
        .find(from)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string())
}

/// Timestamp fragment for generated archive and export file names.
pub fn timestamp_slug() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
