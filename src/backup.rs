use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::fetch;
use crate::gmail::client::GmailClient;
use crate::mbox::{self, MboxWriter};

pub const DEFAULT_MAX_MESSAGES_PER_BACKUP: u32 = 1000;
pub const DEFAULT_MAX_MESSAGES_PER_FULL_BACKUP: u32 = 10000;

const STATE_FILE_NAME: &str = "backup_state.json";

/// Per-account watermark, persisted in the backup folder as
/// `backup_state.json`, keyed by user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStateEntry {
    pub last_backup_time: String,
    pub last_backup_type: String,
}

/// Outcome record for one backup run. The orchestrator never returns `Err`;
/// every failure lands here with `success: false` and the error rendered.
#[derive(Debug, Serialize)]
pub struct BackupResult {
    pub success: bool,
    pub message_count: u64,
    pub backup_path: Option<String>,
    pub start_time: String,
    pub end_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub messages_processed: u64,
    pub messages_failed: u64,
}

impl BackupResult {
    pub fn failure(start: DateTime<Utc>, error: String) -> BackupResult {
        BackupResult {
            success: false,
            message_count: 0,
            backup_path: None,
            start_time: start.to_rfc3339(),
            end_time: Utc::now().to_rfc3339(),
            error: Some(error),
            messages_processed: 0,
            messages_failed: 0,
        }
    }
}

pub struct BackupService {
    client: GmailClient,
    backup_folder: PathBuf,
    max_messages_per_backup: u32,
    max_messages_per_full_backup: u32,
}

impl BackupService {
    pub fn new(client: GmailClient, backup_folder: &Path) -> BackupService {
        BackupService {
            client,
            backup_folder: backup_folder.to_path_buf(),
            max_messages_per_backup: DEFAULT_MAX_MESSAGES_PER_BACKUP,
            max_messages_per_full_backup: DEFAULT_MAX_MESSAGES_PER_FULL_BACKUP,
        }
    }

    pub fn with_limits(mut self, per_backup: u32, per_full_backup: u32) -> BackupService {
        self.max_messages_per_backup = per_backup;
        self.max_messages_per_full_backup = per_full_backup;
        self
    }

    pub fn client(&self) -> &GmailClient {
        &self.client
    }

    fn state_file(&self) -> PathBuf {
        self.backup_folder.join(STATE_FILE_NAME)
    }

    /// Incremental backup: fetches only messages newer than the stored
    /// watermark (absent watermark means a full-style run) and advances the
    /// watermark on success. An explicit `query` overrides the synthesized
    /// `after:` filter.
    pub fn incremental_backup(
        &self,
        user_id: &str,
        query: Option<&str>,
        max_results: Option<u32>,
    ) -> BackupResult {
        let max = max_results.unwrap_or(self.max_messages_per_backup);
        self.run(user_id, "incremental", query, max)
    }

    /// Full backup: ignores the watermark and never writes it.
    pub fn full_backup(
        &self,
        user_id: &str,
        query: Option<&str>,
        max_results: Option<u32>,
    ) -> BackupResult {
        let max = max_results.unwrap_or(self.max_messages_per_full_backup);
        self.run(user_id, "full", query, max)
    }

    fn run(&self, user_id: &str, backup_type: &str, query: Option<&str>, max: u32) -> BackupResult {
        let start = Utc::now();
        log_info!(
            "[Backup] {} backup starting for {} (max {})",
            backup_type,
            user_id,
            max
        );
        match self.try_run(user_id, backup_type, query, max, start) {
            Ok(result) => result,
            Err(e) => {
                log_error!("[Backup] {} backup failed: {}", backup_type, e);
                BackupResult::failure(start, e)
            }
        }
    }

    fn try_run(
        &self,
        user_id: &str,
        backup_type: &str,
        query: Option<&str>,
        max: u32,
        start: DateTime<Utc>,
    ) -> Result<BackupResult, String> {
        let synthesized;
        let effective_query = match (query, backup_type) {
            (Some(q), _) => Some(q),
            (None, "incremental") => {
                match read_state(&self.state_file()).get(user_id) {
                    Some(entry) => {
                        let since = DateTime::parse_from_rfc3339(&entry.last_backup_time)
                            .map_err(|e| format!("corrupt watermark for {}: {}", user_id, e))?;
                        synthesized = format!("after:{}", since.timestamp());
                        log_info!("[Backup] resuming from watermark: {}", synthesized);
                        Some(synthesized.as_str())
                    }
                    None => {
                        log_info!("[Backup] no watermark for {}, backing up everything", user_id);
                        None
                    }
                }
            }
            (None, _) => None,
        };

        let ids = fetch::collect_message_ids(&self.client, user_id, effective_query, max)
            .map_err(|e| format!("listing messages: {}", e))?;

        if ids.is_empty() {
            log_info!("[Backup] nothing to back up");
            if backup_type == "incremental" {
                self.write_watermark(user_id, backup_type, start)?;
            }
            return Ok(BackupResult {
                success: true,
                message_count: 0,
                backup_path: None,
                start_time: start.to_rfc3339(),
                end_time: Utc::now().to_rfc3339(),
                error: None,
                messages_processed: 0,
                messages_failed: 0,
            });
        }

        let archive_path = self.backup_folder.join(format!(
            "gmail_backup_{}_{}.mbox",
            backup_type,
            mbox::timestamp_slug()
        ));
        let mut writer =
            MboxWriter::create(&archive_path).map_err(|e| format!("opening archive: {}", e))?;

        let stats = fetch::fetch_messages(&self.client, user_id, &ids, |message| {
            writer.add_message(&message)
        })
        .map_err(|e| format!("writing archive: {}", e))?;

        if backup_type == "incremental" {
            self.write_watermark(user_id, backup_type, start)?;
        }

        log_info!(
            "[Backup] {} backup done: {} archived to {}",
            backup_type,
            stats.processed,
            archive_path.display()
        );

        Ok(BackupResult {
            success: true,
            message_count: stats.processed,
            backup_path: Some(archive_path.display().to_string()),
            start_time: start.to_rfc3339(),
            end_time: Utc::now().to_rfc3339(),
            error: None,
            messages_processed: stats.processed,
            messages_failed: stats.failed,
        })
    }

    /// The watermark carries the run's start time, so messages arriving
    /// mid-run fall after it and are caught by the next increment.
    fn write_watermark(
        &self,
        user_id: &str,
        backup_type: &str,
        start: DateTime<Utc>,
    ) -> Result<(), String> {
        let state_file = self.state_file();
        let mut state = read_state(&state_file);
        state.insert(
            user_id.to_string(),
            BackupStateEntry {
                last_backup_time: start.to_rfc3339(),
                last_backup_type: backup_type.to_string(),
            },
        );
        write_state(&state_file, &state).map_err(|e| format!("saving backup state: {}", e))
    }
}

/// Load the watermark map. A missing or unreadable file is an empty map,
/// never an error.
pub fn read_state(path: &Path) -> HashMap<String, BackupStateEntry> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_str(&data) {
        Ok(state) => state,
        Err(e) => {
            log_warn!("[Backup] ignoring corrupt state file {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

pub fn write_state(
    path: &Path,
    state: &HashMap<String, BackupStateEntry>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_string_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, data)
}
