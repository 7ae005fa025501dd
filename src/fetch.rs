use std::io;

use crate::gmail::client::{GmailClient, GmailError};
use crate::parser::{self, ParsedMessage};

/// Maximum ids per batchGet call.
pub const BATCH_CHUNK_SIZE: usize = 100;

/// Page size for id listing.
const LIST_PAGE_SIZE: u32 = 100;

/// Outcome of one fetch run. Completion means the id queue was exhausted,
/// not that every message survived.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchStats {
    /// Messages decoded and handed to the sink.
    pub processed: u64,
    /// Messages lost to a failed chunk or a decode failure.
    pub failed: u64,
    /// Ids submitted to the pipeline.
    pub attempted: u64,
}

/// Paginate messages.list until `max_results` ids are collected or the
/// listing runs out of pages.
pub fn collect_message_ids(
    client: &GmailClient,
    user_id: &str,
    query: Option<&str>,
    max_results: u32,
) -> Result<Vec<String>, GmailError> {
    let mut ids: Vec<String> = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let remaining = max_results.saturating_sub(ids.len() as u32);
        if remaining == 0 {
            break;
        }

        let page = client.list_messages(
            user_id,
            query,
            remaining.min(LIST_PAGE_SIZE),
            page_token.as_deref(),
        )?;
        ids.extend(page.messages.into_iter().map(|m| m.id));

        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }

    ids.truncate(max_results as usize);
    log_info!("[Fetch] collected {} message ids", ids.len());
    Ok(ids)
}

/// Fetch full content for `ids` in chunks of [`BATCH_CHUNK_SIZE`], decoding
/// each message and handing survivors to `sink` in remote return order.
///
/// A failed chunk counts its whole length as failed and the loop moves on;
/// a per-message decode failure counts that one message. Only a sink error
/// (archive I/O) aborts the run.
pub fn fetch_messages<F>(
    client: &GmailClient,
    user_id: &str,
    ids: &[String],
    mut sink: F,
) -> io::Result<FetchStats>
where
    F: FnMut(ParsedMessage) -> io::Result<()>,
{
    let mut stats = FetchStats {
        attempted: ids.len() as u64,
        ..FetchStats::default()
    };

    for chunk in ids.chunks(BATCH_CHUNK_SIZE) {
        let messages = match client.batch_get_messages(user_id, chunk, "full") {
            Ok(messages) => messages,
            Err(e) => {
                log_warn!(
                    "[Fetch] chunk of {} failed, continuing: {}",
                    chunk.len(),
                    e
                );
                stats.failed += chunk.len() as u64;
                continue;
            }
        };

        for message in &messages {
            match parser::decode(message) {
                Ok(parsed) => {
                    sink(parsed)?;
                    stats.processed += 1;
                }
                Err(e) => {
                    log_warn!("[Fetch] skipping undecodable message: {}", e);
                    stats.failed += 1;
                }
            }
        }
    }

    log_info!(
        "[Fetch] done: {} processed, {} failed of {} attempted",
        stats.processed,
        stats.failed,
        stats.attempted
    );
    Ok(stats)
}
