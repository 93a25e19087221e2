//! Gmail message source: label/message enumeration and rate-limited batch fetch.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use google_gmail1::hyper_rustls;
use google_gmail1::hyper_util;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::auth::GmailHub;
use crate::error::{Result, TransferError};
use crate::models::{CachedMessage, Label, MessageRef};

/// Trait defining the Gmail Source contract for easier testing.
///
/// The transfer engine holds an `Arc<dyn MailSource>` rather than a concrete
/// `GmailSource` so the fetcher stage can be driven against a fake in tests
/// (see the mock-based pipeline tests in `transfer_engine`).
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn list_labels(&self) -> Result<Vec<Label>>;
    async fn list_message_ids(&self, label_id: &str) -> Result<Vec<MessageRef>>;
    async fn fetch_batch(&self, refs: &[MessageRef]) -> Result<HashMap<String, CachedMessage>>;
}

const CHUNK_SIZE: usize = 25;
const MAX_CHUNK_ATTEMPTS: u32 = 3;
const MAX_CONCURRENT_FETCHES: usize = 25;
const INTER_CHUNK_PAUSE: Duration = Duration::from_secs(2);

/// Enumerates Gmail labels and messages, and fetches raw message bytes
/// under the provider's rate-limit retry policy.
pub struct GmailSource {
    hub: GmailHub,
    semaphore: Arc<Semaphore>,
}

impl GmailSource {
    pub fn new(hub: GmailHub) -> Self {
        Self {
            hub,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES)),
        }
    }

    /// Every label the account exposes.
    pub async fn list_labels(&self) -> Result<Vec<Label>> {
        let (_, response) = self
            .hub
            .users()
            .labels_list("me")
            .add_scope("https://www.googleapis.com/auth/gmail.readonly")
            .doit()
            .await?;

        let labels = response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|label| match (label.id, label.name) {
                (Some(id), Some(name)) => Some(Label { id, name }),
                _ => None,
            })
            .collect();

        Ok(labels)
    }

    /// All message ids under a label, following page tokens until exhausted.
    /// Order is provider-defined.
    pub async fn list_message_ids(&self, label_id: &str) -> Result<Vec<MessageRef>> {
        let mut all_refs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .add_label_ids(label_id)
                .max_results(100);

            if let Some(token) = page_token.as_ref() {
                call = call.page_token(token);
            }

            let (_, response) = call
                .add_scope("https://www.googleapis.com/auth/gmail.readonly")
                .doit()
                .await?;

            if let Some(messages) = response.messages {
                for msg_ref in messages {
                    if let Some(id) = msg_ref.id {
                        all_refs.push(MessageRef {
                            id,
                            label_id: label_id.to_string(),
                        });
                    }
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(all_refs)
    }

    /// Fetch raw messages for `refs` under the rate-limit retry policy:
    /// chunks of <= 25, up to 3 chunk-level attempts with 5s/10s base
    /// exponential backoff (per-item vs. batch-level 429), falling back to
    /// single-item fetches (2s base backoff) once chunk retries are
    /// exhausted. Non-429 errors on a single item are logged and the ref is
    /// omitted from the result -- callers must expect a partial mapping.
    pub async fn fetch_batch(
        &self,
        refs: &[MessageRef],
    ) -> Result<HashMap<String, CachedMessage>> {
        let mut results = HashMap::with_capacity(refs.len());

        for (chunk_index, chunk) in refs.chunks(CHUNK_SIZE).enumerate() {
            if chunk_index > 0 {
                tokio::time::sleep(INTER_CHUNK_PAUSE).await;
            }

            let fetched = self.fetch_chunk_with_retry(chunk).await;
            results.extend(fetched);
        }

        Ok(results)
    }

    async fn fetch_chunk_with_retry(
        &self,
        chunk: &[MessageRef],
    ) -> HashMap<String, CachedMessage> {
        let mut remaining: Vec<MessageRef> = chunk.to_vec();
        let mut results = HashMap::with_capacity(chunk.len());
        let mut attempt: u32 = 0;

        while attempt < MAX_CHUNK_ATTEMPTS && !remaining.is_empty() {
            attempt += 1;

            let outcomes = self.fetch_many_once(&remaining).await;

            let total = outcomes.len();
            let rate_limited: Vec<_> = outcomes
                .iter()
                .filter(|o| matches!(o.1, Err(TransferError::RateLimitExceeded { .. })))
                .collect();
            let batch_rate_limited = total > 0 && rate_limited.len() == total;

            let mut still_missing = Vec::new();
            for (msg_ref, outcome) in outcomes {
                match outcome {
                    Ok(msg) => {
                        results.insert(msg_ref.id.clone(), msg);
                    }
                    Err(TransferError::RateLimitExceeded { .. }) => {
                        still_missing.push(msg_ref);
                    }
                    Err(e) => {
                        warn!("Skipping message {}: {}", msg_ref.id, e);
                    }
                }
            }

            if still_missing.is_empty() {
                remaining.clear();
                break;
            }

            if attempt >= MAX_CHUNK_ATTEMPTS {
                remaining = still_missing;
                break;
            }

            let delay = if batch_rate_limited {
                Duration::from_secs(10 * 2u64.pow(attempt))
            } else {
                Duration::from_secs(5 * 2u64.pow(attempt))
            };
            warn!(
                "Rate limited on {} message(s), retrying chunk in {:?} (attempt {}/{})",
                still_missing.len(),
                delay,
                attempt,
                MAX_CHUNK_ATTEMPTS
            );
            tokio::time::sleep(delay).await;
            remaining = still_missing;
        }

        if !remaining.is_empty() {
            debug!(
                "Falling back to single-item fetches for {} message(s)",
                remaining.len()
            );
            for msg_ref in &remaining {
                match self.fetch_single_with_retry(msg_ref).await {
                    Ok(msg) => {
                        results.insert(msg_ref.id.clone(), msg);
                    }
                    Err(e) => {
                        warn!("Giving up on message {}: {}", msg_ref.id, e);
                    }
                }
            }
        }

        results
    }

    async fn fetch_many_once(
        &self,
        refs: &[MessageRef],
    ) -> Vec<(MessageRef, Result<CachedMessage>)> {
        stream::iter(refs.to_vec())
            .map(|msg_ref| async move {
                let result = self.fetch_one(&msg_ref).await;
                (msg_ref, result)
            })
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .collect()
            .await
    }

    async fn fetch_single_with_retry(&self, msg_ref: &MessageRef) -> Result<CachedMessage> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_one(msg_ref).await {
                Ok(msg) => return Ok(msg),
                Err(TransferError::RateLimitExceeded { .. }) if attempt < MAX_CHUNK_ATTEMPTS => {
                    let delay = Duration::from_secs(2 * 2u64.pow(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_one(&self, msg_ref: &MessageRef) -> Result<CachedMessage> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| TransferError::Unknown(format!("Failed to acquire permit: {}", e)))?;

        let (_, msg) = self
            .hub
            .users()
            .messages_get("me", &msg_ref.id)
            .format("raw")
            .add_scope("https://www.googleapis.com/auth/gmail.readonly")
            .doit()
            .await?;

        let raw_field = msg
            .raw
            .ok_or_else(|| TransferError::InvalidMessageFormat("Missing raw body".to_string()))?;

        let raw = base64::engine::general_purpose::URL_SAFE
            .decode(raw_field.trim_end_matches('='))
            .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(&raw_field))
            .map_err(|e| {
                TransferError::InvalidMessageFormat(format!("Invalid base64url body: {}", e))
            })?;

        let internal_date = parse_date_header(&raw);

        Ok(CachedMessage {
            id: msg_ref.id.clone(),
            raw,
            label_ids: msg.label_ids.unwrap_or_default(),
            internal_date,
        })
    }
}

/// Extract and parse the `Date:` header from a raw RFC 5322 message, the
/// way `email.utils.parsedate_to_datetime` does for the original message
/// time. Absent, unparseable, or malformed headers yield `None` -- the
/// caller must not substitute the current time, since that would silently
/// replace the original message time with the transfer time.
fn parse_date_header(raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = String::from_utf8_lossy(raw);
    let header_section = match text.find("\r\n\r\n").or_else(|| text.find("\n\n")) {
        Some(idx) => &text[..idx],
        None => text.as_ref(),
    };

    let mut unfolded: Vec<String> = Vec::new();
    for raw_line in header_section.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if (line.starts_with(' ') || line.starts_with('\t')) && !unfolded.is_empty() {
            let last = unfolded.last_mut().expect("checked non-empty above");
            last.push(' ');
            last.push_str(line.trim());
        } else {
            unfolded.push(line.to_string());
        }
    }

    let date_value = unfolded.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("date").then(|| value.trim().to_string())
    })?;

    DateTime::parse_from_rfc2822(&date_value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl MailSource for GmailSource {
    async fn list_labels(&self) -> Result<Vec<Label>> {
        GmailSource::list_labels(self).await
    }

    async fn list_message_ids(&self, label_id: &str) -> Result<Vec<MessageRef>> {
        GmailSource::list_message_ids(self, label_id).await
    }

    async fn fetch_batch(&self, refs: &[MessageRef]) -> Result<HashMap<String, CachedMessage>> {
        GmailSource::fetch_batch(self, refs).await
    }
}

/// Build an authenticated [`GmailSource`], wiring up the same rustls HTTPS
/// connector the teacher uses for its hub construction.
pub fn https_connector(
) -> hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector> {
    hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .expect("failed to load native TLS roots")
        .https_or_http()
        .enable_http1()
        .build()
}
