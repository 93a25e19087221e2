//! The two-stage fetcher/uploader pipeline that drives one label's
//! transfer at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::{Result, TransferError};
use crate::gmail_source::MailSource;
use crate::imap_sink::MailSink;
use crate::models::{CachedMessage, FolderMapping, MessageRef};
use crate::progress_store::ProgressStore;

const QUEUE_CAPACITY: usize = 100;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(30);
const STAGE_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const CONSECUTIVE_TIMEOUT_WARNING_THRESHOLD: u32 = 10;
const MESSAGE_RETRY_ATTEMPTS: u32 = 3;

/// Cloneable handle used by the CLI entrypoint to request a graceful
/// shutdown. The engine itself never installs OS signal handlers.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Estimated number of Gmail API calls saved by batching misses instead
    /// of fetching them one at a time.
    pub fn api_calls_saved(&self, gmail_batch_size: u64) -> u64 {
        if gmail_batch_size == 0 || self.cache_misses == 0 {
            return 0;
        }
        let batched_calls = (self.cache_misses + gmail_batch_size - 1) / gmail_batch_size;
        self.cache_misses.saturating_sub(batched_calls)
    }
}

struct SharedCache {
    entries: Mutex<HashMap<String, CachedMessage>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SharedCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

struct QueueItem {
    message_ref: MessageRef,
    folder: String,
}

/// Drives one label at a time through the fetch/upload pipeline.
pub struct TransferEngine {
    gmail: Arc<dyn MailSource>,
    imap: Box<dyn MailSink>,
    progress: ProgressStore,
    batch_size: usize,
    progress_save_interval: usize,
    cancellation: CancellationHandle,
    cache: Arc<SharedCache>,
}

impl TransferEngine {
    pub fn new(
        gmail: Arc<dyn MailSource>,
        imap: Box<dyn MailSink>,
        progress: ProgressStore,
        batch_size: usize,
        progress_save_interval: usize,
        cancellation: CancellationHandle,
    ) -> Self {
        Self {
            gmail,
            imap,
            progress,
            batch_size,
            progress_save_interval,
            cancellation,
            cache: Arc::new(SharedCache::new()),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Transfer every label in `mappings`, skipping labels already marked
    /// complete in the Progress Store.
    pub async fn run(&mut self, mappings: &[FolderMapping]) -> Result<()> {
        {
            let record = self.progress.record_mut();
            record.total_labels = mappings.len();
            for mapping in mappings {
                record
                    .label_folder_mapping
                    .insert(mapping.label_id.clone(), mapping.folder_name.clone());
            }
        }
        self.progress.save_if_due(true, Duration::ZERO).await?;

        for mapping in mappings {
            if self.cancellation.is_shutdown_requested() {
                tracing::info!("Shutdown requested, stopping before label {}", mapping.label_name);
                break;
            }

            if self.progress.is_label_completed(&mapping.label_id) {
                tracing::info!("Label {} already complete, skipping", mapping.label_name);
                continue;
            }

            self.imap.create_folder(&mapping.folder_name).await?;
            self.transfer_label(mapping).await?;
        }

        self.progress.save_if_due(true, Duration::ZERO).await?;
        self.imap.logout().await;
        self.cache.entries.lock().await.clear();

        Ok(())
    }

    async fn transfer_label(&mut self, mapping: &FolderMapping) -> Result<()> {
        self.progress.set_current_label(Some(mapping.label_id.clone()));
        self.progress.save_if_due(true, Duration::ZERO).await?;

        let refs = self.gmail.list_message_ids(&mapping.label_id).await?;
        let known_ids: Vec<String> = refs.iter().map(|r| r.id.clone()).collect();
        self.progress.record_known_message_ids(&mapping.label_id, known_ids);

        let (tx, mut rx) = mpsc::channel::<Option<QueueItem>>(QUEUE_CAPACITY);

        let fetch_gmail = Arc::clone(&self.gmail);
        let fetch_cache = Arc::clone(&self.cache);
        let fetch_progress_snapshot = self.progress.record().clone();
        let fetch_cancellation = self.cancellation.clone();
        let fetch_batch_size = self.batch_size;
        let fetch_folder = mapping.folder_name.clone();
        let fetch_label = mapping.label_id.clone();
        let fetch_refs = refs;

        let fetcher = tokio::spawn(async move {
            run_fetcher(
                fetch_gmail,
                fetch_cache,
                fetch_progress_snapshot,
                fetch_cancellation,
                fetch_batch_size,
                fetch_label,
                fetch_folder,
                fetch_refs,
                tx,
            )
            .await
        });

        let mut consecutive_timeouts = 0u32;
        let mut uploads_since_flush = 0usize;

        loop {
            match tokio::time::timeout(DEQUEUE_TIMEOUT, rx.recv()).await {
                Ok(Some(Some(item))) => {
                    consecutive_timeouts = 0;
                    self.upload_one(&mapping.label_id, item).await;
                    uploads_since_flush += 1;
                    if uploads_since_flush >= self.progress_save_interval {
                        self.progress.save_if_due(false, Duration::ZERO).await?;
                        uploads_since_flush = 0;
                    }
                }
                Ok(Some(None)) => break, // sentinel
                Ok(None) => break,       // channel closed without sentinel
                Err(_) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= CONSECUTIVE_TIMEOUT_WARNING_THRESHOLD {
                        tracing::warn!(
                            "{} consecutive dequeue timeouts while transferring label {}",
                            consecutive_timeouts,
                            mapping.label_name
                        );
                    }
                    if self.cancellation.is_shutdown_requested() {
                        break;
                    }
                }
            }
        }

        match tokio::time::timeout(STAGE_JOIN_TIMEOUT, fetcher).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!("Fetcher stage for {} failed: {}", mapping.label_name, e),
            Ok(Err(e)) => tracing::error!("Fetcher task for {} panicked: {}", mapping.label_name, e),
            Err(_) => tracing::warn!("Fetcher stage for {} did not finish within {:?}", mapping.label_name, STAGE_JOIN_TIMEOUT),
        }

        if self.progress.is_label_completed(&mapping.label_id) {
            self.progress.mark_label_completed(&mapping.label_id);
        }
        self.progress.save_if_due(true, Duration::ZERO).await?;

        Ok(())
    }

    async fn upload_one(&mut self, label_id: &str, item: QueueItem) {
        let message_id = item.message_ref.id.clone();

        if self.progress.is_message_transferred(label_id, &message_id) {
            return;
        }

        let cached = {
            let mut entries = self.cache.entries.lock().await;
            entries.remove(&message_id)
        };

        let message = match cached {
            Some(msg) => {
                self.cache.hits.fetch_add(1, Ordering::Relaxed);
                Some(msg)
            }
            None => match self.gmail.fetch_batch(&[item.message_ref.clone()]).await {
                Ok(mut fetched) => fetched.remove(&message_id),
                Err(e) => {
                    tracing::error!("Cache-miss fallback fetch failed for {}: {}", message_id, e);
                    None
                }
            },
        };

        let Some(message) = message else {
            tracing::error!("Could not obtain message {} for upload, will retry next run", message_id);
            return;
        };

        let flags = message.derive_imap_flags();
        let result = self
            .transfer_message_with_retry(&item.folder, &message, &flags)
            .await;

        match result {
            Ok(()) => {
                self.progress.mark_message_transferred(label_id, &message_id);
            }
            Err(e) => {
                tracing::error!("Failed to transfer message {}: {}", message_id, e);
            }
        }
    }

    /// Wraps a single APPEND in a 3-attempt retry with `2^attempt` backoff,
    /// for transient IMAP faults not already absorbed by the sink's own
    /// session-recycling logic.
    async fn transfer_message_with_retry(
        &mut self,
        folder: &str,
        message: &CachedMessage,
        flags: &[String],
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .imap
                .append(folder, &message.raw, flags, message.internal_date)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < MESSAGE_RETRY_ATTEMPTS => {
                    let delay = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!(
                        "Transient IMAP error on message {} (attempt {}/{}): {}. Retrying in {:?}",
                        message.id,
                        attempt,
                        MESSAGE_RETRY_ATTEMPTS,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_fetcher(
    gmail: Arc<dyn MailSource>,
    cache: Arc<SharedCache>,
    progress_snapshot: crate::models::ProgressRecord,
    cancellation: CancellationHandle,
    batch_size: usize,
    label_id: String,
    folder: String,
    refs: Vec<MessageRef>,
    tx: mpsc::Sender<Option<QueueItem>>,
) -> Result<()> {
    let result = fetch_all_batches(
        &gmail,
        &cache,
        &progress_snapshot,
        &cancellation,
        batch_size,
        &label_id,
        &folder,
        refs,
        &tx,
    )
    .await;

    // The sentinel must be sent even if the fetcher failed, so the uploader
    // can drain and exit rather than block on the queue-timeout forever.
    let _ = tx.send(None).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn fetch_all_batches(
    gmail: &Arc<dyn MailSource>,
    cache: &Arc<SharedCache>,
    progress_snapshot: &crate::models::ProgressRecord,
    cancellation: &CancellationHandle,
    batch_size: usize,
    label_id: &str,
    folder: &str,
    refs: Vec<MessageRef>,
    tx: &mpsc::Sender<Option<QueueItem>>,
) -> Result<()> {
    for batch in refs.chunks(batch_size.max(1)) {
        if cancellation.is_shutdown_requested() {
            break;
        }

        let mut to_fetch = Vec::new();
        for msg_ref in batch {
            if progress_snapshot.is_message_transferred(label_id, &msg_ref.id) {
                continue;
            }
            let already_cached = cache.entries.lock().await.contains_key(&msg_ref.id);
            if !already_cached {
                to_fetch.push(msg_ref.clone());
            }
        }

        if !to_fetch.is_empty() {
            let fetched = gmail.fetch_batch(&to_fetch).await?;
            let mut entries = cache.entries.lock().await;
            for (id, message) in fetched {
                entries.insert(id, message);
            }
            cache.misses.fetch_add(to_fetch.len() as u64, Ordering::Relaxed);
        }

        for msg_ref in batch {
            if progress_snapshot.is_message_transferred(label_id, &msg_ref.id) {
                continue;
            }
            let item = QueueItem {
                message_ref: msg_ref.clone(),
                folder: folder.to_string(),
            };
            if tx.send(Some(item)).await.is_err() {
                return Err(TransferError::OperationCancelled(
                    "uploader channel closed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            cache_hits: 3,
            cache_misses: 1,
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_cache_stats_hit_rate_empty() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_api_calls_saved() {
        let stats = CacheStats {
            cache_hits: 0,
            cache_misses: 100,
        };
        // 100 misses batched at 25 per call = 4 calls, vs 100 individual.
        assert_eq!(stats.api_calls_saved(25), 96);
    }

    #[test]
    fn test_cancellation_handle_roundtrip() {
        let handle = CancellationHandle::new();
        assert!(!handle.is_shutdown_requested());
        handle.request_shutdown();
        assert!(handle.is_shutdown_requested());

        // Clones observe the same underlying flag.
        let cloned = handle.clone();
        assert!(cloned.is_shutdown_requested());
    }
}
