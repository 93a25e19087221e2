use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A Gmail label as returned by `users.labels.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// A reference to a single message within a label's listing, as returned by
/// `users.messages.list` before the message body has been fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub label_id: String,
}

/// A fully fetched Gmail message, held in the in-memory transfer cache
/// between the fetcher stage and the uploader stage.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub id: String,
    /// Raw RFC 5322 message bytes, decoded from Gmail's base64url `raw` format.
    pub raw: Vec<u8>,
    pub label_ids: Vec<String>,
    /// The timestamp parsed from the message's `Date:` header. Absent when
    /// the header is missing or malformed -- never backfilled with the
    /// transfer time, since that would corrupt the original message time.
    pub internal_date: Option<DateTime<Utc>>,
}

impl CachedMessage {
    /// Approximate in-memory footprint used for cache memory accounting.
    pub fn approx_size_bytes(&self) -> usize {
        self.raw.len() + self.id.len() + self.label_ids.iter().map(|l| l.len()).sum::<usize>()
    }

    /// IMAP flags implied by this message's current Gmail label set.
    ///
    /// `\Seen` is set unless the message carries the `UNREAD` label;
    /// `\Flagged` is set when the message carries the `STARRED` label.
    pub fn derive_imap_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if !self.label_ids.iter().any(|l| l == "UNREAD") {
            flags.push("\\Seen".to_string());
        }
        if self.label_ids.iter().any(|l| l == "STARRED") {
            flags.push("\\Flagged".to_string());
        }
        flags
    }
}

/// A Gmail label mapped onto a destination IMAP folder name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderMapping {
    pub label_id: String,
    pub label_name: String,
    pub folder_name: String,
}

/// The durable, resumable record of transfer progress for one run.
///
/// Persisted as JSON via the progress store. `transferred_messages` and
/// `known_message_ids` are both keyed by Gmail label id: the former records
/// message ids that have been successfully uploaded, the latter records
/// every message id that was ever listed for that label. A label is
/// complete only when every known id for it has been transferred -- see
/// [`ProgressRecord::is_label_completed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub session_id: String,
    pub total_labels: usize,
    /// Count of labels fully transferred, per the documented external
    /// schema. Label *identity* (needed by `is_label_completed` to avoid
    /// re-counting) lives in `completed_label_ids`, which is not part of
    /// the persisted schema.
    pub completed_labels: usize,
    pub current_label: Option<String>,
    pub transferred_messages: HashMap<String, Vec<String>>,
    pub known_message_ids: HashMap<String, Vec<String>>,
    pub label_folder_mapping: HashMap<String, String>,
    #[serde(skip)]
    pub completed_label_ids: HashSet<String>,
}

impl ProgressRecord {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            total_labels: 0,
            completed_labels: 0,
            current_label: None,
            transferred_messages: HashMap::new(),
            known_message_ids: HashMap::new(),
            label_folder_mapping: HashMap::new(),
            completed_label_ids: HashSet::new(),
        }
    }

    /// True iff this message id has already been uploaded for this label.
    pub fn is_message_transferred(&self, label_id: &str, message_id: &str) -> bool {
        self.transferred_messages
            .get(label_id)
            .map(|ids| ids.iter().any(|id| id == message_id))
            .unwrap_or(false)
    }

    /// Record a message as transferred. Idempotent.
    pub fn mark_message_transferred(&mut self, label_id: &str, message_id: &str) {
        let ids = self
            .transferred_messages
            .entry(label_id.to_string())
            .or_default();
        if !ids.iter().any(|id| id == message_id) {
            ids.push(message_id.to_string());
        }
    }

    /// Record the complete set of message ids that exist for a label, as
    /// observed from `users.messages.list`. Called once per label before
    /// the fetch/upload pipeline starts, and used to decide completion.
    pub fn record_known_message_ids(&mut self, label_id: &str, ids: Vec<String>) {
        self.known_message_ids.insert(label_id.to_string(), ids);
    }

    /// A label is complete iff every message id known for it has been
    /// transferred. This replaces a coarser heuristic (comparing only
    /// against the current in-progress label) that could wrongly report a
    /// label complete while messages from an earlier interrupted run were
    /// still outstanding.
    pub fn is_label_completed(&self, label_id: &str) -> bool {
        let known = match self.known_message_ids.get(label_id) {
            Some(ids) if !ids.is_empty() => ids,
            _ => return false,
        };
        let transferred = self.transferred_messages.get(label_id);
        match transferred {
            Some(transferred) => known.iter().all(|id| transferred.iter().any(|t| t == id)),
            None => false,
        }
    }

    pub fn mark_label_completed(&mut self, label_id: &str) {
        if self.completed_label_ids.insert(label_id.to_string()) {
            self.completed_labels = self.completed_label_ids.len();
        }
        if self.current_label.as_deref() == Some(label_id) {
            self.current_label = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_imap_flags_unread_unstarred() {
        let msg = CachedMessage {
            id: "1".to_string(),
            raw: vec![],
            label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
            internal_date: Some(Utc::now()),
        };
        let flags = msg.derive_imap_flags();
        assert!(!flags.contains(&"\\Seen".to_string()));
        assert!(!flags.contains(&"\\Flagged".to_string()));
    }

    #[test]
    fn test_derive_imap_flags_read_and_starred() {
        let msg = CachedMessage {
            id: "2".to_string(),
            raw: vec![],
            label_ids: vec!["INBOX".to_string(), "STARRED".to_string()],
            internal_date: Some(Utc::now()),
        };
        let flags = msg.derive_imap_flags();
        assert!(flags.contains(&"\\Seen".to_string()));
        assert!(flags.contains(&"\\Flagged".to_string()));
    }

    #[test]
    fn test_progress_record_transferred_roundtrip() {
        let mut record = ProgressRecord::new("run-1".to_string());
        assert!(!record.is_message_transferred("Label_1", "msg-a"));

        record.mark_message_transferred("Label_1", "msg-a");
        assert!(record.is_message_transferred("Label_1", "msg-a"));

        // Idempotent
        record.mark_message_transferred("Label_1", "msg-a");
        assert_eq!(record.transferred_messages["Label_1"].len(), 1);
    }

    #[test]
    fn test_is_label_completed_requires_all_known_ids() {
        let mut record = ProgressRecord::new("run-1".to_string());
        record.record_known_message_ids(
            "Label_1",
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        );

        assert!(!record.is_label_completed("Label_1"));

        record.mark_message_transferred("Label_1", "a");
        record.mark_message_transferred("Label_1", "b");
        assert!(!record.is_label_completed("Label_1"));

        record.mark_message_transferred("Label_1", "c");
        assert!(record.is_label_completed("Label_1"));
    }

    #[test]
    fn test_is_label_completed_false_for_unknown_label() {
        let record = ProgressRecord::new("run-1".to_string());
        assert!(!record.is_label_completed("Label_unknown"));
    }

    #[test]
    fn test_is_label_completed_does_not_depend_on_current_label() {
        // Regression test for the coarse "current_label != label" heuristic:
        // a label with all known ids transferred must read as complete
        // regardless of which label is presently being processed.
        let mut record = ProgressRecord::new("run-1".to_string());
        record.record_known_message_ids("Label_1", vec!["a".to_string()]);
        record.mark_message_transferred("Label_1", "a");
        record.current_label = Some("Label_1".to_string());

        assert!(record.is_label_completed("Label_1"));
    }

    #[test]
    fn test_mark_label_completed_clears_current_label() {
        let mut record = ProgressRecord::new("run-1".to_string());
        record.current_label = Some("Label_1".to_string());
        record.mark_label_completed("Label_1");

        assert_eq!(record.current_label, None);
        assert_eq!(record.completed_labels, 1);
        assert!(record.completed_label_ids.contains("Label_1"));
    }

    #[test]
    fn test_mark_label_completed_count_is_idempotent() {
        let mut record = ProgressRecord::new("run-1".to_string());
        record.mark_label_completed("Label_1");
        record.mark_label_completed("Label_1");
        assert_eq!(record.completed_labels, 1);
    }
}
