//! Deterministic mapping from Gmail labels to destination IMAP folder names.

use std::collections::HashMap;

use crate::models::{FolderMapping, Label};

/// Gmail system labels that carry no user-visible mailbox semantics and are
/// never transferred as their own folder.
const SYSTEM_LABELS_TO_SKIP: &[&str] = &[
    "CHAT",
    "CATEGORY_FORUMS",
    "CATEGORY_UPDATES",
    "CATEGORY_PROMOTIONS",
    "CATEGORY_SOCIAL",
];

/// Build one [`FolderMapping`] per transferable label.
///
/// Precedence:
/// 1. An explicit override in `label_mappings` (keyed by label name) wins outright.
/// 2. Otherwise the label name is cleaned: path separators (`/`, `\`) become
///    underscores, and a leading `[Gmail]/` prefix is stripped.
///
/// Labels in [`SYSTEM_LABELS_TO_SKIP`] are omitted entirely.
pub fn build_folder_mappings(
    labels: &[Label],
    label_mappings: &HashMap<String, String>,
) -> Vec<FolderMapping> {
    labels
        .iter()
        .filter(|label| !SYSTEM_LABELS_TO_SKIP.contains(&label.name.as_str()))
        .map(|label| FolderMapping {
            label_id: label.id.clone(),
            label_name: label.name.clone(),
            folder_name: resolve_folder_name(&label.name, label_mappings),
        })
        .collect()
}

/// Resolve a single label's destination folder name.
pub fn resolve_folder_name(label_name: &str, label_mappings: &HashMap<String, String>) -> String {
    if let Some(mapped) = label_mappings.get(label_name) {
        return mapped.clone();
    }
    clean_label_name(label_name)
}

fn clean_label_name(label_name: &str) -> String {
    let cleaned = label_name.replace(['/', '\\'], "_");
    let cleaned = cleaned.strip_prefix("[Gmail]_").unwrap_or(&cleaned);
    cleaned.trim().to_string()
}
