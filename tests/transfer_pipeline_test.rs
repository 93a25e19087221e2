//! End-to-end pipeline tests driving `TransferEngine` against mock
//! `MailSource`/`MailSink` implementations instead of real Gmail/IMAP
//! connections. These exercise the scenarios from the spec's testable
//! properties section: exact-once delivery, flag derivation, and resume.

use async_trait::async_trait;
use chrono::Utc;
use gmail_imap_transfer::{
    CachedMessage, CancellationHandle, FolderMapping, MailSink, MailSource, MessageRef,
    ProgressStore, TransferEngine,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

mockall::mock! {
    pub TestGmailSource {}

    #[async_trait]
    impl MailSource for TestGmailSource {
        async fn list_labels(&self) -> gmail_imap_transfer::Result<Vec<gmail_imap_transfer::models::Label>>;
        async fn list_message_ids(&self, label_id: &str) -> gmail_imap_transfer::Result<Vec<MessageRef>>;
        async fn fetch_batch(&self, refs: &[MessageRef]) -> gmail_imap_transfer::Result<HashMap<String, CachedMessage>>;
    }
}

mockall::mock! {
    pub TestImapSink {}

    #[async_trait]
    impl MailSink for TestImapSink {
        async fn create_folder(&mut self, name: &str) -> gmail_imap_transfer::Result<()>;
        async fn append(&mut self, folder: &str, raw: &[u8], flags: &[String], internal_date: Option<chrono::DateTime<Utc>>) -> gmail_imap_transfer::Result<()>;
        async fn logout(&mut self);
    }
}

fn message_ref(label_id: &str, id: &str) -> MessageRef {
    MessageRef {
        id: id.to_string(),
        label_id: label_id.to_string(),
    }
}

async fn fresh_progress_store() -> (TempDir, ProgressStore) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.json");
    let store = ProgressStore::load(&path).await.unwrap();
    (dir, store)
}

#[derive(Clone)]
struct AppendedCall {
    folder: String,
    raw: Vec<u8>,
    flags: Vec<String>,
}

/// Scenario 1 from the spec: a single label with three messages whose
/// labelIds encode UNREAD/STARRED in different combinations. Each message
/// must be appended exactly once with the correctly derived flag set.
#[tokio::test]
async fn single_label_three_messages_append_exactly_once_with_derived_flags() {
    let mut gmail = MockTestGmailSource::new();
    gmail.expect_list_message_ids().returning(|_| {
        Ok(vec![
            message_ref("L1", "a"),
            message_ref("L1", "b"),
            message_ref("L1", "c"),
        ])
    });
    gmail.expect_fetch_batch().returning(|refs| {
        let mut map = HashMap::new();
        for msg_ref in refs {
            let (raw, label_ids): (&[u8], Vec<&str>) = match msg_ref.id.as_str() {
                "a" => (b"M_a", vec!["INBOX", "STARRED"]),
                "b" => (b"M_b", vec!["INBOX", "UNREAD"]),
                "c" => (b"M_c", vec!["INBOX"]),
                other => panic!("unexpected message id {other}"),
            };
            map.insert(
                msg_ref.id.clone(),
                CachedMessage {
                    id: msg_ref.id.clone(),
                    raw: raw.to_vec(),
                    label_ids: label_ids.into_iter().map(String::from).collect(),
                    internal_date: Some(Utc::now()),
                },
            );
        }
        Ok(map)
    });

    let appended: Arc<Mutex<Vec<AppendedCall>>> = Arc::new(Mutex::new(Vec::new()));
    let appended_in_closure = Arc::clone(&appended);

    let mut imap = MockTestImapSink::new();
    imap.expect_create_folder().returning(|_| Ok(()));
    imap.expect_append()
        .times(3)
        .returning(move |folder, raw, flags, _internal_date| {
            appended_in_closure.lock().unwrap().push(AppendedCall {
                folder: folder.to_string(),
                raw: raw.to_vec(),
                flags: flags.to_vec(),
            });
            Ok(())
        });
    imap.expect_logout().returning(|| ());

    let (_dir, progress) = fresh_progress_store().await;

    let mut engine = TransferEngine::new(
        Arc::new(gmail) as Arc<dyn MailSource>,
        Box::new(imap) as Box<dyn MailSink>,
        progress,
        50,
        50,
        CancellationHandle::new(),
    );

    let mapping = FolderMapping {
        label_id: "L1".to_string(),
        label_name: "Work".to_string(),
        folder_name: "INBOX.Work".to_string(),
    };
    engine.run(&[mapping]).await.unwrap();

    let calls = appended.lock().unwrap();
    assert_eq!(calls.len(), 3, "each message must be appended exactly once");
    for call in calls.iter() {
        assert_eq!(call.folder, "INBOX.Work");
    }

    let by_raw = |raw: &[u8]| calls.iter().find(|c| c.raw == raw).unwrap();
    assert_eq!(
        by_raw(b"M_a").flags,
        vec!["\\Seen".to_string(), "\\Flagged".to_string()]
    );
    assert!(by_raw(b"M_b").flags.is_empty());
    assert_eq!(by_raw(b"M_c").flags, vec!["\\Seen".to_string()]);

    let record = engine.progress().record();
    let mut transferred = record.transferred_messages["L1"].clone();
    transferred.sort();
    assert_eq!(transferred, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(record.completed_labels, 1);
    assert!(record.completed_label_ids.contains("L1"));
}

/// Scenario 4 from the spec: a progress store already records "a" and "b"
/// as transferred for L1. A second run must fetch and append only "c".
#[tokio::test]
async fn resume_only_transfers_outstanding_messages() {
    let mut gmail = MockTestGmailSource::new();
    gmail.expect_list_message_ids().returning(|_| {
        Ok(vec![
            message_ref("L1", "a"),
            message_ref("L1", "b"),
            message_ref("L1", "c"),
        ])
    });

    let fetched_ids: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let fetched_in_closure = Arc::clone(&fetched_ids);
    gmail.expect_fetch_batch().returning(move |refs| {
        fetched_in_closure
            .lock()
            .unwrap()
            .extend(refs.iter().map(|r| r.id.clone()));
        let mut map = HashMap::new();
        for msg_ref in refs {
            map.insert(
                msg_ref.id.clone(),
                CachedMessage {
                    id: msg_ref.id.clone(),
                    raw: b"M_c".to_vec(),
                    label_ids: vec!["INBOX".to_string()],
                    internal_date: Some(Utc::now()),
                },
            );
        }
        Ok(map)
    });

    let append_count = Arc::new(Mutex::new(0u32));
    let append_count_in_closure = Arc::clone(&append_count);
    let mut imap = MockTestImapSink::new();
    imap.expect_create_folder().returning(|_| Ok(()));
    imap.expect_append().returning(move |_, _, _, _| {
        *append_count_in_closure.lock().unwrap() += 1;
        Ok(())
    });
    imap.expect_logout().returning(|| ());

    let (_dir, mut progress) = fresh_progress_store().await;
    progress.mark_message_transferred("L1", "a");
    progress.mark_message_transferred("L1", "b");

    let mut engine = TransferEngine::new(
        Arc::new(gmail) as Arc<dyn MailSource>,
        Box::new(imap) as Box<dyn MailSink>,
        progress,
        50,
        50,
        CancellationHandle::new(),
    );

    let mapping = FolderMapping {
        label_id: "L1".to_string(),
        label_name: "Work".to_string(),
        folder_name: "INBOX.Work".to_string(),
    };
    engine.run(&[mapping]).await.unwrap();

    assert_eq!(*append_count.lock().unwrap(), 1, "only the outstanding message is appended");
    assert_eq!(fetched_ids.lock().unwrap().as_slice(), &["c".to_string()]);
}

/// A label already fully transferred (every known id present in
/// `transferred_messages`) must be skipped before the pipeline even starts:
/// no message listing, no fetch, no append.
#[tokio::test]
async fn already_completed_label_is_skipped_entirely() {
    let mut gmail = MockTestGmailSource::new();
    gmail.expect_list_message_ids().never();
    gmail.expect_fetch_batch().never();

    let mut imap = MockTestImapSink::new();
    imap.expect_create_folder().never();
    imap.expect_append().never();
    imap.expect_logout().returning(|| ());

    let (_dir, mut progress) = fresh_progress_store().await;
    progress.record_known_message_ids("L1", vec!["a".to_string()]);
    progress.mark_message_transferred("L1", "a");

    let mut engine = TransferEngine::new(
        Arc::new(gmail) as Arc<dyn MailSource>,
        Box::new(imap) as Box<dyn MailSink>,
        progress,
        50,
        50,
        CancellationHandle::new(),
    );

    let mapping = FolderMapping {
        label_id: "L1".to_string(),
        label_name: "Work".to_string(),
        folder_name: "INBOX.Work".to_string(),
    };
    engine.run(&[mapping]).await.unwrap();
}

/// A cancellation handle flipped before `run` starts must stop the engine
/// before it touches any label, leaving the progress store untouched.
#[tokio::test]
async fn shutdown_requested_before_run_transfers_nothing() {
    let mut gmail = MockTestGmailSource::new();
    gmail.expect_list_message_ids().never();
    gmail.expect_fetch_batch().never();

    let mut imap = MockTestImapSink::new();
    imap.expect_create_folder().never();
    imap.expect_append().never();
    imap.expect_logout().returning(|| ());

    let (_dir, progress) = fresh_progress_store().await;
    let cancellation = CancellationHandle::new();
    cancellation.request_shutdown();

    let mut engine = TransferEngine::new(
        Arc::new(gmail) as Arc<dyn MailSource>,
        Box::new(imap) as Box<dyn MailSink>,
        progress,
        50,
        50,
        cancellation,
    );

    let mapping = FolderMapping {
        label_id: "L1".to_string(),
        label_name: "Work".to_string(),
        folder_name: "INBOX.Work".to_string(),
    };
    engine.run(&[mapping]).await.unwrap();

    assert!(engine.progress().record().transferred_messages.is_empty());
}
