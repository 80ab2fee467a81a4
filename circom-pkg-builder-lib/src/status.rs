use crate::error::{BuildError, Error, ErrorKind, Result};
use crate::storage::{ObjectStore, status_key};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const BUILD_COMPLETE_MSG: &str = "Build complete!";

/// One entry of a request's build history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub request_id: String,
    /// Position in the request's log, starting at 0
    pub seq: u64,
    /// Unix time in milliseconds
    pub time: u64,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkg_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl StatusEvent {
    pub fn is_terminal(&self) -> bool {
        self.pkg_name.is_some() || self.error_kind.is_some()
    }
}

/// Per-request append locks shared by every reporter in the process.
///
/// Builds may reuse a `requestId`; their read-modify-write cycles on the same
/// log must not interleave.
#[derive(Debug, Clone, Default)]
pub struct StatusLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>>,
}

impl StatusLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_request(&self, request_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(request_id).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(request_id.to_string(), Arc::downgrade(&lock));
        lock
    }
}

/// Append-only event log for a single request, persisted at `status/<requestId>.json`.
///
/// Appends never fail the build: a store error is logged and dropped.
#[derive(Debug)]
pub struct StatusReporter {
    store: Arc<dyn ObjectStore>,
    request_id: String,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn ObjectStore>, locks: &StatusLocks, request_id: &str) -> Self {
        Self {
            store,
            request_id: request_id.to_string(),
            key: status_key(request_id),
            lock: locks.for_request(request_id),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Progress message.
    pub async fn append(&self, msg: &str) {
        self.record(msg.to_string(), None, None).await;
    }

    pub async fn succeeded(&self, pkg_name: &str) {
        self.record(
            BUILD_COMPLETE_MSG.to_string(),
            Some(pkg_name.to_string()),
            None,
        )
        .await;
    }

    pub async fn failed(&self, err: &BuildError) {
        self.record(err.status_message(), None, Some(err.kind())).await;
    }

    async fn record(&self, msg: String, pkg_name: Option<String>, error_kind: Option<ErrorKind>) {
        if let Err(e) = self.try_record(msg, pkg_name, error_kind).await {
            warn!(request_id = %self.request_id, error = %e, "Failed to append status event");
        }
    }

    async fn try_record(
        &self,
        msg: String,
        pkg_name: Option<String>,
        error_kind: Option<ErrorKind>,
    ) -> Result<StatusEvent> {
        let _guard = self.lock.lock().await;
        let mut events = read_status(self.store.as_ref(), &self.request_id).await?;
        let event = StatusEvent {
            request_id: self.request_id.clone(),
            seq: events.len() as u64,
            time: now_millis(),
            msg,
            pkg_name,
            error_kind,
        };
        debug!(request_id = %self.request_id, seq = event.seq, msg = %event.msg, "Status event");
        events.push(event.clone());
        let body = serde_json::to_vec(&events)?;
        self.store.put(&self.key, body, "application/json").await?;
        Ok(event)
    }
}

/// Reads the ordered event log for a request; empty when nothing was recorded.
pub async fn read_status(store: &dyn ObjectStore, request_id: &str) -> Result<Vec<StatusEvent>> {
    match store.get(&status_key(request_id)).await? {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(Error::from),
        None => Ok(Vec::new()),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::INVALID_FINAL_ZKEY_MSG;
    use crate::storage::FsObjectStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<dyn ObjectStore> {
        Arc::new(FsObjectStore::new(dir.path().to_path_buf(), Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn events_are_ordered_and_terminal_last() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let reporter = StatusReporter::new(store.clone(), &StatusLocks::new(), "abcdef");
        reporter.append("Compiling circuit...").await;
        reporter.append("Resolving finalZkey...").await;
        reporter.failed(&BuildError::invalid_key("nVars mismatch")).await;

        let events = read_status(store.as_ref(), "abcdef").await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let last = events.last().unwrap();
        assert_eq!(last.msg, INVALID_FINAL_ZKEY_MSG);
        assert_eq!(last.error_kind, Some(ErrorKind::InvalidKeyMaterial));
        assert!(last.is_terminal());
        assert!(!events[0].is_terminal());
    }

    #[tokio::test]
    async fn log_survives_a_new_reporter_for_the_same_request() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let locks = StatusLocks::new();
        StatusReporter::new(store.clone(), &locks, "req-1")
            .succeeded("zkpkg-a-req-1-00")
            .await;
        StatusReporter::new(store.clone(), &locks, "req-1")
            .append("Compiling circuit...")
            .await;

        let events = read_status(store.as_ref(), "req-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].pkg_name.as_deref(), Some("zkpkg-a-req-1-00"));
        assert_eq!(events[1].seq, 1);
    }

    #[tokio::test]
    async fn wire_shape_uses_msg_field() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        StatusReporter::new(store.clone(), &StatusLocks::new(), "abc")
            .append("hello")
            .await;
        let raw = store.get(&status_key("abc")).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value[0]["msg"], "hello");
        assert_eq!(value[0]["requestId"], "abc");
        assert!(value[0].get("pkgName").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reporters_for_one_request_keep_every_event() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let locks = StatusLocks::new();

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let reporter = StatusReporter::new(store.clone(), &locks, "abcdef");
            tasks.push(tokio::spawn(async move {
                for step in 0..10 {
                    reporter.append(&format!("worker {} step {}", worker, step)).await;
                }
                reporter.succeeded(&format!("zkpkg-w{}", worker)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let events = read_status(store.as_ref(), "abcdef").await.unwrap();
        assert_eq!(events.len(), 44);
        assert!(events.iter().enumerate().all(|(i, e)| e.seq == i as u64));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 4);
    }

    #[test]
    fn locks_are_shared_per_request_and_dropped_when_unused() {
        let locks = StatusLocks::new();
        let a = locks.for_request("a");
        assert!(Arc::ptr_eq(&a, &locks.for_request("a")));
        assert!(!Arc::ptr_eq(&a, &locks.for_request("b")));
        drop(a);
        let _c = locks.for_request("c");
        let held = locks.locks.lock().unwrap();
        assert_eq!(held.keys().collect::<Vec<_>>(), vec!["c"]);
    }

    #[tokio::test]
    async fn unknown_request_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_status(store(&dir).as_ref(), "nobody").await.unwrap().is_empty());
    }
}
