//! Bounded in-memory submission store.
//!
//! Submissions are kept ordered by `(received_at, insertion sequence)` so the
//! oldest entries are always at the front. All mutations take the write lock,
//! which makes insert-then-evict one step for every other caller; readers see
//! the state before or after a mutation, never in between.
//!
//! When a [`PersistenceWriter`] is attached, each mutation queues its mirror
//! jobs before releasing the write lock, so the writer applies them in the
//! same order as memory. Queueing never blocks. The in-memory state stays
//! authoritative.

pub mod persist;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, PersistenceError};

pub use persist::{JsonDirRepository, PersistFailure, PersistenceWriter, SubmissionRepository};
pub use types::{
    ListFilter, StoreStats, Submission, SubmissionMetadata, SubmissionPage, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};

/// Default maximum number of stored submissions.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Share of capacity evicted when an insert overflows it.
const EVICTION_DIVISOR: usize = 10;

type OrderKey = (DateTime<Utc>, u64);

#[derive(Default)]
struct StoreState {
    by_time: BTreeMap<OrderKey, Arc<Submission>>,
    index: HashMap<String, OrderKey>,
    next_seq: u64,
}

impl StoreState {
    fn insert(&mut self, submission: Submission) -> Arc<Submission> {
        let key = (submission.received_at(), self.next_seq);
        self.next_seq += 1;

        let submission = Arc::new(submission);
        self.index.insert(submission.id.clone(), key);
        self.by_time.insert(key, Arc::clone(&submission));
        submission
    }

    /// Remove the `count` oldest entries, returning their ids.
    fn evict_oldest(&mut self, count: usize) -> Vec<String> {
        let mut evicted = Vec::with_capacity(count);
        for _ in 0..count {
            let Some((_, submission)) = self.by_time.pop_first() else {
                break;
            };
            self.index.remove(&submission.id);
            evicted.push(submission.id.clone());
        }
        evicted
    }

    fn unique_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Thread-safe bounded submission table.
pub struct SubmissionStore {
    capacity: usize,
    state: RwLock<StoreState>,
    persistence: Option<PersistenceWriter>,
}

impl SubmissionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(StoreState::default()),
            persistence: None,
        }
    }

    /// Mirror every mutation through `writer`.
    pub fn with_persistence(mut self, writer: PersistenceWriter) -> Self {
        self.persistence = Some(writer);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.read().by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries dropped when an insert overflows capacity.
    pub fn eviction_batch(&self) -> usize {
        (self.capacity / EVICTION_DIVISOR).max(1)
    }

    /// Store `submission` under a fresh id and return that id.
    ///
    /// Any id already set on `submission` is replaced.
    pub fn insert(&self, mut submission: Submission) -> String {
        let (stored, evicted) = {
            let mut state = self.state.write();
            submission.id = state.unique_id();
            let stored = state.insert(submission);

            let len = state.by_time.len();
            let evicted = if len > self.capacity {
                let count = self.eviction_batch().max(len - self.capacity);
                state.evict_oldest(count)
            } else {
                Vec::new()
            };

            if let Some(writer) = &self.persistence {
                writer.save(stored.as_ref().clone());
                writer.remove(evicted.clone());
            }
            (stored, evicted)
        };

        if !evicted.is_empty() {
            info!(
                kind = %ErrorKind::StoreCapacityEviction,
                evicted = evicted.len(),
                capacity = self.capacity,
                "store_capacity_eviction"
            );
        }

        stored.id.clone()
    }

    pub fn get(&self, id: &str) -> Option<Submission> {
        let state = self.state.read();
        let key = state.index.get(id)?;
        state.by_time.get(key).map(|s| s.as_ref().clone())
    }

    /// Filter, sort newest first, then return page `page` (1-based).
    pub fn list(&self, filter: &ListFilter, page: usize, page_size: usize) -> SubmissionPage {
        let page = page.max(1);
        let page_size = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let matching: Vec<Arc<Submission>> = {
            let state = self.state.read();
            state
                .by_time
                .values()
                .rev()
                .filter(|s| filter.matches(s))
                .cloned()
                .collect()
        };

        let items = matching
            .iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .map(|s| s.as_ref().clone())
            .collect();

        SubmissionPage {
            items,
            total: matching.len(),
            page,
            page_size,
        }
    }

    /// Case-insensitive substring search, newest first.
    pub fn search(&self, term: &str) -> Vec<Submission> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let state = self.state.read();
        state
            .by_time
            .values()
            .rev()
            .filter(|s| s.matches_term(&needle))
            .map(|s| s.as_ref().clone())
            .collect()
    }

    /// Remove everything received more than `older_than_days` days ago.
    pub fn cleanup(&self, older_than_days: u32) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));
        self.cleanup_before(cutoff)
    }

    /// Remove everything received strictly before `cutoff`.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let removed: Vec<String> = {
            let mut state = self.state.write();
            let kept = state.by_time.split_off(&(cutoff, 0));
            let removed = std::mem::replace(&mut state.by_time, kept);
            for submission in removed.values() {
                state.index.remove(&submission.id);
            }
            let removed: Vec<String> = removed.into_values().map(|s| s.id.clone()).collect();

            if let Some(writer) = &self.persistence {
                writer.remove(removed.clone());
            }
            removed
        };

        info!(
            cutoff = %cutoff,
            removed = removed.len(),
            "store_cleanup"
        );

        removed.len()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        let mut stats = StoreStats {
            total: state.by_time.len(),
            capacity: self.capacity,
            ..Default::default()
        };
        for submission in state.by_time.values() {
            if submission.metadata.signature_valid {
                stats.validated += 1;
            }
            *stats.by_form.entry(submission.form_id.clone()).or_default() += 1;
        }
        stats
    }

    /// Reload persisted submissions, keeping their ids.
    ///
    /// Duplicate ids are skipped. If more than `capacity` entries come back,
    /// the oldest are dropped (and removed from the repository).
    pub async fn restore(
        &self,
        repository: &dyn SubmissionRepository,
    ) -> Result<usize, PersistenceError> {
        let mut loaded = repository.load_all().await?;
        loaded.sort_by_key(|s| s.received_at());

        let (restored, evicted) = {
            let mut state = self.state.write();
            let mut restored = 0;
            for submission in loaded {
                if submission.id.is_empty() || state.index.contains_key(&submission.id) {
                    warn!(submission_id = %submission.id, "store_restore_duplicate_id");
                    continue;
                }
                state.insert(submission);
                restored += 1;
            }

            let overflow = state.by_time.len().saturating_sub(self.capacity);
            (restored, state.evict_oldest(overflow))
        };

        for id in &evicted {
            if let Err(e) = repository.remove(id).await {
                warn!(submission_id = %id, error = %e, "persistence_write_error");
            }
        }

        info!(
            restored = restored,
            evicted = evicted.len(),
            "store_restored"
        );
        Ok(restored - evicted.len().min(restored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use serde_json::{json, Map, Value};

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn submission_at(form_id: &str, received_at: DateTime<Utc>, fields: Value) -> Submission {
        let fields: Map<String, Value> = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Submission::new(
            form_id.to_string(),
            fields,
            SubmissionMetadata {
                sender_identity: Some("sender@example.com".to_string()),
                client_address: None,
                user_agent: None,
                received_at,
                signature_valid: true,
                key_id: Some("key-a".to_string()),
            },
        )
    }

    fn nth(n: i64) -> Submission {
        submission_at(
            "contact",
            base_time() + ChronoDuration::seconds(n),
            json!({ "n": n }),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let store = SubmissionStore::new(10);
        let mut s = nth(1);
        s.id = "caller-chosen".to_string();

        let id = store.insert(s);
        assert_ne!(id, "caller-chosen");
        let fetched = store.get(&id).unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.fields["n"], json!(1));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest_tenth() {
        let store = SubmissionStore::new(100);
        let ids: Vec<String> = (0..100).map(|n| store.insert(nth(n))).collect();
        assert_eq!(store.len(), 100);

        let newest = store.insert(nth(1000));
        assert_eq!(store.len(), 100 - 10 + 1);
        for id in &ids[..10] {
            assert!(store.get(id).is_none());
        }
        for id in &ids[10..] {
            assert!(store.get(id).is_some());
        }
        assert!(store.get(&newest).is_some());
    }

    #[test]
    fn test_eviction_orders_by_received_at_then_insertion() {
        let store = SubmissionStore::new(10);
        // Inserted newest-first, plus a tie at the oldest timestamp.
        let late = store.insert(nth(50));
        let tie_first = store.insert(nth(0));
        let tie_second = store.insert(nth(0));
        for n in 1..8 {
            store.insert(nth(n));
        }
        assert_eq!(store.len(), 10);

        store.insert(nth(100));
        // Batch of one: the earliest-inserted of the tied oldest entries.
        assert!(store.get(&tie_first).is_none());
        assert!(store.get(&tie_second).is_some());
        assert!(store.get(&late).is_some());
    }

    #[test]
    fn test_small_capacity_still_bounded() {
        let store = SubmissionStore::new(3);
        for n in 0..20 {
            store.insert(nth(n));
            assert!(store.len() <= 3);
        }
    }

    #[test]
    fn test_capacity_ten_thousand_scenario() {
        let store = SubmissionStore::new(DEFAULT_CAPACITY);
        let first_ids: Vec<String> = (0..10_000).map(|n| store.insert(nth(n))).collect();

        let id = store.insert(nth(20_000));
        assert_eq!(store.len(), 9_001);
        assert!(store.get(&id).is_some());
        assert!(first_ids[..1_000].iter().all(|id| store.get(id).is_none()));
        assert!(store.get(&first_ids[1_000]).is_some());
    }

    #[test]
    fn test_concurrent_inserts_are_all_kept() {
        let store = Arc::new(SubmissionStore::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|n| store.insert(nth(t * 1000 + n)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<&String> = ids.iter().collect();

        assert_eq!(ids.len(), 2_000);
        assert_eq!(unique.len(), 2_000);
        assert_eq!(store.len(), 2_000);
    }

    #[test]
    fn test_list_filters_sorts_and_pages() {
        let store = SubmissionStore::new(100);
        for n in 0..30 {
            let form = if n % 3 == 0 { "survey" } else { "contact" };
            let mut s = submission_at(form, base_time() + ChronoDuration::minutes(n), json!({}));
            s.metadata.signature_valid = n % 2 == 0;
            store.insert(s);
        }

        let all = store.list(&ListFilter::default(), 1, 10);
        assert_eq!(all.total, 30);
        assert_eq!(all.items.len(), 10);
        assert!(all
            .items
            .windows(2)
            .all(|w| w[0].received_at() >= w[1].received_at()));

        let last = store.list(&ListFilter::default(), 3, 10);
        assert_eq!(last.items.len(), 10);
        assert_eq!(last.items[9].received_at(), base_time());
        assert!(store.list(&ListFilter::default(), 4, 10).items.is_empty());

        let filter = ListFilter {
            form_id: Some("survey".to_string()),
            validated_only: true,
            from: Some(base_time() + ChronoDuration::minutes(6)),
            until: None,
        };
        let page = store.list(&filter, 1, 50);
        // Survey at even minutes 6, 12, 18, 24.
        assert_eq!(page.total, 4);
        assert!(page.items.iter().all(|s| s.form_id == "survey"));
    }

    #[test]
    fn test_list_page_size_bounds() {
        let store = SubmissionStore::new(10);
        store.insert(nth(0));
        let page = store.list(&ListFilter::default(), 0, 0);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(store.list(&ListFilter::default(), 1, 10_000).page_size, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let store = SubmissionStore::new(10);
        store.insert(submission_at("contact", base_time(), json!({"message": "Need a QUOTE"})));
        store.insert(submission_at("contact", base_time(), json!({"message": "hello"})));

        assert_eq!(store.search("quote").len(), 1);
        assert_eq!(store.search("SENDER@EXAMPLE").len(), 2);
        assert!(store.search("   ").is_empty());
    }

    #[test]
    fn test_cleanup_removes_only_older_entries() {
        let store = SubmissionStore::new(100);
        let now = Utc::now();
        let old = store.insert(submission_at("contact", now - ChronoDuration::days(40), json!({})));
        store.insert(submission_at("contact", now - ChronoDuration::days(31), json!({})));
        let recent = store.insert(submission_at("contact", now - ChronoDuration::days(2), json!({})));

        assert_eq!(store.cleanup(30), 2);
        assert!(store.get(&old).is_none());
        assert!(store.get(&recent).is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.cleanup(30), 0);
    }

    #[test]
    fn test_stats() {
        let store = SubmissionStore::new(10);
        store.insert(nth(0));
        let mut unverified = submission_at("survey", base_time(), json!({}));
        unverified.metadata.signature_valid = false;
        store.insert(unverified);

        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.validated, 1);
        assert_eq!(stats.by_form.get("survey"), Some(&1));
    }

    #[tokio::test]
    async fn test_mutations_are_mirrored_and_restorable() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(JsonDirRepository::open(dir.path()).await.unwrap());
        let (writer, _handle) = PersistenceWriter::spawn(repo.clone(), 64);
        let store = SubmissionStore::new(10).with_persistence(writer.clone());

        let ids: Vec<String> = (0..10).map(|n| store.insert(nth(n))).collect();
        // Overflow evicts the oldest one.
        store.insert(nth(100));
        writer.flush().await.unwrap();

        let restored = SubmissionStore::new(10);
        assert_eq!(restored.restore(repo.as_ref()).await.unwrap(), 10);
        assert!(restored.get(&ids[0]).is_none());
        assert!(restored.get(&ids[1]).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_mirror_matches_memory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(JsonDirRepository::open(dir.path()).await.unwrap());
        let (writer, _handle) = PersistenceWriter::spawn(repo.clone(), 4096);
        let store = Arc::new(SubmissionStore::new(4).with_persistence(writer.clone()));

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.insert(nth(i * 8 + t));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        writer.flush().await.unwrap();
        assert_eq!(writer.dropped(), 0);

        let mut in_memory: Vec<String> = store
            .list(&ListFilter::default(), 1, MAX_PAGE_SIZE)
            .items
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut on_disk: Vec<String> = repo
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        in_memory.sort();
        on_disk.sort();
        assert_eq!(on_disk, in_memory);
    }

    #[tokio::test]
    async fn test_restore_trims_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonDirRepository::open(dir.path()).await.unwrap();
        for n in 0..5 {
            let mut s = nth(n);
            s.id = format!("id-{}", n);
            repo.save(&s).await.unwrap();
        }

        let store = SubmissionStore::new(3);
        assert_eq!(store.restore(&repo).await.unwrap(), 3);
        assert!(store.get("id-0").is_none());
        assert!(store.get("id-4").is_some());
        assert_eq!(repo.load_all().await.unwrap().len(), 3);
    }
}
