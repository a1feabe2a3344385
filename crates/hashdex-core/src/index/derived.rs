//! Generic derived-data index: one instance per index kind.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{IndexError, IndexResult};
use crate::models::{InputData, InputSnapshot, Stamp};
use crate::store::storage::{IndexStorage, UpdateDelta};

/// Forward index + inverted index + stamps for one kind.
///
/// `update` is diff-based: only keys whose presence or value changed touch
/// the inverted table. A storage fault during `update` flags the whole kind
/// for rebuild; until the rebuild runs the kind refuses reads.
pub struct DerivedDataIndex {
    name: String,
    version: u32,
    storage: Box<dyn IndexStorage>,
    write_lock: Mutex<()>,
    rebuild_pending: AtomicBool,
}

impl DerivedDataIndex {
    pub fn new(name: &str, version: u32, storage: Box<dyn IndexStorage>) -> Self {
        Self {
            name: name.to_string(),
            version,
            storage,
            write_lock: Mutex::new(()),
            rebuild_pending: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Pure read of the stamp; never recomputes.
    pub fn is_up_to_date(&self, input_id: u64, snapshot: &InputSnapshot) -> IndexResult<bool> {
        if self.is_rebuild_pending() {
            return Ok(false);
        }
        Ok(self
            .storage
            .read_stamp(input_id)?
            .is_some_and(|stamp| stamp.matches(snapshot)))
    }

    pub fn stamp(&self, input_id: u64) -> IndexResult<Option<Stamp>> {
        self.storage.read_stamp(input_id)
    }

    /// Replace the data of `input_id` with `new_data` and advance its stamp.
    /// Returns the applied delta.
    pub fn update(&self, input_id: u64, new_data: &InputData, stamp: Stamp) -> IndexResult<UpdateDelta> {
        self.apply(input_id, new_data, Some(stamp))
    }

    /// Drop all data and the stamp of `input_id`.
    pub fn remove_input(&self, input_id: u64) -> IndexResult<UpdateDelta> {
        self.apply(input_id, &InputData::new(), None)
    }

    fn apply(&self, input_id: u64, new_data: &InputData, stamp: Option<Stamp>) -> IndexResult<UpdateDelta> {
        if self.is_rebuild_pending() {
            debug!(kind = %self.name, input_id, "skipping update while rebuild is pending");
            return Ok(UpdateDelta::default());
        }
        let _guard = self.write_lock.lock();
        let result = self.storage.read_forward(input_id).and_then(|old| {
            let delta = UpdateDelta::between(&old, new_data);
            self.storage.commit(input_id, &delta, stamp)?;
            Ok(delta)
        });
        if let Err(e) = &result {
            if e.is_storage_fault() {
                self.request_rebuild(&e.to_string());
            }
        }
        result
    }

    /// Record an up-to-date stamp without touching data. Used when a chunk
    /// supplies the data for this input.
    pub fn set_stamp(&self, input_id: u64, stamp: Stamp) -> IndexResult<()> {
        self.guarded(|storage| storage.write_stamp(input_id, Some(stamp)))
    }

    /// Force the next `is_up_to_date` for `input_id` to report stale.
    pub fn reset_state_for_file(&self, input_id: u64) -> IndexResult<()> {
        self.guarded(|storage| storage.write_stamp(input_id, None))
    }

    fn guarded<T>(&self, op: impl FnOnce(&dyn IndexStorage) -> IndexResult<T>) -> IndexResult<T> {
        let result = op(self.storage.as_ref());
        if let Err(e) = &result {
            if e.is_storage_fault() {
                self.request_rebuild(&e.to_string());
            }
        }
        result
    }

    pub fn forward(&self, input_id: u64) -> IndexResult<InputData> {
        self.ensure_readable()?;
        self.storage.read_forward(input_id)
    }

    /// Inputs carrying `key`, with their values.
    pub fn values(&self, key: &str) -> IndexResult<Vec<(u64, Vec<u8>)>> {
        self.ensure_readable()?;
        self.storage.values_for_key(key)
    }

    pub fn keys(&self) -> IndexResult<Vec<String>> {
        self.ensure_readable()?;
        self.storage.keys()
    }

    pub fn input_count(&self) -> IndexResult<usize> {
        self.storage.input_count()
    }

    pub fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.input_count()? == 0)
    }

    fn ensure_readable(&self) -> IndexResult<()> {
        if self.is_rebuild_pending() {
            return Err(IndexError::RebuildPending(self.name.clone()));
        }
        Ok(())
    }

    // -- rebuild -------------------------------------------------------------

    pub fn request_rebuild(&self, reason: &str) {
        if !self.rebuild_pending.swap(true, Ordering::AcqRel) {
            warn!(kind = %self.name, %reason, "index kind scheduled for rebuild");
        }
    }

    pub fn is_rebuild_pending(&self) -> bool {
        self.rebuild_pending.load(Ordering::Acquire)
    }

    /// Drop all stored data and make the kind readable again. Every input
    /// becomes stale.
    pub fn rebuild(&self) -> IndexResult<()> {
        let _guard = self.write_lock.lock();
        self.storage.clear()?;
        self.rebuild_pending.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::storage::{MemoryIndexStorage, SqliteIndexStorage};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn data(keys: &[&str]) -> InputData {
        keys.iter()
            .map(|k| (k.to_string(), k.len().to_le_bytes().to_vec()))
            .collect()
    }

    fn snapshot(fingerprint: u64) -> InputSnapshot {
        InputSnapshot {
            fingerprint,
            kind_version: 1,
        }
    }

    fn reverse_map(index: &DerivedDataIndex) -> BTreeMap<String, Vec<(u64, Vec<u8>)>> {
        index
            .keys()
            .unwrap()
            .into_iter()
            .map(|k| {
                let values = index.values(&k).unwrap();
                (k, values)
            })
            .collect()
    }

    #[test]
    fn test_update_advances_stamp() {
        let index = DerivedDataIndex::new("words", 1, Box::new(MemoryIndexStorage::new()));
        assert!(!index.is_up_to_date(1, &snapshot(1)).unwrap());
        index.update(1, &data(&["a"]), Stamp::local(1, 1)).unwrap();
        assert!(index.is_up_to_date(1, &snapshot(1)).unwrap());
        assert!(!index.is_up_to_date(1, &snapshot(2)).unwrap());
        index.reset_state_for_file(1).unwrap();
        assert!(!index.is_up_to_date(1, &snapshot(1)).unwrap());
        assert_eq!(index.forward(1).unwrap(), data(&["a"]));
    }

    #[test]
    fn test_delta_is_proportional_to_changes() {
        let index = DerivedDataIndex::new("words", 1, Box::new(MemoryIndexStorage::new()));
        let many: Vec<String> = (0..100).map(|i| format!("key{i}")).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let delta = index.update(7, &data(&refs), Stamp::local(1, 1)).unwrap();
        assert_eq!(delta.len(), 100);

        let mut edited = refs.clone();
        edited.pop();
        edited.push("fresh");
        let delta = index.update(7, &data(&edited), Stamp::local(2, 1)).unwrap();
        assert_eq!(delta.removed, vec!["key99".to_string()]);
        assert_eq!(delta.upserted.len(), 1);
    }

    #[test]
    fn test_incremental_matches_full_rebuild() {
        let incremental =
            DerivedDataIndex::new("words", 1, Box::new(SqliteIndexStorage::open_in_memory().unwrap()));
        let history: &[(u64, &[&str])] = &[
            (1, &["a", "b", "c"]),
            (2, &["b", "c", "d"]),
            (1, &["c"]),
            (3, &["a", "dd"]),
            (2, &[]),
            (1, &["a", "b", "eee"]),
            (3, &["dd"]),
        ];
        let mut final_state: BTreeMap<u64, InputData> = BTreeMap::new();
        for (step, (input, keys)) in history.iter().enumerate() {
            let d = data(keys);
            incremental
                .update(*input, &d, Stamp::local(step as u64, 1))
                .unwrap();
            final_state.insert(*input, d);
        }

        let full = DerivedDataIndex::new("words", 1, Box::new(MemoryIndexStorage::new()));
        for (input, d) in &final_state {
            full.update(*input, d, Stamp::local(0, 1)).unwrap();
        }
        assert_eq!(reverse_map(&incremental), reverse_map(&full));
    }

    /// Storage whose commits fail after `fail_after` successful calls.
    struct FlakyStorage {
        inner: MemoryIndexStorage,
        commits: AtomicUsize,
        fail_after: usize,
    }

    impl IndexStorage for FlakyStorage {
        fn read_forward(&self, input_id: u64) -> IndexResult<InputData> {
            self.inner.read_forward(input_id)
        }
        fn read_stamp(&self, input_id: u64) -> IndexResult<Option<Stamp>> {
            self.inner.read_stamp(input_id)
        }
        fn write_stamp(&self, input_id: u64, stamp: Option<Stamp>) -> IndexResult<()> {
            self.inner.write_stamp(input_id, stamp)
        }
        fn commit(&self, input_id: u64, delta: &UpdateDelta, stamp: Option<Stamp>) -> IndexResult<()> {
            if self.commits.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
                return Err(IndexError::Storage("short write".into()));
            }
            self.inner.commit(input_id, delta, stamp)
        }
        fn values_for_key(&self, key: &str) -> IndexResult<Vec<(u64, Vec<u8>)>> {
            self.inner.values_for_key(key)
        }
        fn keys(&self) -> IndexResult<Vec<String>> {
            self.inner.keys()
        }
        fn input_count(&self) -> IndexResult<usize> {
            self.inner.input_count()
        }
        fn clear(&self) -> IndexResult<()> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_storage_fault_requests_rebuild() {
        let index = DerivedDataIndex::new(
            "words",
            1,
            Box::new(FlakyStorage {
                inner: MemoryIndexStorage::new(),
                commits: AtomicUsize::new(0),
                fail_after: 1,
            }),
        );
        index.update(1, &data(&["a"]), Stamp::local(1, 1)).unwrap();
        let err = index.update(2, &data(&["b"]), Stamp::local(1, 1)).unwrap_err();
        assert!(err.is_storage_fault());
        assert!(index.is_rebuild_pending());
        assert!(matches!(index.values("a"), Err(IndexError::RebuildPending(_))));
        assert!(!index.is_up_to_date(1, &snapshot(1)).unwrap());

        index.rebuild().unwrap();
        assert!(!index.is_rebuild_pending());
        assert!(index.values("a").unwrap().is_empty());
        assert!(!index.is_up_to_date(1, &snapshot(1)).unwrap());
    }
}
