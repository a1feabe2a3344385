//! Per-project chunk attachment state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chunks::ChunkProvider;
use crate::models::ChunkId;

/// Result of one `try_attach` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachOutcome {
    /// The chunk is attached and may serve data.
    pub attached: bool,
    /// This caller ran the attach work.
    pub performed: bool,
}

#[derive(Default)]
struct RegistryState {
    /// One admission gate per chunk attempted this session. A gate resolves
    /// to the attach result exactly once.
    gates: HashMap<ChunkId, Arc<OnceLock<bool>>>,
    invalid: HashSet<ChunkId>,
}

/// Tracks attached and invalid chunks. A chunk is never in both sets.
#[derive(Default)]
pub struct ChunkRegistry {
    state: Mutex<RegistryState>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `chunk` through `provider` at most once per session.
    ///
    /// Concurrent callers for the same chunk block on one gate; exactly one
    /// of them performs the attach and all of them observe its result.
    pub fn try_attach(&self, chunk: ChunkId, provider: &dyn ChunkProvider) -> AttachOutcome {
        let gate = {
            let mut state = self.state.lock();
            if state.invalid.contains(&chunk) {
                return AttachOutcome {
                    attached: false,
                    performed: false,
                };
            }
            Arc::clone(state.gates.entry(chunk).or_default())
        };

        let mut performed = false;
        let attached = *gate.get_or_init(|| {
            performed = true;
            match provider.attach(chunk) {
                Ok(()) => {
                    debug!(%chunk, "attached shared chunk");
                    true
                }
                Err(e) => {
                    warn!(%chunk, error = %e, "shared chunk rejected; falling back to local indexing");
                    self.state.lock().invalid.insert(chunk);
                    false
                }
            }
        });
        AttachOutcome {
            attached,
            performed,
        }
    }

    pub fn is_invalid(&self, chunk: ChunkId) -> bool {
        self.state.lock().invalid.contains(&chunk)
    }

    pub fn is_attached(&self, chunk: ChunkId) -> bool {
        let state = self.state.lock();
        !state.invalid.contains(&chunk)
            && state
                .gates
                .get(&chunk)
                .is_some_and(|g| g.get() == Some(&true))
    }

    /// Move `chunk` to the invalid set. Returns false if it already was
    /// invalid. The caller resets the stamps of every file the chunk served.
    pub fn invalidate(&self, chunk: ChunkId) -> bool {
        let mut state = self.state.lock();
        state.gates.remove(&chunk);
        state.invalid.insert(chunk)
    }

    pub fn invalid_chunks(&self) -> Vec<ChunkId> {
        let mut chunks: Vec<ChunkId> = self.state.lock().invalid.iter().copied().collect();
        chunks.sort();
        chunks
    }

    /// Start a new scan session: rejected chunks get one fresh attempt.
    /// Chunks that attached stay attached.
    pub fn reset_session(&self) {
        let mut state = self.state.lock();
        state.invalid.clear();
        state.gates.retain(|_, gate| gate.get() == Some(&true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{IndexError, IndexResult};
    use crate::models::{ChunkHashId, ContentHash, HashId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    struct CountingProvider {
        calls: AtomicUsize,
        accept: bool,
    }

    impl CountingProvider {
        fn new(accept: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                accept,
            }
        }
    }

    impl ChunkProvider for CountingProvider {
        fn lookup(&self, _hash: &ContentHash) -> Option<ChunkHashId> {
            None
        }

        fn attach(&self, _chunk: ChunkId) -> IndexResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            if self.accept {
                Ok(())
            } else {
                Err(IndexError::Index("version mismatch".into()))
            }
        }

        fn detach(&self, _chunk: ChunkId) {}

        fn attached_chunks(&self) -> Vec<ChunkId> {
            Vec::new()
        }

        fn values(&self, _chunk: ChunkId, _kind: &str, _key: &str) -> IndexResult<Vec<(HashId, Vec<u8>)>> {
            Ok(Vec::new())
        }
    }

    fn race(accept: bool) -> (Vec<AttachOutcome>, usize) {
        const THREADS: usize = 8;
        let registry = Arc::new(ChunkRegistry::new());
        let provider = Arc::new(CountingProvider::new(accept));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let provider = Arc::clone(&provider);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.try_attach(ChunkId(1), provider.as_ref())
                })
            })
            .collect();
        let outcomes = handles.into_iter().map(|h| h.join().unwrap()).collect();
        (outcomes, provider.calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_concurrent_attach_runs_once() {
        let (outcomes, calls) = race(true);
        assert_eq!(calls, 1);
        assert_eq!(outcomes.iter().filter(|o| o.performed).count(), 1);
        assert!(outcomes.iter().all(|o| o.attached));
    }

    #[test]
    fn test_concurrent_failed_attach_agrees() {
        let (outcomes, calls) = race(false);
        assert_eq!(calls, 1);
        assert_eq!(outcomes.iter().filter(|o| o.performed).count(), 1);
        assert!(outcomes.iter().all(|o| !o.attached));
    }

    #[test]
    fn test_invalid_chunk_is_not_retried_within_session() {
        let registry = ChunkRegistry::new();
        let failing = CountingProvider::new(false);
        assert!(!registry.try_attach(ChunkId(4), &failing).attached);
        assert!(registry.is_invalid(ChunkId(4)));
        assert!(!registry.is_attached(ChunkId(4)));

        let again = registry.try_attach(ChunkId(4), &failing);
        assert!(!again.attached && !again.performed);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

        registry.reset_session();
        assert!(!registry.is_invalid(ChunkId(4)));
        let ok = CountingProvider::new(true);
        assert!(registry.try_attach(ChunkId(4), &ok).performed);
    }

    #[test]
    fn test_invalidate_moves_attached_to_invalid() {
        let registry = ChunkRegistry::new();
        let ok = CountingProvider::new(true);
        assert!(registry.try_attach(ChunkId(2), &ok).attached);
        assert!(registry.is_attached(ChunkId(2)));

        assert!(registry.invalidate(ChunkId(2)));
        assert!(!registry.invalidate(ChunkId(2)));
        assert!(!registry.is_attached(ChunkId(2)));
        assert_eq!(registry.invalid_chunks(), vec![ChunkId(2)]);
        assert!(!registry.try_attach(ChunkId(2), &ok).attached);

        registry.reset_session();
        assert!(registry.try_attach(ChunkId(2), &ok).attached);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 2);
    }
}
