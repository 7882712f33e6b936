use super::{error::Result, QueueStore};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Everything the store holds, behind one lock so that multi-queue
/// operations are atomic exactly like a Redis script.
#[derive(Default)]
struct State {
    /// Lists keyed by name. Front is the head (newest), back is the tail.
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    sets: HashMap<String, BTreeSet<String>>,
    /// Expiring keys and the instant they expire.
    expiring: HashMap<String, Instant>,
}

impl State {
    fn pop_into(&mut self, source: &str, destination: &str) -> Option<Vec<u8>> {
        let entry = self.lists.get_mut(source)?.pop_back()?;
        self.lists
            .entry(destination.to_string())
            .or_default()
            .push_front(entry.clone());
        Some(entry)
    }

    fn remove(&mut self, queue: &str, entry: &[u8]) -> bool {
        let Some(list) = self.lists.get_mut(queue) else {
            return false;
        };
        match list.iter().position(|e| e.as_slice() == entry) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }
}

/// In-memory queue store.
///
/// Suitable for tests and for running several engines inside one process:
/// every engine holding the same `Arc<InMemoryQueueStore>` sees the same
/// queues, so crash recovery between "workers" can be exercised without a
/// Redis server. Nothing survives the process.
///
/// Blocking pops are event driven: every push wakes the waiters, which then
/// race for the entry under the lock.
pub struct InMemoryQueueStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl InMemoryQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            pushed: Notify::new(),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        // Operations never panic midway, so a poisoned lock is still consistent.
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push(&self, queue: &str, entry: &[u8]) -> Result<()> {
        self.with_state(|state| {
            state
                .lists
                .entry(queue.to_string())
                .or_default()
                .push_front(entry.to_vec());
        });
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_into(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking, so a push landing between
            // the check and the wait still wakes us.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.with_state(|state| state.pop_into(source, destination)) {
                if source != destination {
                    self.pushed.notify_waiters();
                }
                return Ok(Some(entry));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove(&self, queue: &str, entry: &[u8]) -> Result<bool> {
        Ok(self.with_state(|state| state.remove(queue, entry)))
    }

    async fn move_entry(&self, source: &str, destination: &str, entry: &[u8]) -> Result<bool> {
        let moved = self.with_state(|state| {
            if !state.remove(source, entry) {
                return false;
            }
            state
                .lists
                .entry(destination.to_string())
                .or_default()
                .push_front(entry.to_vec());
            true
        });
        if moved {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn drain(&self, source: &str, destination: &str) -> Result<u64> {
        let moved = self.with_state(|state| {
            let Some(mut drained) = state.lists.remove(source) else {
                return 0;
            };
            let count = drained.len() as u64;
            let target = state.lists.entry(destination.to_string()).or_default();
            // Oldest first, so the drained entries keep their relative order
            // and land behind (newer than) everything already queued.
            while let Some(entry) = drained.pop_back() {
                target.push_front(entry);
            }
            count
        });
        if moved > 0 {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn entries(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self.with_state(|state| {
            state
                .lists
                .get(queue)
                .map(|list| list.iter().rev().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        Ok(self.with_state(|state| state.lists.get(queue).map_or(0, VecDeque::len)))
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<()> {
        self.with_state(|state| {
            state
                .sets
                .entry(set.to_string())
                .or_default()
                .insert(member.to_string());
        });
        Ok(())
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<()> {
        self.with_state(|state| {
            if let Some(members) = state.sets.get_mut(set) {
                members.remove(member);
            }
        });
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self.with_state(|state| {
            state
                .sets
                .get(set)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn set_expiring(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_state(|state| {
            state.expiring.insert(key.to_string(), Instant::now() + ttl);
        });
        Ok(())
    }

    async fn is_live(&self, key: &str) -> Result<bool> {
        Ok(self.with_state(|state| match state.expiring.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                state.expiring.remove(key);
                false
            }
            None => false,
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_state(|state| {
            state.lists.remove(key);
            state.sets.remove(key);
            state.expiring.remove(key);
        });
        Ok(())
    }
}
