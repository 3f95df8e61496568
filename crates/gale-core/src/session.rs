//! Sharded session registry with propagation-aware, TTL-capable contexts.
//!
//! Sessions are addressed by string id. The registry hashes ids with FNV-1a
//! onto a power-of-two shard array; each shard guards its own map with a
//! reader-writer lock so lookups on different shards never contend.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Default shard count (power of two).
const DEFAULT_SHARDS: usize = 16;

#[inline]
fn fnv1a_64(data: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Single-shot completion signal.
pub struct DoneSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl DoneSignal {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn signal(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cv.notify_all();
    }

    /// Returns true once the signal fired.
    pub fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks until the signal fires or `timeout` elapses; returns whether
    /// the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            done = guard;
        }
        true
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased context value.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

struct ContextEntry {
    value: ContextValue,
    propagated: bool,
    expires_at: Option<Instant>,
}

impl ContextEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Key/value store attached to a session.
///
/// Values are shallow (`Arc`-shared). A key flagged as *propagated* is
/// carried across explicit [`clone`](Clone::clone) calls; non-propagated
/// keys stay with the original context. Expired entries behave as absent.
pub struct SessionContext {
    entries: RwLock<HashMap<String, ContextEntry>>,
}

impl SessionContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stores a value under `key`, replacing any previous entry (and its
    /// expiry).
    pub fn set(&self, key: &str, value: ContextValue, propagated: bool) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key.to_owned(),
                ContextEntry {
                    value,
                    propagated,
                    expires_at: None,
                },
            );
    }

    /// Fetches the value for `key`; absent when missing or expired.
    pub fn get(&self, key: &str) -> Option<ContextValue> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Removes `key`.
    pub fn delete(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Sets an absolute expiry `ttl` from now for an existing key; affects
    /// subsequent reads. No-op for missing keys.
    pub fn with_expiration(&self, key: &str, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    /// Returns whether `key` carries the propagation flag (false when
    /// missing or expired).
    pub fn is_propagated(&self, key: &str) -> bool {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .is_some_and(|entry| entry.propagated)
    }

    /// Non-expired keys currently present.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl Clone for SessionContext {
    /// Independent shallow copy carrying the propagated, non-expired keys.
    /// Values are `Arc`-shared, never deep-copied.
    fn clone(&self) -> Self {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let copied: HashMap<String, ContextEntry> = entries
            .iter()
            .filter(|(_, entry)| entry.propagated && !entry.is_expired(now))
            .map(|(key, entry)| {
                (
                    key.clone(),
                    ContextEntry {
                        value: Arc::clone(&entry.value),
                        propagated: entry.propagated,
                        expires_at: entry.expires_at,
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(copied),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A long-lived peer identity with an attached context and completion
/// signal.
pub struct Session {
    id: String,
    context: SessionContext,
    done: DoneSignal,
    deadline: Mutex<Option<Instant>>,
    cancelled: AtomicBool,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            context: SessionContext::new(),
            done: DoneSignal::new(),
            deadline: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Completion signal, fired by cancellation.
    pub fn done(&self) -> &DoneSignal {
        &self.done
    }

    /// Sets an optional absolute deadline for the session.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancels the session and fires `done`. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.done.signal();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Shard {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

/// Hash-sharded map of session id → session.
pub struct SessionRegistry {
    shards: Vec<Shard>,
    mask: u64,
}

impl SessionRegistry {
    /// Creates a registry with the default shard count.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Creates a registry with `shards` partitions, rounded up to a power of
    /// two.
    pub fn with_shards(shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        Self {
            shards: (0..count)
                .map(|_| Shard {
                    sessions: RwLock::new(HashMap::new()),
                })
                .collect(),
            mask: (count - 1) as u64,
        }
    }

    #[inline]
    fn shard(&self, id: &str) -> &Shard {
        &self.shards[(fnv1a_64(id) & self.mask) as usize]
    }

    /// Creates the session for `id`, or returns the existing one
    /// (idempotent).
    pub fn create(&self, id: &str) -> Arc<Session> {
        let shard = self.shard(id);
        if let Some(session) = shard
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            return Arc::clone(session);
        }

        let mut sessions = shard.sessions.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            sessions
                .entry(id.to_owned())
                .or_insert_with(|| Arc::new(Session::new(id.to_owned()))),
        )
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.shard(id)
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(Arc::clone)
    }

    /// Explicit lookup that fails with `NotFound` for missing ids.
    pub fn lookup(&self, id: &str) -> crate::Result<Arc<Session>> {
        self.get(id)
            .ok_or_else(|| crate::Error::NotFound(format!("session {id:?}")))
    }

    /// Cancels and removes the session for `id`; returns whether it
    /// existed.
    pub fn delete(&self, id: &str) -> bool {
        let removed = self
            .shard(id)
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Iterates a snapshot of current sessions. The callback returns
    /// `false` to stop early.
    pub fn range(&self, mut f: impl FnMut(&Arc<Session>) -> bool) {
        let snapshot: Vec<Arc<Session>> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .sessions
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        for session in &snapshot {
            if !f(session) {
                break;
            }
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .sessions
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .len()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
