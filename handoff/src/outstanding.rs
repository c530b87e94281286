use parking_lot::{Condvar, Mutex, MutexGuard};
use protocol::TokenTuple;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum InsertError<T> {
    Full(T),
    Duplicate(T),
}

struct Entry<T> {
    tokens: TokenTuple,
    value: T,
}

/// Fixed-capacity map from a token tuple to the value lent under it.
///
/// Slots live in an arena with a free list; a token index gives O(1) lookup
/// on release. The table refuses inserts beyond its capacity.
pub struct OutstandingTable<T> {
    slots: Vec<Option<Entry<T>>>,
    free: Vec<usize>,
    index: HashMap<TokenTuple, usize>,
}

impl<T> OutstandingTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        OutstandingTable {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Stores `value` under `tokens` and returns its slot. On failure the
    /// value is handed back so the caller decides where it gets dropped.
    pub fn insert(&mut self, tokens: TokenTuple, value: T) -> Result<usize, InsertError<T>> {
        if self.index.contains_key(&tokens) {
            return Err(InsertError::Duplicate(value));
        }
        let Some(slot) = self.free.pop() else {
            return Err(InsertError::Full(value));
        };
        self.slots[slot] = Some(Entry { tokens, value });
        self.index.insert(tokens, slot);
        Ok(slot)
    }

    pub fn remove(&mut self, tokens: &TokenTuple) -> Option<T> {
        let slot = self.index.remove(tokens)?;
        let entry = self.slots[slot].take()?;
        self.free.push(slot);
        Some(entry.value)
    }

    pub fn contains(&self, tokens: &TokenTuple) -> bool {
        self.index.contains_key(tokens)
    }

    pub fn slot_of(&self, tokens: &TokenTuple) -> Option<usize> {
        self.index.get(tokens).copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Empties the table, returning every entry.
    pub fn drain(&mut self) -> Vec<(TokenTuple, T)> {
        self.index.clear();
        self.free = (0..self.slots.len()).rev().collect();
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.take())
            .map(|entry| (entry.tokens, entry.value))
            .collect()
    }
}

/// State behind a mutex paired with a condition variable signaled on change.
pub struct Guarded<S> {
    state: Mutex<S>,
    changed: Condvar,
}

impl<S> Guarded<S> {
    pub fn new(state: S) -> Self {
        Guarded {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock()
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Waits until `done` holds or `timeout` elapses. Returns whether `done`
    /// held when the wait ended.
    pub fn wait_until<F>(&self, guard: &mut MutexGuard<'_, S>, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&S) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !done(&**guard) {
            if self.changed.wait_until(guard, deadline).timed_out() {
                return done(&**guard);
            }
        }
        true
    }
}
