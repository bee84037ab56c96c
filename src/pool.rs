// Copyright 2024 Happensit
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection record pooling.
//!
//! Each worker owns a fixed array of records with a plain LIFO index stack
//! as its free list; no synchronization is involved on that path, and LIFO
//! reuse keeps the hottest record's cache lines warm. When a worker's array
//! is exhausted it borrows boxed records from a process-wide
//! [`FallbackPool`], a lock-free fixed-capacity queue whose pop/push pair
//! publishes record writes between workers with acquire/release ordering.
//! The queue stores owned boxes in a fixed array with per-slot stamps, so
//! the ABA problem of pointer-recycling stacks does not arise.
//!
//! Tokens are not bare slot indices: the low bits address the slot and the
//! high bits carry a tenancy generation, assigned from a per-pool counter
//! on every acquire. A readiness event captured for a connection that was
//! closed and whose slot was reacquired within the same poll batch still
//! carries the old generation, so [`ConnPool::get_mut`] and
//! [`ConnPool::release`] refuse it instead of handing over (or tearing
//! down) the slot's new occupant — the same stale-handle defense the timer
//! heap applies to cancelled nodes.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use mio::Token;
use slab::Slab;

use crate::connection::{Conn, State};

/// Token bits that address the record slot; the remainder carries the
/// tenancy generation.
const SLOT_BITS: u32 = 24;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;

fn compose(slot: usize, generation: u32) -> Token {
    debug_assert!(slot <= SLOT_MASK);
    Token(((generation as usize) << SLOT_BITS) | slot)
}

fn slot_of(token: Token) -> usize {
    token.0 & SLOT_MASK
}

fn generation_matches(token: Token, generation: u32) -> bool {
    (token.0 & !SLOT_MASK) == ((generation as usize) << SLOT_BITS)
}

/// Process-wide reserve of connection records, drawn on only when a
/// worker's local pool is empty.
#[derive(Debug)]
pub struct FallbackPool {
    queue: ArrayQueue<Box<Conn>>,
}

impl FallbackPool {
    /// Preallocates `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let queue = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity {
            let _ = queue.push(Box::new(Conn::new()));
        }
        Self { queue }
    }

    /// Records currently available.
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    fn pop(&self) -> Option<Box<Conn>> {
        self.queue.pop()
    }

    fn push(&self, conn: Box<Conn>) {
        // Conservation of records means the queue cannot be over-full; if
        // an extra record ever shows up, dropping it is the safe outcome.
        let _ = self.queue.push(conn);
    }
}

/// A worker's view of connection storage: its own fixed record array plus
/// any records currently on loan from the shared fallback.
///
/// Records are addressed by [`Token`]: indices below the local capacity hit
/// the local array, the rest an overflow slab keyed above it.
#[derive(Debug)]
pub struct ConnPool {
    local: Box<[Conn]>,
    free: Vec<u32>,
    overflow: Slab<Box<Conn>>,
    shared: Arc<FallbackPool>,
    /// Next tenancy generation, bumped on every acquire.
    next_generation: u32,
}

impl ConnPool {
    /// Builds a pool of `local_capacity` records backed by `shared`.
    pub fn new(local_capacity: usize, shared: Arc<FallbackPool>) -> Self {
        debug_assert!(local_capacity <= SLOT_MASK);
        let local: Box<[Conn]> = (0..local_capacity).map(|_| Conn::new()).collect();

        Self {
            local,
            free: (0..local_capacity as u32).rev().collect(),
            overflow: Slab::new(),
            shared,
            next_generation: 0,
        }
    }

    fn next_generation(&mut self) -> u32 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        generation
    }

    /// Number of records currently in use.
    pub fn active(&self) -> usize {
        (self.local.len() - self.free.len()) + self.overflow.len()
    }

    /// Hands out a scrubbed record: state Reading, no descriptor, counters
    /// zeroed, parser reinitialized, fresh tenancy generation. Returns
    /// `None` when both the local array and the shared fallback are
    /// exhausted.
    pub fn acquire(&mut self) -> Option<Token> {
        let generation = self.next_generation();

        if let Some(idx) = self.free.pop() {
            let conn = &mut self.local[idx as usize];
            debug_assert_eq!(State::Free, conn.state);
            conn.scrub();
            conn.generation = generation;
            return Some(compose(idx as usize, generation));
        }

        let mut conn = self.shared.pop()?;
        conn.scrub();
        conn.generation = generation;
        let key = self.overflow.insert(conn);
        Some(compose(self.local.len() + key, generation))
    }

    /// Looks up a live record. The token's generation must match the
    /// slot's current tenancy: a token whose slot has been released and
    /// reacquired resolves to `None`, never to the new occupant. A
    /// released-but-unreused token resolves to its record still in the
    /// Free state; callers treat both as stale.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Conn> {
        let slot = slot_of(token);
        let conn = if slot < self.local.len() {
            &mut self.local[slot]
        } else {
            &mut **self.overflow.get_mut(slot - self.local.len())?
        };

        if !generation_matches(token, conn.generation) {
            return None;
        }
        Some(conn)
    }

    /// Returns the record to its pool. Idempotent: releasing a record that
    /// is already Free does nothing, and a stale token (slot since handed
    /// to a new tenancy) never evicts the current occupant.
    pub fn release(&mut self, token: Token) {
        let slot = slot_of(token);
        if slot < self.local.len() {
            let conn = &mut self.local[slot];
            if !generation_matches(token, conn.generation) || conn.state == State::Free {
                return;
            }
            conn.state = State::Free;
            conn.stream = None;
            conn.peer = None;
            conn.timer = None;
            self.free.push(slot as u32);
        } else {
            let key = slot - self.local.len();
            match self.overflow.get(key) {
                Some(conn) if generation_matches(token, conn.generation) => {}
                _ => return,
            }
            if let Some(mut conn) = self.overflow.try_remove(key) {
                conn.state = State::Free;
                conn.stream = None;
                conn.peer = None;
                conn.timer = None;
                self.shared.push(conn);
            }
        }
    }

    /// Tokens of every record currently in use, for shutdown teardown.
    pub fn live_tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .local
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state != State::Free)
            .map(|(i, c)| compose(i, c.generation))
            .collect();
        tokens.extend(
            self.overflow
                .iter()
                .map(|(k, c)| compose(self.local.len() + k, c.generation)),
        );
        tokens
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    fn pool(local: usize, fallback: usize) -> ConnPool {
        ConnPool::new(local, Arc::new(FallbackPool::new(fallback)))
    }

    #[test]
    fn acquire_hands_out_distinct_records_until_exhaustion() {
        let mut pool = pool(4, 2);
        let mut seen = HashSet::new();

        for _ in 0..6 {
            let token = pool.acquire().expect("pool should have capacity");
            assert!(seen.insert(token.0), "token {token:?} handed out twice");
        }
        assert!(pool.acquire().is_none());
        assert_eq!(6, pool.active());
    }

    #[test]
    fn released_records_are_all_reacquirable() {
        let mut pool = pool(3, 3);

        let first: Vec<Token> = (0..6).map(|_| pool.acquire().unwrap()).collect();
        for &t in &first {
            pool.release(t);
        }
        assert_eq!(0, pool.active());

        let second: Vec<Token> = (0..6).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(6, second.iter().map(|t| t.0).collect::<HashSet<_>>().len());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn local_free_list_is_lifo() {
        let mut pool = pool(4, 0);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(b);
        pool.release(a);

        // Most recently released slot is reused first; each reuse is a new
        // tenancy, so only the slot half of the token repeats.
        let a2 = pool.acquire().unwrap();
        let b2 = pool.acquire().unwrap();
        assert_eq!(slot_of(a), slot_of(a2));
        assert_eq!(slot_of(b), slot_of(b2));
        assert_ne!(a, a2);
        assert_ne!(b, b2);
    }

    #[test]
    fn double_release_is_idempotent() {
        let mut pool = pool(2, 0);

        let a = pool.acquire().unwrap();
        pool.release(a);
        pool.release(a);

        let x = pool.acquire().unwrap();
        let y = pool.acquire().unwrap();
        assert_ne!(x.0, y.0, "double release duplicated a free-list entry");
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn acquire_scrubs_previous_use() {
        let mut pool = pool(1, 0);

        let t = pool.acquire().unwrap();
        {
            let conn = pool.get_mut(t).unwrap();
            conn.read_len = 42;
            conn.hdr_len = 13;
            conn.bytes_sent = 7;
            conn.keep_alive = true;
            conn.state = State::Writing;
        }
        pool.release(t);

        let t2 = pool.acquire().unwrap();
        let conn = pool.get_mut(t2).unwrap();
        assert_eq!(State::Reading, conn.state);
        assert_eq!(0, conn.read_len);
        assert_eq!(0, conn.hdr_len);
        assert_eq!(0, conn.bytes_sent);
        assert!(!conn.keep_alive);
    }

    #[test]
    fn fallback_records_return_to_the_shared_pool() {
        let shared = Arc::new(FallbackPool::new(2));
        let mut a = ConnPool::new(1, Arc::clone(&shared));
        let mut b = ConnPool::new(1, Arc::clone(&shared));

        let _a0 = a.acquire().unwrap();
        let a1 = a.acquire().unwrap();
        assert!(a1.0 >= 1, "second acquire should borrow from the fallback");
        assert_eq!(1, shared.available());

        a.release(a1);
        assert_eq!(2, shared.available());

        let _b0 = b.acquire().unwrap();
        let b1 = b.acquire().unwrap();
        let b2 = b.acquire().unwrap();
        assert!(b.get_mut(b1).is_some());
        assert!(b.get_mut(b2).is_some());
        assert_eq!(0, shared.available());
        assert!(b.acquire().is_none());
    }

    #[test]
    fn stale_overflow_tokens_resolve_to_none() {
        let mut pool = pool(1, 1);

        let _local = pool.acquire().unwrap();
        let loaned = pool.acquire().unwrap();
        pool.release(loaned);
        assert!(pool.get_mut(loaned).is_none());
        // Releasing again must not double-return the record.
        pool.release(loaned);
        assert_eq!(1, pool.shared.available());
    }

    #[test]
    fn stale_local_tokens_do_not_reach_a_reused_slot() {
        let mut pool = pool(1, 0);

        let old = pool.acquire().unwrap();
        pool.release(old);

        // Same slot, next tenancy — as happens when a timed-out token is
        // released and the slot reacquired within one reactor iteration.
        let new = pool.acquire().unwrap();
        assert_eq!(slot_of(old), slot_of(new));
        assert_ne!(old, new);

        assert!(pool.get_mut(old).is_none());
        assert!(pool.get_mut(new).is_some());

        // A stale release must not evict the new tenant.
        pool.release(old);
        assert!(pool.get_mut(new).is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn stale_overflow_tokens_do_not_reach_a_reused_key() {
        let mut pool = pool(1, 2);

        let _local = pool.acquire().unwrap();
        let loaned = pool.acquire().unwrap();
        pool.release(loaned);

        // Reoccupy the same slab key with a different record.
        let replacement = pool.acquire().unwrap();
        assert_eq!(slot_of(loaned), slot_of(replacement));
        assert_ne!(loaned, replacement);

        assert!(pool.get_mut(loaned).is_none());
        assert!(pool.get_mut(replacement).is_some());

        // A stale release must not send the replacement back to the
        // shared pool.
        pool.release(loaned);
        assert!(pool.get_mut(replacement).is_some());
        assert_eq!(1, pool.shared.available());
    }
}
