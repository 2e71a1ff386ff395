// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-worker cooperative timer wheel.
//!
//! A single-level wheel of fixed slots, each covering one tick of the worker
//! loop (10 ms). Entries further out than one revolution carry a rounds
//! counter and are skipped until it reaches zero. Due timers fire in
//! insertion order. When the loop falls behind, missed ticks coalesce: a
//! repeating timer fires at most once per pending period and its next fire
//! moves to `now + interval`.

use std::collections::{HashSet, VecDeque};

/// Wheel tick granularity in milliseconds (the worker loop period).
pub const TICK_MS: i64 = 10;

const WHEEL_SLOTS: usize = 256;

/// One timer expiry, addressed to the owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFire {
    /// Timer id returned by [`TimerWheel::repeat`].
    pub id: u32,
    /// Owning service id.
    pub owner: u32,
    /// True on the final invocation (repeat count exhausted).
    pub removed: bool,
}

#[derive(Debug)]
struct Entry {
    id: u32,
    owner: u32,
    interval_ms: i64,
    rounds: u32,
    /// Remaining fire count; -1 repeats forever.
    times: i32,
}

/// Timer wheel owned by one worker; never shared across threads.
#[derive(Debug)]
pub struct TimerWheel {
    slots: Vec<VecDeque<Entry>>,
    cursor: usize,
    next_id: u32,
    active: HashSet<u32>,
    cancelled: HashSet<u32>,
    last_ms: i64,
}

impl TimerWheel {
    /// Create a wheel anchored at `now_ms` (worker monotonic clock).
    pub fn new(now_ms: i64) -> Self {
        Self {
            slots: (0..WHEEL_SLOTS).map(|_| VecDeque::new()).collect(),
            cursor: 0,
            next_id: 0,
            active: HashSet::new(),
            cancelled: HashSet::new(),
            last_ms: now_ms,
        }
    }

    /// Register a repeating timer.
    ///
    /// Fires every `interval_ms` milliseconds, `times` times (-1 repeats
    /// until removed). Returns the timer id, or 0 when the arguments are
    /// invalid.
    pub fn repeat(&mut self, interval_ms: i64, times: i32, owner: u32) -> u32 {
        if interval_ms <= 0 || times == 0 || times < -1 {
            return 0;
        }
        let id = self.alloc_id();
        self.active.insert(id);
        self.schedule(Entry {
            id,
            owner,
            interval_ms,
            rounds: 0,
            times,
        });
        id
    }

    /// Cancel a timer. Best-effort: returns `false` when the id is not live.
    pub fn remove(&mut self, id: u32) -> bool {
        if self.active.remove(&id) {
            self.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True when no timers are registered.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Advance the wheel to `now_ms`, appending expiries to `out`.
    pub fn update(&mut self, now_ms: i64, out: &mut Vec<TimerFire>) {
        let elapsed = (now_ms - self.last_ms) / TICK_MS;
        if elapsed <= 0 {
            return;
        }
        self.last_ms += elapsed * TICK_MS;

        // One full revolution visits every slot, so further catch-up would
        // only refire timers we are about to reschedule to now + interval.
        let steps = (elapsed as usize).min(WHEEL_SLOTS);
        let mut requeue = Vec::new();

        for _ in 0..steps {
            self.cursor = (self.cursor + 1) % WHEEL_SLOTS;
            let mut due = std::mem::take(&mut self.slots[self.cursor]);
            while let Some(mut entry) = due.pop_front() {
                if self.cancelled.remove(&entry.id) {
                    continue;
                }
                if entry.rounds > 0 {
                    entry.rounds -= 1;
                    self.slots[self.cursor].push_back(entry);
                    continue;
                }
                let last = entry.times == 1;
                out.push(TimerFire {
                    id: entry.id,
                    owner: entry.owner,
                    removed: last,
                });
                if last {
                    self.active.remove(&entry.id);
                } else {
                    if entry.times > 0 {
                        entry.times -= 1;
                    }
                    requeue.push(entry);
                }
            }
        }

        for entry in requeue {
            self.schedule(entry);
        }
    }

    fn schedule(&mut self, mut entry: Entry) {
        let ticks = (entry.interval_ms / TICK_MS).max(1) as usize;
        entry.rounds = ((ticks - 1) / WHEEL_SLOTS) as u32;
        let slot = (self.cursor + ticks) % WHEEL_SLOTS;
        self.slots[slot].push_back(entry);
    }

    fn alloc_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                continue;
            }
            if !self.active.contains(&self.next_id) && !self.cancelled.contains(&self.next_id) {
                return self.next_id;
            }
        }
    }
}
