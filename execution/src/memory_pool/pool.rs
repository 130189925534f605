// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! [`MemoryPool`] implementations: the unbounded default and the bounded
//! pool that drives the join's spilling.

use std::sync::atomic::{AtomicUsize, Ordering};

use grace_common::{resources_grace_err, GraceError, Result};
use log::debug;

use crate::memory_pool::{human_readable_size, MemoryPool, MemoryReservation};

/// A [`MemoryPool`] with no limit: every reservation request succeeds.
///
/// This is the default pool of a `RuntimeEnv`, used when the join should
/// never spill. Usage is still tracked so that the resource-balance
/// invariant (everything returned by the time the stream is dropped) stays
/// observable.
#[derive(Debug, Default)]
pub struct UnboundedMemoryPool {
    used: AtomicUsize,
}

impl MemoryPool for UnboundedMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        self.used.fetch_add(additional, Ordering::Relaxed);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        self.grow(reservation, additional);
        Ok(())
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

/// A [`MemoryPool`] enforcing a fixed budget, first come first served.
///
/// This is the pool behind `RuntimeConfig::with_memory_limit`. For the
/// partitioned hash join a failed [`try_grow`](MemoryPool::try_grow) is not
/// fatal: the builder reacts by unpinning its largest partition and retrying,
/// so the budget directly controls how much of the build side ends up on
/// disk. The high-water mark of the pool is kept for diagnostics, mirroring
/// the operator's `build_mem_used` metric from the pool's point of view.
#[derive(Debug)]
pub struct GreedyMemoryPool {
    budget: usize,
    used: AtomicUsize,
    /// Highest concurrent usage observed over the pool's lifetime
    peak: AtomicUsize,
}

impl GreedyMemoryPool {
    /// Create a new pool handing out at most `budget` bytes
    pub fn new(budget: usize) -> Self {
        debug!("Created new GreedyMemoryPool(budget={budget})");
        Self {
            budget,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// The budget this pool enforces
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Highest concurrent usage observed so far
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    fn record_peak(&self, used: usize) {
        self.peak.fetch_max(used, Ordering::Relaxed);
    }
}

impl MemoryPool for GreedyMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        let used = self.used.fetch_add(additional, Ordering::Relaxed) + additional;
        self.record_peak(used);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        let new_used = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let new_used = used.checked_add(additional)?;
                (new_used <= self.budget).then_some(new_used)
            })
            .map_err(|used| budget_exhausted_err(reservation, additional, used, self.budget))?
            + additional;
        self.record_peak(new_used);
        Ok(())
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

/// Error for a reservation request the budget cannot cover.
///
/// For spill-capable consumers this is routinely caught and answered by
/// unpinning a partition; the message is written for the case where it
/// reaches the user instead, so it names the consumer and suggests the
/// remedy the consumer actually has.
#[inline(always)]
fn budget_exhausted_err(
    reservation: &MemoryReservation,
    additional: usize,
    in_use: usize,
    budget: usize,
) -> GraceError {
    let remedy = if reservation.consumer().can_spill() {
        "spilling more partitions or raising the memory limit"
    } else {
        "raising the memory limit"
    };
    resources_grace_err!(
        "{} needs {} more with {} of the {} pool already in use; consider {remedy}",
        reservation.consumer().name(),
        human_readable_size(additional),
        human_readable_size(in_use),
        human_readable_size(budget)
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use grace_common::assert_contains;

    use super::*;
    use crate::memory_pool::MemoryConsumer;

    #[test]
    fn greedy_pool_enforces_the_join_budget() {
        let greedy = Arc::new(GreedyMemoryPool::new(32_000));
        let pool: Arc<dyn MemoryPool> = Arc::clone(&greedy) as _;
        let mut stream = MemoryConsumer::new("PartitionedHashJoinStream[3]")
            .with_can_spill(true)
            .register(&pool);

        // a build partition that fits, then one that does not
        stream.try_grow(30_000).unwrap();
        let err = stream.try_grow(4_000).unwrap_err().to_string();

        assert_contains!(err.clone(), "PartitionedHashJoinStream[3]");
        assert_contains!(err.clone(), "pool already in use");
        // spill-capable consumers are pointed at spilling first
        assert_contains!(err, "spilling more partitions");

        // a failed request leaves both sides untouched
        assert_eq!(stream.size(), 30_000);
        assert_eq!(pool.reserved(), 30_000);
        assert_eq!(greedy.budget(), 32_000);
    }

    #[test]
    fn greedy_pool_records_the_high_water_mark() {
        let greedy = Arc::new(GreedyMemoryPool::new(16_000));
        let pool: Arc<dyn MemoryPool> = Arc::clone(&greedy) as _;
        let mut stream = MemoryConsumer::new("PartitionedHashJoinStream[0]")
            .with_can_spill(true)
            .register(&pool);

        // pin a partition, spill it, pin a smaller one
        stream.try_grow(11_000).unwrap();
        stream.shrink(11_000);
        stream.try_grow(6_000).unwrap();

        assert_eq!(pool.reserved(), 6_000);
        assert_eq!(greedy.peak(), 11_000);
    }

    #[test]
    fn non_spillable_consumers_get_a_different_remedy() {
        let pool: Arc<dyn MemoryPool> = Arc::new(GreedyMemoryPool::new(1_000));
        let mut hash_table = MemoryConsumer::new("pinned-hash-table").register(&pool);
        let err = hash_table.try_grow(2_000).unwrap_err().to_string();
        assert_contains!(err.clone(), "raising the memory limit");
        assert!(!err.contains("spilling"), "{err}");
    }

    #[test]
    fn unbounded_pool_never_fails_but_still_tracks() {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let mut stream = MemoryConsumer::new("PartitionedHashJoinStream[0]")
            .with_can_spill(true)
            .register(&pool);

        // far past any realistic budget
        stream.try_grow(usize::MAX / 4).unwrap();
        assert_eq!(pool.reserved(), usize::MAX / 4);

        drop(stream);
        assert_eq!(pool.reserved(), 0);
    }
}
