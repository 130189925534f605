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

//! [`MemoryPool`] for memory management during join execution.

use std::sync::Arc;

mod pool;

pub use pool::*;

use grace_common::Result;

/// Tracks and potentially limits the memory a join instance may buffer.
///
/// The spill-capable join buffers state proportional to its build input: the
/// pinned rows of its hash partitions, the hash tables over them, and (for
/// the null-aware variant) the NULL-keyed auxiliary rows. All of that is
/// requested from a `MemoryPool` through a [`MemoryReservation`] before it is
/// allocated. A request the pool cannot satisfy is the signal to unpin a
/// partition — spill it to disk, shrink the reservation — and retry; only
/// when nothing is left to spill does the failure surface as an error.
///
/// Memory that merely streams through the operator (one input batch at a
/// time, spill-file write buffers) is not tracked.
///
/// A pool may be shared by several concurrently executing join instances;
/// per the execution model they share nothing else.
pub trait MemoryPool: Send + Sync + std::fmt::Debug {
    /// Registers a new [`MemoryConsumer`].
    ///
    /// Note: Subsequent calls to [`Self::grow`] must be made to reserve memory
    fn register(&self, _consumer: &MemoryConsumer) {}

    /// Records the destruction of a [`MemoryReservation`] with [`MemoryConsumer`]
    ///
    /// Note: Prior calls to [`Self::shrink`] must be made to free any reserved memory
    fn unregister(&self, _consumer: &MemoryConsumer) {}

    /// Infallibly grow the provided `reservation` by `additional` bytes
    ///
    /// This must always succeed
    fn grow(&self, reservation: &MemoryReservation, additional: usize);

    /// Infallibly shrink the provided `reservation` by `shrink` bytes
    fn shrink(&self, reservation: &MemoryReservation, shrink: usize);

    /// Attempt to grow the provided `reservation` by `additional` bytes
    ///
    /// On error the `allocation` will not be increased in size
    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()>;

    /// Return the total amount of memory reserved
    fn reserved(&self) -> usize;
}

/// A named party reserving memory from a [`MemoryPool`], e.g. one join
/// stream's buffered build side.
///
/// The name identifies the consumer in budget-exhausted errors; `can_spill`
/// records whether the consumer can trade memory for disk, which decides
/// what those errors advise.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct MemoryConsumer {
    name: String,
    can_spill: bool,
}

impl MemoryConsumer {
    /// Create a new empty [`MemoryConsumer`] that can be grown using [`MemoryReservation`]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            can_spill: false,
        }
    }

    /// Set whether this allocation can be spilled to disk
    pub fn with_can_spill(self, can_spill: bool) -> Self {
        Self { can_spill, ..self }
    }

    /// Returns true if this allocation can spill to disk
    pub fn can_spill(&self) -> bool {
        self.can_spill
    }

    /// Returns the name associated with this allocation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers this [`MemoryConsumer`] with the provided [`MemoryPool`],
    /// returning the consumer's [`MemoryReservation`].
    pub fn register(self, pool: &Arc<dyn MemoryPool>) -> MemoryReservation {
        pool.register(&self);
        MemoryReservation {
            pool: Arc::clone(pool),
            consumer: self,
            size: 0,
        }
    }
}

/// The bytes one [`MemoryConsumer`] currently holds of a [`MemoryPool`].
///
/// A join stream owns exactly one reservation and moves it through every
/// phase: build-side buffering grows it, spilling a victim partition shrinks
/// it, loading a spilled partition back grows it again. Dropping the
/// reservation returns all remaining bytes to the pool and unregisters the
/// consumer, which is what makes operator shutdown leak-free even on error
/// paths.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<dyn MemoryPool>,
    consumer: MemoryConsumer,
    size: usize,
}

impl MemoryReservation {
    /// Returns the size of this reservation in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns [MemoryConsumer] for this [MemoryReservation]
    pub fn consumer(&self) -> &MemoryConsumer {
        &self.consumer
    }

    /// Frees all bytes from this reservation back to the underlying
    /// pool, returning the number of bytes freed.
    pub fn free(&mut self) -> usize {
        let size = self.size;
        if size != 0 {
            self.shrink(size)
        }
        size
    }

    /// Frees `capacity` bytes from this reservation
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`Self::size`]
    pub fn shrink(&mut self, capacity: usize) {
        let new_size = self.size.checked_sub(capacity).unwrap();
        self.pool.shrink(self, capacity);
        self.size = new_size
    }

    /// Increase the size of this reservation by `capacity` bytes
    pub fn grow(&mut self, capacity: usize) {
        self.pool.grow(self, capacity);
        self.size += capacity;
    }

    /// Try to increase the size of this reservation by `capacity`
    /// bytes, returning error if there is insufficient capacity left
    /// in the pool.
    pub fn try_grow(&mut self, capacity: usize) -> Result<()> {
        self.pool.try_grow(self, capacity)?;
        self.size += capacity;
        Ok(())
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
        self.pool.unregister(&self.consumer);
    }
}

pub mod units {
    pub const TB: u64 = 1 << 40;
    pub const GB: u64 = 1 << 30;
    pub const MB: u64 = 1 << 20;
    pub const KB: u64 = 1 << 10;
}

/// Present size in human readable form
pub fn human_readable_size(size: usize) -> String {
    use units::*;

    let size = size as u64;
    let (value, unit) = {
        if size >= 2 * TB {
            (size as f64 / TB as f64, "TB")
        } else if size >= 2 * GB {
            (size as f64 / GB as f64, "GB")
        } else if size >= 2 * MB {
            (size as f64 / MB as f64, "MB")
        } else if size >= 2 * KB {
            (size as f64 / KB as f64, "KB")
        } else {
            (size as f64, "B")
        }
    };
    format!("{value:.1} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_pool(budget: usize) -> Arc<dyn MemoryPool> {
        Arc::new(GreedyMemoryPool::new(budget)) as _
    }

    fn join_stream_reservation(pool: &Arc<dyn MemoryPool>, partition: usize) -> MemoryReservation {
        MemoryConsumer::new(format!("PartitionedHashJoinStream[{partition}]"))
            .with_can_spill(true)
            .register(pool)
    }

    #[test]
    fn reservation_released_when_stream_drops() {
        let pool = join_pool(96_000);
        let mut stream = join_stream_reservation(&pool, 0);

        // buffer a build side, then release it as if the stream completed
        stream.try_grow(64_000).unwrap();
        assert_eq!(stream.size(), 64_000);
        assert_eq!(pool.reserved(), 64_000);

        drop(stream);
        assert_eq!(pool.reserved(), 0);
    }

    #[test]
    fn spilling_a_victim_frees_budget_for_the_next_partition() {
        let pool = join_pool(24_000);
        let mut stream = join_stream_reservation(&pool, 0);

        // two pinned build partitions worth of rows
        stream.try_grow(9_000).unwrap();
        stream.try_grow(7_000).unwrap();

        // a third partition does not fit the budget
        stream.try_grow(12_000).unwrap_err();
        assert_eq!(stream.size(), 16_000);

        // unpinning the largest partition makes the retry succeed
        stream.shrink(9_000);
        stream.try_grow(12_000).unwrap();
        assert_eq!(stream.size(), 19_000);
        assert_eq!(pool.reserved(), 19_000);
    }

    #[test]
    fn join_instances_share_only_the_pool() {
        let pool = join_pool(10_000);
        let mut first = join_stream_reservation(&pool, 0);
        let mut second = join_stream_reservation(&pool, 1);

        first.try_grow(7_000).unwrap();
        // the second instance competes for the remainder
        second.try_grow(4_000).unwrap_err();
        second.try_grow(3_000).unwrap();

        // each reservation only accounts for its own instance
        assert_eq!(first.size(), 7_000);
        assert_eq!(second.size(), 3_000);
        assert_eq!(pool.reserved(), 10_000);

        // one instance finishing does not disturb the other
        assert_eq!(first.free(), 7_000);
        assert_eq!(second.size(), 3_000);
        assert_eq!(pool.reserved(), 3_000);
    }

    #[test]
    #[should_panic]
    fn shrink_beyond_reserved_is_a_bug() {
        let pool = join_pool(1_000);
        let mut stream = join_stream_reservation(&pool, 0);
        stream.grow(500);
        stream.shrink(501);
    }

    #[test]
    fn human_readable_sizes() {
        assert_eq!(human_readable_size(1_536), "1536.0 B");
        assert_eq!(human_readable_size(64 * 1024 * 1024), "64.0 MB");
    }
}
