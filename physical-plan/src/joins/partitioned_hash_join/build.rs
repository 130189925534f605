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

//! Build-side partitioning for the partitioned hash join: fans build rows
//! into hash partitions, spills partitions under memory pressure, and builds
//! a hash table for every partition that stayed in memory.

use std::mem;
use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{ArrayRef, BooleanBufferBuilder, UInt32Array};
use arrow::compute::{self, concat_batches, filter_record_batch, kernels::boolean::not};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::util::bit_util;
use grace_common::hash_utils::create_hashes;
use grace_common::{JoinType, Result};
use grace_execution::memory_pool::MemoryReservation;
use grace_physical_expr::PhysicalExprRef;
use log::debug;

use crate::joins::join_hash_map::JoinHashMap;
use crate::joins::utils::{keys_null_mask, take_record_batch};
use crate::metrics::Count;
use crate::spill::{InProgressSpillFile, SpillManager, SpilledFile};

/// Hash state for a partitioning level.
///
/// Level 0 uses the seed shared with other hash operators; deeper levels
/// re-seed so the rows of a repartitioned partition redistribute across the
/// new fanout instead of all landing in one partition again.
pub(crate) fn join_random_state(level: usize) -> RandomState {
    RandomState::with_seeds(0, 0, 0, level as u64)
}

/// Partition index for `hash` given `bits = log2(fanout)`: a slice of the top
/// hash bits, leaving the low bits to the hash table.
#[inline]
pub(crate) fn partition_index(hash: u64, bits: u32) -> usize {
    (hash >> (64 - bits)) as usize
}

/// Rows of one partition while a partitioning pass is running.
///
/// The buffer starts pinned, holding its rows in memory. Unpinning ("spill")
/// moves the buffered rows into a spill file; appends afterwards write
/// through to the file. The pinned write buffer of the file itself is not
/// tracked by the reservation.
pub(crate) struct PartitionBuffer {
    batches: Vec<RecordBatch>,
    in_memory_bytes: usize,
    num_rows: usize,
    spill_file: Option<InProgressSpillFile>,
    spill_manager: Arc<SpillManager>,
}

impl PartitionBuffer {
    pub fn new(spill_manager: Arc<SpillManager>) -> Self {
        Self {
            batches: vec![],
            in_memory_bytes: 0,
            num_rows: 0,
            spill_file: None,
            spill_manager,
        }
    }

    pub fn is_spilled(&self) -> bool {
        self.spill_file.is_some()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn in_memory_bytes(&self) -> usize {
        self.in_memory_bytes
    }

    /// Append a batch whose `bytes` are already covered by the caller's
    /// reservation.
    fn push(&mut self, batch: RecordBatch, bytes: usize) {
        self.num_rows += batch.num_rows();
        self.in_memory_bytes += bytes;
        self.batches.push(batch);
    }

    /// Append a batch to the spill file of an unpinned buffer.
    fn append_spilled(&mut self, batch: &RecordBatch) -> Result<()> {
        let file = self
            .spill_file
            .as_mut()
            .expect("append_spilled on a pinned buffer");
        self.num_rows += batch.num_rows();
        file.append_batch(batch)
    }

    /// Unpin the buffer: move any in-memory rows into the spill file and
    /// release their bytes from `reservation`. Returns the bytes freed.
    pub fn spill(
        &mut self,
        reservation: &mut MemoryReservation,
        request_msg: &str,
    ) -> Result<usize> {
        if self.spill_file.is_none() {
            self.spill_file = Some(self.spill_manager.create_in_progress_file(request_msg)?);
        }
        let file = self.spill_file.as_mut().expect("created above");
        for batch in self.batches.drain(..) {
            file.append_batch(&batch)?;
        }
        let freed = self.in_memory_bytes;
        reservation.shrink(freed);
        self.in_memory_bytes = 0;
        Ok(freed)
    }

    /// Append under `reservation`; if the reservation cannot be grown the
    /// buffer unpins itself and the batch goes to disk.
    pub fn append_with_spill(
        &mut self,
        batch: RecordBatch,
        reservation: &mut MemoryReservation,
        request_msg: &str,
    ) -> Result<()> {
        if self.is_spilled() {
            return self.append_spilled(&batch);
        }
        let bytes = batch.get_array_memory_size();
        if reservation.try_grow(bytes).is_ok() {
            self.push(batch, bytes);
            return Ok(());
        }
        self.spill(reservation, request_msg)?;
        self.append_spilled(&batch)
    }

    /// Take the in-memory rows of a pinned buffer; the caller remains
    /// responsible for the reserved bytes.
    pub fn take_batches(&mut self) -> Vec<RecordBatch> {
        self.in_memory_bytes = 0;
        mem::take(&mut self.batches)
    }

    /// Finalize the spill file of an unpinned buffer. `None` when the buffer
    /// never received any rows.
    pub fn finish_spill(&mut self) -> Result<Option<SpilledFile>> {
        match self.spill_file.as_mut() {
            Some(file) => file.finish(),
            None => Ok(None),
        }
    }
}

/// One build partition after a partitioning pass completed.
pub(crate) enum BuildPartition {
    /// The partition stayed in memory and carries a hash table over its rows
    InMemory(InMemoryBuildPartition),
    /// The partition was spilled; its rows live in a spill file
    Spilled(SpilledBuildPartition),
}

/// An in-memory build partition: the concatenated build rows, their key
/// columns, the hash table over them, and the matched bitmap used for
/// build-side output of outer/semi/anti joins.
pub(crate) struct InMemoryBuildPartition {
    pub batch: RecordBatch,
    pub key_arrays: Vec<ArrayRef>,
    pub hash_map: JoinHashMap,
    pub matched: BooleanBufferBuilder,
    /// Bytes held in the join's reservation for this partition, released
    /// when the partition is closed
    pub reserved_bytes: usize,
    pub level: usize,
}

/// A spilled build partition awaiting a deeper pass.
pub(crate) struct SpilledBuildPartition {
    pub file: SpilledFile,
    pub level: usize,
}

/// Partitions build rows of one pass into `fanout` partitions, spilling under
/// memory pressure, and finishes them into [`BuildPartition`]s.
///
/// The spill policy: an append that cannot be covered by the reservation
/// unpins the largest pinned partition (including possibly the target
/// partition itself) and retries; once the target is unpinned the rows write
/// through to disk.
pub(crate) struct JoinBuilder {
    schema: SchemaRef,
    on: Vec<PhysicalExprRef>,
    join_type: JoinType,
    level: usize,
    bits: u32,
    random_state: RandomState,
    partitions: Vec<PartitionBuffer>,
    hashes_buffer: Vec<u64>,
    hash_tables_built: Count,
}

impl JoinBuilder {
    pub fn new(
        schema: SchemaRef,
        on: Vec<PhysicalExprRef>,
        join_type: JoinType,
        partition_count: usize,
        level: usize,
        spill_manager: Arc<SpillManager>,
        hash_tables_built: Count,
    ) -> Self {
        debug_assert!(partition_count.is_power_of_two() && partition_count >= 2);
        let partitions = (0..partition_count)
            .map(|_| PartitionBuffer::new(Arc::clone(&spill_manager)))
            .collect();
        Self {
            schema,
            on,
            join_type,
            level,
            bits: partition_count.trailing_zeros(),
            random_state: join_random_state(level),
            partitions,
            hashes_buffer: vec![],
            hash_tables_built,
        }
    }

    /// The level this builder partitions at.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Partition one batch of build rows. For the null-aware anti join, rows
    /// whose key contains NULL are not partitioned and are returned to the
    /// caller instead.
    pub fn partition_batch(
        &mut self,
        batch: RecordBatch,
        reservation: &mut MemoryReservation,
    ) -> Result<Option<RecordBatch>> {
        if batch.num_rows() == 0 {
            return Ok(None);
        }

        let num_rows = batch.num_rows();
        let mut key_arrays = self
            .on
            .iter()
            .map(|expr| expr.evaluate(&batch)?.into_array(num_rows))
            .collect::<Result<Vec<_>>>()?;

        let mut batch = batch;
        let mut null_rows = None;
        if self.join_type == JoinType::NullAwareAnti {
            let mask = keys_null_mask(&key_arrays, num_rows)?;
            if mask.true_count() > 0 {
                null_rows = Some(filter_record_batch(&batch, &mask)?);
                let keep = not(&mask)?;
                batch = filter_record_batch(&batch, &keep)?;
                key_arrays = key_arrays
                    .iter()
                    .map(|array| compute::filter(array.as_ref(), &keep).map_err(Into::into))
                    .collect::<Result<Vec<_>>>()?;
            }
        }
        if batch.num_rows() == 0 {
            return Ok(null_rows);
        }

        let num_rows = batch.num_rows();
        self.hashes_buffer.clear();
        self.hashes_buffer.resize(num_rows, 0);
        create_hashes(&key_arrays, &self.random_state, &mut self.hashes_buffer)?;

        let mut indices: Vec<Vec<u32>> = vec![Vec::new(); self.partitions.len()];
        for (row, hash) in self.hashes_buffer.iter().enumerate() {
            indices[partition_index(*hash, self.bits)].push(row as u32);
        }

        for (partition, rows) in indices.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let sub_batch = if rows.len() == num_rows {
                batch.clone()
            } else {
                take_record_batch(&batch, &UInt32Array::from(rows))?
            };
            self.append(partition, sub_batch, reservation)?;
        }
        Ok(null_rows)
    }

    /// Append a batch to `partition`, spilling victims until the reservation
    /// covers it or the target partition itself is unpinned.
    fn append(
        &mut self,
        partition: usize,
        batch: RecordBatch,
        reservation: &mut MemoryReservation,
    ) -> Result<()> {
        let bytes = batch.get_array_memory_size();
        loop {
            if self.partitions[partition].is_spilled() {
                return self.partitions[partition].append_spilled(&batch);
            }
            if reservation.try_grow(bytes).is_ok() {
                self.partitions[partition].push(batch, bytes);
                return Ok(());
            }
            // the target partition is pinned, so a pinned victim exists
            let victim = self.select_spill_victim();
            let freed =
                self.partitions[victim].spill(reservation, "hash join build partition")?;
            debug!(
                "Spilled build partition {victim} at level {} freeing {freed} bytes \
                 ({} rows)",
                self.level,
                self.partitions[victim].num_rows(),
            );
        }
    }

    /// The pinned partition holding the most memory.
    fn select_spill_victim(&self) -> usize {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, buffer)| !buffer.is_spilled())
            .max_by_key(|(_, buffer)| buffer.in_memory_bytes())
            .map(|(idx, _)| idx)
            .expect("at least one pinned partition")
    }

    /// Finish the pass: build a hash table for every pinned partition (or
    /// spill it if the table does not fit) and finalize the spill files of
    /// the unpinned ones.
    pub fn finish(
        mut self,
        reservation: &mut MemoryReservation,
    ) -> Result<Vec<BuildPartition>> {
        let buffers = mem::take(&mut self.partitions);
        let mut out = Vec::with_capacity(buffers.len());
        let mut spilled_count = 0;

        for (idx, mut buffer) in buffers.into_iter().enumerate() {
            if buffer.is_spilled() {
                match buffer.finish_spill()? {
                    Some(file) => {
                        spilled_count += 1;
                        out.push(BuildPartition::Spilled(SpilledBuildPartition {
                            file,
                            level: self.level,
                        }));
                        continue;
                    }
                    // unpinned but never received a row: an empty partition
                    None => {
                        out.push(BuildPartition::InMemory(
                            self.build_in_memory_partition(
                                RecordBatch::new_empty(Arc::clone(&self.schema)),
                                0,
                            )?,
                        ));
                        continue;
                    }
                }
            }

            let num_rows = buffer.num_rows();
            let data_bytes = buffer.in_memory_bytes();
            let table_bytes =
                JoinHashMap::estimate_memory_size(num_rows) + bit_util::ceil(num_rows, 8);

            if num_rows > 0 && reservation.try_grow(table_bytes).is_err() {
                // cannot afford the hash table: spill this partition instead
                debug!(
                    "Hash table for build partition {idx} at level {} does not fit \
                     ({num_rows} rows, {table_bytes} bytes), spilling",
                    self.level
                );
                buffer.spill(reservation, "hash join build partition")?;
                let file = buffer
                    .finish_spill()?
                    .expect("non-empty partition produces a spill file");
                spilled_count += 1;
                out.push(BuildPartition::Spilled(SpilledBuildPartition {
                    file,
                    level: self.level,
                }));
                continue;
            }

            let batches = buffer.take_batches();
            let batch = if batches.is_empty() {
                RecordBatch::new_empty(Arc::clone(&self.schema))
            } else {
                concat_batches(&self.schema, &batches)?
            };
            let reserved_bytes = data_bytes + if num_rows > 0 { table_bytes } else { 0 };
            out.push(BuildPartition::InMemory(
                self.build_in_memory_partition(batch, reserved_bytes)?,
            ));
        }

        debug!(
            "Finished build pass at level {}: {} partitions in memory, {spilled_count} spilled",
            self.level,
            out.len() - spilled_count,
        );
        Ok(out)
    }

    /// Build the hash table and matched bitmap over the rows of one pinned
    /// partition.
    fn build_in_memory_partition(
        &self,
        batch: RecordBatch,
        reserved_bytes: usize,
    ) -> Result<InMemoryBuildPartition> {
        build_in_memory_partition(
            &self.on,
            self.level,
            batch,
            reserved_bytes,
            &self.hash_tables_built,
        )
    }
}

/// Build an [`InMemoryBuildPartition`] over `batch` at `level`: evaluate the
/// keys, hash them with the level's hash state, and insert every row into a
/// fresh hash table. Also used when a spilled partition is loaded back into
/// memory.
pub(crate) fn build_in_memory_partition(
    on: &[PhysicalExprRef],
    level: usize,
    batch: RecordBatch,
    reserved_bytes: usize,
    hash_tables_built: &Count,
) -> Result<InMemoryBuildPartition> {
    let num_rows = batch.num_rows();
    let key_arrays = on
        .iter()
        .map(|expr| expr.evaluate(&batch)?.into_array(num_rows))
        .collect::<Result<Vec<_>>>()?;

    let mut hashes = vec![0; num_rows];
    create_hashes(&key_arrays, &join_random_state(level), &mut hashes)?;

    let mut hash_map = JoinHashMap::with_capacity(num_rows);
    for (row, hash) in hashes.into_iter().enumerate() {
        hash_map.insert(row, hash);
    }

    let mut matched = BooleanBufferBuilder::new(num_rows);
    matched.append_n(num_rows, false);

    hash_tables_built.add(1);

    Ok(InMemoryBuildPartition {
        batch,
        key_arrays,
        hash_map,
        matched,
        reserved_bytes,
        level,
    })
}

#[cfg(test)]
mod tests {
    use grace_execution::memory_pool::{GreedyMemoryPool, MemoryConsumer, MemoryPool};
    use grace_execution::runtime_env::RuntimeEnv;
    use grace_physical_expr::expressions::col;

    use super::*;
    use crate::metrics::{ExecutionPlanMetricsSet, SpillMetrics};
    use crate::test::{build_table_i32, build_table_i32_nullable};

    fn test_builder(
        schema: SchemaRef,
        join_type: JoinType,
        partition_count: usize,
    ) -> Result<(JoinBuilder, Arc<dyn MemoryPool>, MemoryReservation)> {
        let pool: Arc<dyn MemoryPool> = Arc::new(GreedyMemoryPool::new(usize::MAX));
        let reservation = MemoryConsumer::new("test-builder").register(&pool);
        let metrics = ExecutionPlanMetricsSet::new();
        let spill_manager = Arc::new(SpillManager::new(
            Arc::new(RuntimeEnv::default()),
            SpillMetrics::new(&metrics, 0),
            Arc::clone(&schema),
        ));
        let on = vec![col("a", &schema)?];
        let builder = JoinBuilder::new(
            schema,
            on,
            join_type,
            partition_count,
            0,
            spill_manager,
            Count::new(),
        );
        Ok((builder, pool, reservation))
    }

    #[test]
    fn partitions_cover_all_rows() -> Result<()> {
        let batch = build_table_i32(
            ("a", &(0..100).collect::<Vec<i32>>()),
            ("b", &(0..100).collect::<Vec<i32>>()),
            ("c", &vec![0; 100]),
        );
        let (mut builder, _pool, mut reservation) =
            test_builder(batch.schema(), JoinType::Inner, 16)?;

        assert!(builder.partition_batch(batch, &mut reservation)?.is_none());
        let partitions = builder.finish(&mut reservation)?;

        let total: usize = partitions
            .iter()
            .map(|p| match p {
                BuildPartition::InMemory(p) => p.batch.num_rows(),
                BuildPartition::Spilled(p) => p.file.num_rows,
            })
            .sum();
        assert_eq!(total, 100);
        Ok(())
    }

    #[test]
    fn partitioning_is_deterministic_per_level() -> Result<()> {
        let batch = build_table_i32(
            ("a", &(0..64).collect::<Vec<i32>>()),
            ("b", &(0..64).collect::<Vec<i32>>()),
            ("c", &vec![0; 64]),
        );
        let run = |level: usize| -> Result<Vec<usize>> {
            let state = join_random_state(level);
            let key: ArrayRef = Arc::clone(batch.column(0));
            let mut hashes = vec![0; 64];
            create_hashes(&[key], &state, &mut hashes)?;
            Ok(hashes.iter().map(|h| partition_index(*h, 4)).collect())
        };
        assert_eq!(run(0)?, run(0)?);
        // deeper levels use a different hash family
        assert_ne!(run(0)?, run(1)?);
        Ok(())
    }

    #[test]
    fn memory_pressure_spills_largest_partition() -> Result<()> {
        let batch = build_table_i32(
            ("a", &(0..512).collect::<Vec<i32>>()),
            ("b", &(0..512).collect::<Vec<i32>>()),
            ("c", &vec![0; 512]),
        );
        let schema = batch.schema();

        // budget below the size of the input forces spilling during the pass
        let pool: Arc<dyn MemoryPool> = Arc::new(GreedyMemoryPool::new(4 * 1024));
        let mut reservation = MemoryConsumer::new("test-builder").register(&pool);
        let metrics = ExecutionPlanMetricsSet::new();
        let spill_metrics = SpillMetrics::new(&metrics, 0);
        let spill_manager = Arc::new(SpillManager::new(
            Arc::new(RuntimeEnv::default()),
            spill_metrics,
            Arc::clone(&schema),
        ));
        let on = vec![col("a", &schema)?];
        let mut builder = JoinBuilder::new(
            Arc::clone(&schema),
            on,
            JoinType::Inner,
            4,
            0,
            spill_manager,
            Count::new(),
        );

        for offset in (0..512).step_by(64) {
            builder.partition_batch(batch.slice(offset, 64), &mut reservation)?;
        }
        let partitions = builder.finish(&mut reservation)?;

        let spilled = partitions
            .iter()
            .filter(|p| matches!(p, BuildPartition::Spilled(_)))
            .count();
        assert!(spilled > 0, "expected at least one spilled partition");
        assert!(metrics.clone_inner().spilled_bytes().unwrap() > 0);
        // reservation stays within the budget
        assert!(pool.reserved() <= 4 * 1024);
        Ok(())
    }

    #[test]
    fn null_aware_diverts_null_keyed_rows() -> Result<()> {
        let batch = build_table_i32_nullable(
            ("a", &vec![Some(1), None, Some(3), None]),
            ("b", &vec![Some(10), Some(20), Some(30), Some(40)]),
        );
        let schema = batch.schema();
        let (mut builder, _pool, mut reservation) =
            test_builder(Arc::clone(&schema), JoinType::NullAwareAnti, 4)?;

        let nulls = builder
            .partition_batch(batch, &mut reservation)?
            .expect("null keyed rows diverted");
        assert_eq!(nulls.num_rows(), 2);

        let partitions = builder.finish(&mut reservation)?;
        let total: usize = partitions
            .iter()
            .map(|p| match p {
                BuildPartition::InMemory(p) => p.batch.num_rows(),
                BuildPartition::Spilled(p) => p.file.num_rows,
            })
            .sum();
        assert_eq!(total, 2);
        Ok(())
    }

    #[test]
    fn hash_map_lookup_finds_inserted_rows() -> Result<()> {
        let batch = build_table_i32(
            ("a", &vec![1, 2, 2, 4]),
            ("b", &vec![0, 0, 0, 0]),
            ("c", &vec![0, 0, 0, 0]),
        );
        let (mut builder, _pool, mut reservation) =
            test_builder(batch.schema(), JoinType::Inner, 2)?;
        builder.partition_batch(batch, &mut reservation)?;
        let partitions = builder.finish(&mut reservation)?;

        let rows: usize = partitions
            .iter()
            .map(|p| match p {
                BuildPartition::InMemory(p) => p.hash_map.num_rows(),
                BuildPartition::Spilled(_) => 0,
            })
            .sum();
        assert_eq!(rows, 4);
        Ok(())
    }
}
