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

//! The execution stream of the partitioned hash join.
//!
//! One pass of the join partitions its build input into hash partitions,
//! builds a hash table per partition that fits in memory, and then probes
//! those tables while spilling the probe rows of partitions that did not fit.
//! Once a pass is complete, spilled (build, probe) partition pairs are popped
//! one at a time: a pair whose build side fits is loaded and probed directly,
//! a pair that does not fit re-enters the same machinery one level deeper
//! with a re-seeded hash. The state machine below is that loop; the pass for
//! level 0 reads the operator's children, deeper passes read spill files.

use std::collections::VecDeque;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ahash::RandomState;
use arrow::array::{ArrayRef, UInt32Array, UInt64Array, UInt64Builder};
use arrow::compute::{self, concat_batches, filter_record_batch, kernels::boolean::not};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use futures::{ready, Stream, StreamExt};
use grace_common::hash_utils::create_hashes;
use grace_common::{
    internal_err, resources_err, GraceError, JoinSide, JoinType, Result,
};
use grace_execution::memory_pool::MemoryReservation;
use grace_execution::{SendableRecordBatchStream, TaskContext};
use grace_physical_expr::PhysicalExprRef;
use log::debug;

use super::build::{
    build_in_memory_partition, join_random_state, partition_index, BuildPartition,
    InMemoryBuildPartition, JoinBuilder, SpilledBuildPartition,
};
use super::null_aware::NullAwareState;
use crate::joins::join_hash_map::JoinHashMapOffset;
use crate::joins::utils::{
    append_probe_indices_in_order, apply_join_filter_to_indices,
    build_batch_from_indices, equal_rows_arr, get_anti_indices,
    get_final_indices_from_bit_map_range, get_semi_indices, keys_null_mask,
    need_produce_result_in_final, take_record_batch, BuildProbeJoinMetrics, ColumnIndex,
    JoinFilter,
};
use crate::joins::JoinHashMap;
use crate::metrics::{Count, ExecutionPlanMetricsSet, Gauge, MetricBuilder, Time};
use crate::spill::{InProgressSpillFile, SpillFileReader, SpillManager, SpilledFile};
use crate::RecordBatchStream;

/// Metrics of the partitioned hash join.
pub(crate) struct PartitionedHashJoinMetrics {
    /// The common build/probe metrics
    pub(crate) join: BuildProbeJoinMetrics,
    /// Probe rows routed through the partitioning step
    pub(crate) probe_rows_partitioned: Count,
    /// Hash tables built over partitions, across all levels
    pub(crate) hash_tables_built: Count,
    /// Deepest spilled-partition processing level reached; a spilled pair
    /// created at level `l` counts as depth `l + 1` when processed
    pub(crate) max_partition_depth: Gauge,
    /// Time spent in null-aware anti join evaluation
    pub(crate) null_aware_time: Time,
}

impl PartitionedHashJoinMetrics {
    pub fn new(partition: usize, metrics: &ExecutionPlanMetricsSet) -> Self {
        Self {
            join: BuildProbeJoinMetrics::new(partition, metrics),
            probe_rows_partitioned: MetricBuilder::new(metrics)
                .counter("probe_rows_partitioned", partition),
            hash_tables_built: MetricBuilder::new(metrics)
                .counter("hash_tables_built", partition),
            max_partition_depth: MetricBuilder::new(metrics)
                .gauge("max_partition_depth", partition),
            null_aware_time: MetricBuilder::new(metrics)
                .subset_time("null_aware_time", partition),
        }
    }
}

/// Where the build rows of the current pass come from.
enum BuildSource {
    /// The operator's build child (level 0)
    Child(SendableRecordBatchStream),
    /// The build stream of a spilled partition being repartitioned
    Spilled(SpillFileReader),
    /// The current pass has consumed its build input
    Done,
}

/// Where the probe rows of the current pass come from.
enum ProbeSource {
    /// The operator's probe child (level 0)
    Child(SendableRecordBatchStream),
    /// The probe stream of a spilled partition
    Spilled(SpillFileReader),
    /// No probe rows (or all consumed)
    Empty,
}

/// One partition of the current pass while probing.
enum ProbeTarget {
    /// In memory with a hash table; probed directly
    InMemory(InMemoryBuildPartition),
    /// Spilled; probe rows are appended to the partition's probe stream
    Spilled {
        build: SpilledBuildPartition,
        probe: InProgressSpillFile,
    },
}

/// A spilled (build, probe) partition pair awaiting a deeper pass. The probe
/// stream is `None` when no probe row hashed into the partition.
struct SpilledJoinPair {
    build: SpilledBuildPartition,
    probe: Option<SpilledFile>,
}

/// A probe batch split by partition: one sub-batch per in-memory partition
/// that received rows. Rows of spilled partitions were already appended to
/// their probe streams.
struct ProbeBatch {
    subs: Vec<ProbeSubBatch>,
}

struct ProbeSubBatch {
    partition: usize,
    batch: RecordBatch,
    key_arrays: Vec<ArrayRef>,
    hashes: Vec<u64>,
}

/// Iteration state of the in-progress probe batch: which sub-batch is being
/// probed, the hash-map offset to resume at, and the last probe row that
/// joined (so a row whose duplicate chain was split across output batches is
/// not also reported as unmatched).
#[derive(Clone, Copy)]
struct ProcessProbeBatchState {
    sub_idx: usize,
    offset: JoinHashMapOffset,
    joined_probe_idx: Option<usize>,
}

/// State machine of the join stream.
///
/// ```text
/// CollectBuildSide → FetchProbeBatch ⇄ ProcessProbeBatch
///                         │
///                         ▼
///                  ExhaustedProbeSide → OutputUnmatchedBuild
///                         │                    │
///                         ▼                    ▼
///                  PrepareSpilledPartition ────┴──→ {FetchProbeBatch |
///                         │                          CollectBuildSide}
///                         ▼
///       OutputNullAwareProbe → OutputNullAwareNullProbe → Completed
/// ```
enum ExecState {
    /// Reading build rows (from the child or a spilled stream) into the
    /// builder's hash partitions
    CollectBuildSide,
    /// Pulling the next probe batch
    FetchProbeBatch,
    /// Producing output for the probe batch, one bounded chunk at a time
    ProcessProbeBatch(ProcessProbeBatchState),
    /// The probe side of the current pass is exhausted; close or queue the
    /// pass's partitions
    ExhaustedProbeSide,
    /// Emitting build rows owed by the matched bitmaps of finished
    /// partitions
    OutputUnmatchedBuild { row_offset: usize },
    /// Popping the next spilled partition pair
    PrepareSpilledPartition,
    /// Null-aware anti join: emitting probe rows that matched no hash table,
    /// screened against the NULL-keyed build rows
    OutputNullAwareProbe {
        pending: VecDeque<RecordBatch>,
        reader: Option<SpillFileReader>,
    },
    /// Null-aware anti join: emitting NULL-keyed probe rows that no build
    /// row matched
    OutputNullAwareNullProbe { batch_idx: usize },
    /// All output produced
    Completed,
}

impl ExecState {
    fn name(&self) -> &'static str {
        match self {
            ExecState::CollectBuildSide => "CollectBuildSide",
            ExecState::FetchProbeBatch => "FetchProbeBatch",
            ExecState::ProcessProbeBatch(_) => "ProcessProbeBatch",
            ExecState::ExhaustedProbeSide => "ExhaustedProbeSide",
            ExecState::OutputUnmatchedBuild { .. } => "OutputUnmatchedBuild",
            ExecState::PrepareSpilledPartition => "PrepareSpilledPartition",
            ExecState::OutputNullAwareProbe { .. } => "OutputNullAwareProbe",
            ExecState::OutputNullAwareNullProbe { .. } => "OutputNullAwareNullProbe",
            ExecState::Completed => "Completed",
        }
    }
}

pub(crate) struct PartitionedHashJoinStream {
    /// Output schema of the join
    schema: SchemaRef,
    /// Schema of the build child
    build_schema: SchemaRef,
    /// Schema of the probe child
    probe_schema: SchemaRef,
    /// Key expressions over the build side
    on_left: Vec<PhysicalExprRef>,
    /// Key expressions over the probe side
    on_right: Vec<PhysicalExprRef>,
    /// Residual join filter
    filter: Option<JoinFilter>,
    join_type: JoinType,
    /// Output column provenance
    column_indices: Vec<ColumnIndex>,
    /// Fanout of each partitioning pass
    partition_count: usize,
    /// Bound on repartitioning recursion
    max_partition_depth: usize,
    /// Target output batch size
    batch_size: usize,
    /// Task context, checked for cancellation at batch boundaries
    context: Arc<TaskContext>,

    state: ExecState,
    build_source: BuildSource,
    probe_source: ProbeSource,
    /// Builder of the pass currently collecting build rows
    builder: Option<JoinBuilder>,
    /// Partitions of the current probing pass
    partitions: Vec<ProbeTarget>,
    /// The probe batch currently being processed
    current_probe: Option<ProbeBatch>,
    /// Probe stream of a spilled pair queued for the pass after the next
    /// build collection completes
    pending_probe: Option<SpilledFile>,
    /// Spilled partition pairs awaiting processing
    spilled_partitions: VecDeque<SpilledJoinPair>,
    /// Finished partitions whose matched bitmap still owes output
    unmatched_partitions: VecDeque<InMemoryBuildPartition>,
    /// Auxiliary state of the null-aware anti join
    null_aware: Option<NullAwareState>,

    /// Memory reservation of this join instance
    reservation: MemoryReservation,
    build_spill_manager: Arc<SpillManager>,
    probe_spill_manager: Arc<SpillManager>,
    /// Hash state of the current pass's level
    random_state: RandomState,
    /// Level of the current pass
    level: usize,
    /// Scratch space for probe hashes, sized to the probe batch
    hashes_buffer: Vec<u64>,
    join_metrics: PartitionedHashJoinMetrics,
}

impl PartitionedHashJoinStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        schema: SchemaRef,
        on_left: Vec<PhysicalExprRef>,
        on_right: Vec<PhysicalExprRef>,
        filter: Option<JoinFilter>,
        join_type: JoinType,
        column_indices: Vec<ColumnIndex>,
        partition_count: usize,
        max_partition_depth: usize,
        build_stream: SendableRecordBatchStream,
        probe_stream: SendableRecordBatchStream,
        context: Arc<TaskContext>,
        reservation: MemoryReservation,
        build_spill_manager: Arc<SpillManager>,
        probe_spill_manager: Arc<SpillManager>,
        join_metrics: PartitionedHashJoinMetrics,
    ) -> Self {
        let build_schema = build_stream.schema();
        let probe_schema = probe_stream.schema();
        let builder = JoinBuilder::new(
            Arc::clone(&build_schema),
            on_left.clone(),
            join_type,
            partition_count,
            0,
            Arc::clone(&build_spill_manager),
            join_metrics.hash_tables_built.clone(),
        );
        let null_aware = (join_type == JoinType::NullAwareAnti)
            .then(|| NullAwareState::new(Arc::clone(&probe_spill_manager)));
        let batch_size = context.session_config().batch_size();
        Self {
            schema,
            build_schema,
            probe_schema,
            on_left,
            on_right,
            filter,
            join_type,
            column_indices,
            partition_count,
            max_partition_depth,
            batch_size,
            context,
            state: ExecState::CollectBuildSide,
            build_source: BuildSource::Child(build_stream),
            probe_source: ProbeSource::Child(probe_stream),
            builder: Some(builder),
            partitions: vec![],
            current_probe: None,
            pending_probe: None,
            spilled_partitions: VecDeque::new(),
            unmatched_partitions: VecDeque::new(),
            null_aware,
            reservation,
            build_spill_manager,
            probe_spill_manager,
            random_state: join_random_state(0),
            level: 0,
            hashes_buffer: vec![],
            join_metrics,
        }
    }

    fn poll_next_inner(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<RecordBatch>>> {
        loop {
            if self.context.is_cancelled() {
                return Poll::Ready(Some(Err(GraceError::Cancelled)));
            }
            match &self.state {
                ExecState::CollectBuildSide => {
                    ready!(self.collect_build_side(cx))?;
                }
                ExecState::FetchProbeBatch => {
                    ready!(self.fetch_probe_batch(cx))?;
                }
                ExecState::ProcessProbeBatch(_) => {
                    if let Some(batch) = self.process_probe_chunk()? {
                        return Poll::Ready(Some(Ok(batch)));
                    }
                }
                ExecState::ExhaustedProbeSide => {
                    self.finish_probe_pass()?;
                }
                ExecState::OutputUnmatchedBuild { .. } => {
                    if let Some(batch) = self.output_unmatched_build()? {
                        return Poll::Ready(Some(Ok(batch)));
                    }
                }
                ExecState::PrepareSpilledPartition => {
                    self.prepare_spilled_partition()?;
                }
                ExecState::OutputNullAwareProbe { .. } => {
                    if let Some(batch) = self.output_null_aware_probe()? {
                        return Poll::Ready(Some(Ok(batch)));
                    }
                }
                ExecState::OutputNullAwareNullProbe { .. } => {
                    if let Some(batch) = self.output_null_aware_null_probe()? {
                        return Poll::Ready(Some(Ok(batch)));
                    }
                }
                ExecState::Completed => return Poll::Ready(None),
            }
        }
    }

    /// Feed one build batch into the builder, or finish the build pass once
    /// the source is drained.
    fn collect_build_side(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let batch = match &mut self.build_source {
            BuildSource::Child(stream) => match ready!(stream.poll_next_unpin(cx)) {
                Some(batch) => Some(batch?),
                None => None,
            },
            BuildSource::Spilled(reader) => reader.next().transpose()?,
            BuildSource::Done => {
                return Poll::Ready(internal_err!(
                    "build source polled after completion"
                ))
            }
        };

        match batch {
            Some(batch) => {
                let timer = self.join_metrics.join.build_time.timer();
                self.join_metrics.join.build_input_batches.add(1);
                self.join_metrics.join.build_input_rows.add(batch.num_rows());
                let builder = self.builder.as_mut().expect("builder present");
                if let Some(null_rows) =
                    builder.partition_batch(batch, &mut self.reservation)?
                {
                    self.null_aware
                        .as_mut()
                        .expect("null rows only diverted for null aware joins")
                        .append_null_build(null_rows, &mut self.reservation)?;
                }
                timer.done();
            }
            None => self.finish_build_pass()?,
        }
        Poll::Ready(Ok(()))
    }

    /// The build source of the current pass is drained: build hash tables or
    /// finalize spill files for every partition, and open the probe side.
    fn finish_build_pass(&mut self) -> Result<()> {
        let timer = self.join_metrics.join.build_time.timer();
        let builder = self.builder.take().expect("builder present");
        let level = builder.level();
        let partitions = builder.finish(&mut self.reservation)?;

        let mut targets = Vec::with_capacity(partitions.len());
        for partition in partitions {
            match partition {
                BuildPartition::InMemory(p) => targets.push(ProbeTarget::InMemory(p)),
                BuildPartition::Spilled(build) => {
                    // spilled build partitions get a probe stream with a
                    // prepared write buffer so probe-row appends cannot fail
                    // for lack of memory
                    let probe = self
                        .probe_spill_manager
                        .create_in_progress_file("hash join probe partition")?;
                    targets.push(ProbeTarget::Spilled { build, probe });
                }
            }
        }
        self.partitions = targets;
        self.build_source = BuildSource::Done;
        self.level = level;
        self.random_state = join_random_state(level);
        self.join_metrics
            .join
            .build_mem_used
            .set_max(self.reservation.size());

        if level > 0 {
            // a repartitioning pass probes the popped pair's probe stream
            self.probe_source = match self.pending_probe.take() {
                Some(file) => ProbeSource::Spilled(
                    self.probe_spill_manager.read_spill_file(file),
                ),
                None => ProbeSource::Empty,
            };
        }
        timer.done();

        debug!(
            "Hash join transitions to probing at level {level} ({} partitions)",
            self.partitions.len()
        );
        self.state = ExecState::FetchProbeBatch;
        Ok(())
    }

    /// Pull the next probe batch and split it across the pass's partitions.
    fn fetch_probe_batch(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let batch = match &mut self.probe_source {
            ProbeSource::Child(stream) => match ready!(stream.poll_next_unpin(cx)) {
                Some(batch) => Some(batch?),
                None => None,
            },
            ProbeSource::Spilled(reader) => reader.next().transpose()?,
            ProbeSource::Empty => None,
        };

        match batch {
            Some(batch) => {
                let join_time = self.join_metrics.join.join_time.clone();
                let timer = join_time.timer();
                self.prepare_probe_batch(batch)?;
                timer.done();
                self.state = ExecState::ProcessProbeBatch(ProcessProbeBatchState {
                    sub_idx: 0,
                    offset: (0, None),
                    joined_probe_idx: None,
                });
            }
            None => {
                self.probe_source = ProbeSource::Empty;
                self.state = ExecState::ExhaustedProbeSide;
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Hash and route one probe batch: rows of spilled partitions go to the
    /// partitions' probe streams, rows of in-memory partitions become
    /// sub-batches to probe.
    fn prepare_probe_batch(&mut self, batch: RecordBatch) -> Result<()> {
        self.join_metrics.join.input_batches.add(1);
        self.join_metrics.join.input_rows.add(batch.num_rows());

        let num_rows = batch.num_rows();
        let mut key_arrays = self
            .on_right
            .iter()
            .map(|expr| expr.evaluate(&batch)?.into_array(num_rows))
            .collect::<Result<Vec<_>>>()?;

        let mut batch = batch;
        if self.join_type == JoinType::NullAwareAnti && num_rows > 0 {
            let mask = keys_null_mask(&key_arrays, num_rows)?;
            if mask.true_count() > 0 {
                let null_rows = filter_record_batch(&batch, &mask)?;
                self.null_aware
                    .as_mut()
                    .expect("null aware state present")
                    .append_null_probe(null_rows, &mut self.reservation)?;
                let keep = not(&mask)?;
                batch = filter_record_batch(&batch, &keep)?;
                key_arrays = key_arrays
                    .iter()
                    .map(|array| {
                        compute::filter(array.as_ref(), &keep).map_err(Into::into)
                    })
                    .collect::<Result<Vec<_>>>()?;
            }
        }

        let num_rows = batch.num_rows();
        let mut subs = vec![];
        if num_rows > 0 {
            self.hashes_buffer.clear();
            self.hashes_buffer.resize(num_rows, 0);
            create_hashes(&key_arrays, &self.random_state, &mut self.hashes_buffer)?;

            if self.partitions.len() == 1 {
                // a single loaded partition serves every probe row
                subs.push(ProbeSubBatch {
                    partition: 0,
                    batch,
                    key_arrays,
                    hashes: self.hashes_buffer.clone(),
                });
            } else {
                self.join_metrics.probe_rows_partitioned.add(num_rows);
                let bits = self.partition_count.trailing_zeros();
                let mut indices: Vec<Vec<u32>> = vec![Vec::new(); self.partitions.len()];
                for (row, hash) in self.hashes_buffer.iter().enumerate() {
                    indices[partition_index(*hash, bits)].push(row as u32);
                }
                for (partition, rows) in indices.into_iter().enumerate() {
                    if rows.is_empty() {
                        continue;
                    }
                    let row_indices = UInt32Array::from(rows);
                    match &mut self.partitions[partition] {
                        ProbeTarget::InMemory(_) => {
                            let sub_batch = take_record_batch(&batch, &row_indices)?;
                            let sub_keys = key_arrays
                                .iter()
                                .map(|array| {
                                    compute::take(array.as_ref(), &row_indices, None)
                                        .map_err(Into::into)
                                })
                                .collect::<Result<Vec<_>>>()?;
                            let sub_hashes = row_indices
                                .values()
                                .iter()
                                .map(|&row| self.hashes_buffer[row as usize])
                                .collect();
                            subs.push(ProbeSubBatch {
                                partition,
                                batch: sub_batch,
                                key_arrays: sub_keys,
                                hashes: sub_hashes,
                            });
                        }
                        ProbeTarget::Spilled { probe, .. } => {
                            let spilled_rows = take_record_batch(&batch, &row_indices)?;
                            probe.append_batch(&spilled_rows)?;
                        }
                    }
                }
            }
        }
        self.current_probe = Some(ProbeBatch { subs });
        Ok(())
    }

    /// Produce at most one output batch worth of rows from the in-progress
    /// probe batch. Returns `None` when the poll loop should continue (the
    /// chunk produced no rows, or the probe batch is finished).
    fn process_probe_chunk(&mut self) -> Result<Option<RecordBatch>> {
        let ProcessProbeBatchState {
            sub_idx,
            offset,
            joined_probe_idx,
        } = match &self.state {
            ExecState::ProcessProbeBatch(state) => *state,
            _ => return internal_err!("process_probe_chunk in state {}", self.state.name()),
        };

        let current = match &self.current_probe {
            Some(current) => current,
            None => return internal_err!("no probe batch to process"),
        };
        if sub_idx >= current.subs.len() {
            self.current_probe = None;
            self.state = ExecState::FetchProbeBatch;
            return Ok(None);
        }
        let sub = &current.subs[sub_idx];

        let timer = self.join_metrics.join.join_time.timer();

        // probe the partition's hash table for one bounded chunk of matches,
        // verify key equality (hash collisions) and the residual filter, and
        // update the partition's matched bitmap
        let (partition_batch, build_indices, probe_indices, next_offset) = {
            let partition = match &mut self.partitions[sub.partition] {
                ProbeTarget::InMemory(partition) => partition,
                ProbeTarget::Spilled { .. } => {
                    return internal_err!("probe sub-batch routed to a spilled partition")
                }
            };

            let (probe_indices, build_indices, next_offset) = partition
                .hash_map
                .get_matched_indices_with_limit_offset(
                    &sub.hashes,
                    self.batch_size,
                    offset,
                );
            let build_indices = UInt64Array::from(build_indices);
            let probe_indices = UInt32Array::from(probe_indices);

            let (build_indices, probe_indices) = equal_rows_arr(
                &build_indices,
                &probe_indices,
                &partition.key_arrays,
                &sub.key_arrays,
            )?;

            let (build_indices, probe_indices) = match &self.filter {
                Some(filter) => apply_join_filter_to_indices(
                    &partition.batch,
                    &sub.batch,
                    build_indices,
                    probe_indices,
                    filter,
                    JoinSide::Left,
                )?,
                None => (build_indices, probe_indices),
            };

            if need_produce_result_in_final(self.join_type) {
                build_indices.iter().flatten().for_each(|row| {
                    partition.matched.set_bit(row as usize, true);
                });
            }

            (
                partition.batch.clone(),
                build_indices,
                probe_indices,
                next_offset,
            )
        };

        // probe rows fully processed by this chunk
        let range = offset.0..next_offset.map(|(idx, _)| idx).unwrap_or(sub.batch.num_rows());
        let carry = joined_probe_idx;
        let last_joined = if probe_indices.is_empty() {
            carry
        } else {
            Some(probe_indices.value(probe_indices.len() - 1) as usize)
        };

        let output_indices = match self.join_type {
            JoinType::Inner | JoinType::Left => Some((build_indices, probe_indices)),
            JoinType::Right | JoinType::Full => {
                let unmatched = get_anti_indices(range, &probe_indices, carry);
                Some(append_probe_indices_in_order(
                    build_indices,
                    probe_indices,
                    unmatched,
                ))
            }
            JoinType::RightSemi => {
                let semi = get_semi_indices(range, &probe_indices, carry);
                Some((null_build_indices(semi.len()), semi))
            }
            JoinType::RightAnti => {
                let anti = get_anti_indices(range, &probe_indices, carry);
                Some((null_build_indices(anti.len()), anti))
            }
            // matched bitmap drives the output at the end of the partition
            JoinType::LeftSemi | JoinType::LeftAnti => None,
            JoinType::NullAwareAnti => {
                let anti = get_anti_indices(range, &probe_indices, carry);
                if !anti.is_empty() {
                    let unmatched_rows = take_record_batch(&sub.batch, &anti)?;
                    self.null_aware
                        .as_mut()
                        .expect("null aware state present")
                        .append_unmatched_probe(unmatched_rows, &mut self.reservation)?;
                }
                None
            }
        };

        let result = match output_indices {
            Some((build_indices, probe_indices)) if !probe_indices.is_empty() => {
                let batch = build_batch_from_indices(
                    &self.schema,
                    &partition_batch,
                    &sub.batch,
                    &build_indices,
                    &probe_indices,
                    &self.column_indices,
                    JoinSide::Left,
                )?;
                self.join_metrics.join.output_batches.add(1);
                self.join_metrics.join.output_rows.add(batch.num_rows());
                Some(batch)
            }
            _ => None,
        };
        timer.done();

        self.state = ExecState::ProcessProbeBatch(match next_offset {
            Some(offset) => ProcessProbeBatchState {
                sub_idx,
                offset,
                joined_probe_idx: last_joined,
            },
            None => ProcessProbeBatchState {
                sub_idx: sub_idx + 1,
                offset: (0, None),
                joined_probe_idx: None,
            },
        });

        Ok(result)
    }

    /// The probe side of the current pass is exhausted: run the null-aware
    /// evaluation over consumed partitions, queue partitions that owe
    /// build-side output, and move spilled pairs onto the spilled list.
    fn finish_probe_pass(&mut self) -> Result<()> {
        debug!("Probe side exhausted at level {}", self.level);
        let targets = mem::take(&mut self.partitions);
        for target in targets {
            match target {
                ProbeTarget::InMemory(partition) => {
                    if self.join_type == JoinType::NullAwareAnti {
                        let timer = self.join_metrics.null_aware_time.timer();
                        self.null_aware
                            .as_mut()
                            .expect("null aware state present")
                            .evaluate_null_probe(&partition.batch, self.filter.as_ref())?;
                        timer.done();
                    }
                    if need_produce_result_in_final(self.join_type) {
                        self.unmatched_partitions.push_back(partition);
                    } else {
                        debug!(
                            "Closing in-memory partition at level {} ({} rows)",
                            partition.level,
                            partition.batch.num_rows()
                        );
                        self.reservation.shrink(partition.reserved_bytes);
                    }
                }
                ProbeTarget::Spilled { build, mut probe } => {
                    let probe_file = probe.finish()?;
                    debug!(
                        "Queueing spilled partition from level {}: build {} rows / {} \
                         bytes, probe {} rows",
                        build.level,
                        build.file.num_rows,
                        build.file.num_bytes,
                        probe_file.as_ref().map(|f| f.num_rows).unwrap_or(0),
                    );
                    self.spilled_partitions.push_back(SpilledJoinPair {
                        build,
                        probe: probe_file,
                    });
                }
            }
        }
        self.state = if self.unmatched_partitions.is_empty() {
            ExecState::PrepareSpilledPartition
        } else {
            ExecState::OutputUnmatchedBuild { row_offset: 0 }
        };
        Ok(())
    }

    /// Emit one chunk of build rows owed by the front partition's matched
    /// bitmap (unmatched rows for Left/Full/LeftAnti, matched rows for
    /// LeftSemi). Resumable across output batches.
    fn output_unmatched_build(&mut self) -> Result<Option<RecordBatch>> {
        let row_offset = match &self.state {
            ExecState::OutputUnmatchedBuild { row_offset } => *row_offset,
            _ => return internal_err!("output_unmatched_build in wrong state"),
        };

        let partition = match self.unmatched_partitions.front() {
            Some(partition) => partition,
            None => {
                self.state = ExecState::PrepareSpilledPartition;
                return Ok(None);
            }
        };

        let num_rows = partition.batch.num_rows();
        if row_offset >= num_rows {
            let partition = self
                .unmatched_partitions
                .pop_front()
                .expect("checked above");
            debug!(
                "Closing in-memory partition at level {} ({} rows)",
                partition.level, num_rows
            );
            self.reservation.shrink(partition.reserved_bytes);
            self.state = ExecState::OutputUnmatchedBuild { row_offset: 0 };
            return Ok(None);
        }

        let end = usize::min(row_offset + self.batch_size, num_rows);
        let (build_indices, probe_indices) = get_final_indices_from_bit_map_range(
            &partition.matched,
            self.join_type,
            row_offset..end,
        );
        self.state = ExecState::OutputUnmatchedBuild { row_offset: end };

        if build_indices.is_empty() {
            return Ok(None);
        }
        let empty_probe = RecordBatch::new_empty(Arc::clone(&self.probe_schema));
        let batch = build_batch_from_indices(
            &self.schema,
            &partition.batch,
            &empty_probe,
            &build_indices,
            &probe_indices,
            &self.column_indices,
            JoinSide::Left,
        )?;
        self.join_metrics.join.output_batches.add(1);
        self.join_metrics.join.output_rows.add(batch.num_rows());
        Ok(Some(batch))
    }

    /// Pop the next spilled pair and either load it into memory for probing
    /// or send it through another partitioning pass one level deeper.
    fn prepare_spilled_partition(&mut self) -> Result<()> {
        let pair = match self.spilled_partitions.pop_front() {
            Some(pair) => pair,
            None => {
                // terminal: only the null-aware phases may remain
                self.state = match self.join_type {
                    JoinType::NullAwareAnti => self.prepare_null_aware_output()?,
                    _ => ExecState::Completed,
                };
                return Ok(());
            }
        };

        let SpilledJoinPair { build, probe } = pair;
        self.join_metrics.max_partition_depth.set_max(build.level + 1);
        let probe_rows = probe.as_ref().map(|f| f.num_rows).unwrap_or(0);

        // a pair with no probe rows produces no output unless unmatched
        // build rows must be emitted; for the null-aware join its build rows
        // still take part in the NULL-probe evaluation
        if probe_rows == 0 && !need_produce_result_in_final(self.join_type) {
            if self.join_type == JoinType::NullAwareAnti
                && self
                    .null_aware
                    .as_ref()
                    .expect("null aware state present")
                    .num_null_probe_rows()
                    > 0
            {
                let timer = self.join_metrics.null_aware_time.timer();
                let reader = self.build_spill_manager.read_spill_file(build.file);
                for batch in reader {
                    let batch = batch?;
                    self.null_aware
                        .as_mut()
                        .expect("null aware state present")
                        .evaluate_null_probe(&batch, self.filter.as_ref())?;
                }
                timer.done();
            }
            debug!(
                "Skipping spilled partition from level {} with no probe rows",
                build.level
            );
            return Ok(());
        }

        let table_bytes = JoinHashMap::estimate_memory_size(build.file.num_rows)
            + arrow::util::bit_util::ceil(build.file.num_rows, 8);
        let estimate = build.file.num_bytes + table_bytes;

        if self.reservation.try_grow(estimate).is_ok() {
            // the build side fits: load it and probe its spilled probe rows
            let level = build.level;
            let num_rows = build.file.num_rows;
            let reader = self.build_spill_manager.read_spill_file(build.file);
            let batches = reader.collect::<Result<Vec<_>>>()?;
            let batch = if batches.is_empty() {
                RecordBatch::new_empty(Arc::clone(&self.build_schema))
            } else {
                concat_batches(&self.build_schema, &batches)?
            };
            let partition = build_in_memory_partition(
                &self.on_left,
                level,
                batch,
                estimate,
                &self.join_metrics.hash_tables_built,
            )?;
            debug!(
                "Loaded spilled partition from level {level} ({num_rows} build rows, \
                 {probe_rows} probe rows)"
            );
            self.partitions = vec![ProbeTarget::InMemory(partition)];
            self.level = level;
            self.random_state = join_random_state(level);
            self.probe_source = match probe {
                Some(file) => {
                    ProbeSource::Spilled(self.probe_spill_manager.read_spill_file(file))
                }
                None => ProbeSource::Empty,
            };
            self.join_metrics
                .join
                .build_mem_used
                .set_max(self.reservation.size());
            self.state = ExecState::FetchProbeBatch;
            return Ok(());
        }

        if build.level >= self.max_partition_depth {
            return resources_err!(
                "Cannot build a hash table for a join partition of {} rows / {} bytes \
                 at the maximum partition depth {}; the memory budget is too small \
                 for this join",
                build.file.num_rows,
                build.file.num_bytes,
                self.max_partition_depth
            );
        }

        // repartition one level deeper with a re-seeded hash
        let next_level = build.level + 1;
        debug!(
            "Repartitioning spilled partition from level {} to level {next_level} \
             ({} build rows / {} bytes)",
            build.level, build.file.num_rows, build.file.num_bytes
        );
        self.builder = Some(JoinBuilder::new(
            Arc::clone(&self.build_schema),
            self.on_left.clone(),
            self.join_type,
            self.partition_count,
            next_level,
            Arc::clone(&self.build_spill_manager),
            self.join_metrics.hash_tables_built.clone(),
        ));
        self.build_source =
            BuildSource::Spilled(self.build_spill_manager.read_spill_file(build.file));
        self.pending_probe = probe;
        self.state = ExecState::CollectBuildSide;
        Ok(())
    }

    /// All partitions are consumed: finish the null-aware evaluation and
    /// stage the null-aware output phases.
    fn prepare_null_aware_output(&mut self) -> Result<ExecState> {
        let timer = self.join_metrics.null_aware_time.timer();
        let null_aware = self.null_aware.as_mut().expect("null aware state present");
        null_aware.evaluate_null_builds_against_null_probe(self.filter.as_ref())?;
        let (pending, spilled) = null_aware.take_unmatched_probe(&mut self.reservation)?;
        timer.done();
        Ok(ExecState::OutputNullAwareProbe {
            pending: VecDeque::from(pending),
            reader: spilled.map(|file| self.probe_spill_manager.read_spill_file(file)),
        })
    }

    /// Emit probe rows that matched no hash table, unless a NULL-keyed build
    /// row passes the residual filter against them.
    fn output_null_aware_probe(&mut self) -> Result<Option<RecordBatch>> {
        let next = match &mut self.state {
            ExecState::OutputNullAwareProbe { pending, reader } => match pending.pop_front() {
                Some(batch) => Some(Ok(batch)),
                None => reader.as_mut().and_then(|reader| reader.next()),
            },
            _ => return internal_err!("output_null_aware_probe in wrong state"),
        };

        let batch = match next {
            Some(batch) => batch?,
            None => {
                self.state = ExecState::OutputNullAwareNullProbe { batch_idx: 0 };
                return Ok(None);
            }
        };

        let timer = self.join_metrics.null_aware_time.timer();
        let suppressed = self
            .null_aware
            .as_ref()
            .expect("null aware state present")
            .suppressed_by_null_builds(&batch, self.filter.as_ref())?;
        let keep = not(&suppressed)?;
        let batch = filter_record_batch(&batch, &keep)?;
        timer.done();

        if batch.num_rows() == 0 {
            return Ok(None);
        }
        self.join_metrics.join.output_batches.add(1);
        self.join_metrics.join.output_rows.add(batch.num_rows());
        Ok(Some(batch))
    }

    /// Emit the NULL-keyed probe rows whose matched bit never got set.
    fn output_null_aware_null_probe(&mut self) -> Result<Option<RecordBatch>> {
        let batch_idx = match &self.state {
            ExecState::OutputNullAwareNullProbe { batch_idx } => *batch_idx,
            _ => return internal_err!("output_null_aware_null_probe in wrong state"),
        };
        let null_aware = self.null_aware.as_ref().expect("null aware state present");
        if batch_idx >= null_aware.num_null_probe_batches() {
            self.state = ExecState::Completed;
            return Ok(None);
        }
        let batch = null_aware.unmatched_null_probe_batch(batch_idx)?;
        self.state = ExecState::OutputNullAwareNullProbe {
            batch_idx: batch_idx + 1,
        };
        if batch.num_rows() == 0 {
            return Ok(None);
        }
        self.join_metrics.join.output_batches.add(1);
        self.join_metrics.join.output_rows.add(batch.num_rows());
        Ok(Some(batch))
    }
}

/// A build-side index array of `len` nulls, for output that only carries
/// probe columns.
fn null_build_indices(len: usize) -> UInt64Array {
    let mut builder = UInt64Builder::with_capacity(len);
    builder.append_nulls(len);
    builder.finish()
}

impl Stream for PartitionedHashJoinStream {
    type Item = Result<RecordBatch>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_inner(cx)
    }
}

impl RecordBatchStream for PartitionedHashJoinStream {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
}
