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

//! Auxiliary state for the null-aware anti join.
//!
//! A `NOT IN` subquery suppresses a probe row not only when a build row
//! matches its key, but also when the comparison is *unknown*: a NULL key on
//! the probe side is suppressed by any build row that passes the residual
//! filter, and a NULL key on the build side suppresses any probe row it
//! passes the filter with. The state here accumulates the rows needed to
//! realize that:
//!
//! * `null_probe_batches` — probe rows with a NULL key, diverted before
//!   partitioning, with a matched bit per row,
//! * `nulls_build_batches` — build rows with a NULL key, never partitioned,
//! * `unmatched_probe` — probe rows that matched no build row in any hash
//!   table, to be compared against the NULL-keyed build rows at the end.

use std::sync::Arc;

use arrow::array::{BooleanArray, BooleanBufferBuilder, UInt32Array, UInt64Array};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use grace_common::{JoinSide, Result};
use grace_execution::memory_pool::MemoryReservation;

use super::build::PartitionBuffer;
use crate::joins::utils::{apply_join_filter_to_indices, JoinFilter};
use crate::spill::{SpillManager, SpilledFile};

/// Rows of the build side compared per evaluation step, bounding the
/// intermediate batch of the filter.
const EVAL_CHUNK_ROWS: usize = 8192;

pub(crate) struct NullAwareState {
    /// Probe rows whose key contained NULL, accumulated across all passes
    null_probe_batches: Vec<RecordBatch>,
    null_probe_rows: usize,
    /// One bit per row in `null_probe_batches`, set once any build row
    /// passes the residual filter against it
    matched_null_probe: BooleanBufferBuilder,
    /// Build rows whose key contained NULL
    nulls_build_batches: Vec<RecordBatch>,
    nulls_build_rows: usize,
    /// Probe rows that found no match in any in-memory hash table
    unmatched_probe: PartitionBuffer,
}

impl NullAwareState {
    pub fn new(probe_spill_manager: Arc<SpillManager>) -> Self {
        Self {
            null_probe_batches: vec![],
            null_probe_rows: 0,
            matched_null_probe: BooleanBufferBuilder::new(0),
            nulls_build_batches: vec![],
            nulls_build_rows: 0,
            unmatched_probe: PartitionBuffer::new(probe_spill_manager),
        }
    }

    pub fn num_null_probe_rows(&self) -> usize {
        self.null_probe_rows
    }

    pub fn num_null_probe_batches(&self) -> usize {
        self.null_probe_batches.len()
    }

    /// Accumulate probe rows with NULL keys. Their matched bits start unset.
    pub fn append_null_probe(
        &mut self,
        batch: RecordBatch,
        reservation: &mut MemoryReservation,
    ) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        reservation.try_grow(batch.get_array_memory_size())?;
        self.matched_null_probe.append_n(batch.num_rows(), false);
        self.null_probe_rows += batch.num_rows();
        self.null_probe_batches.push(batch);
        Ok(())
    }

    /// Accumulate build rows with NULL keys.
    pub fn append_null_build(
        &mut self,
        batch: RecordBatch,
        reservation: &mut MemoryReservation,
    ) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        reservation.try_grow(batch.get_array_memory_size())?;
        self.nulls_build_rows += batch.num_rows();
        self.nulls_build_batches.push(batch);
        Ok(())
    }

    /// Accumulate probe rows that matched nothing during probing; spills to
    /// disk when the reservation cannot cover them.
    pub fn append_unmatched_probe(
        &mut self,
        batch: RecordBatch,
        reservation: &mut MemoryReservation,
    ) -> Result<()> {
        self.unmatched_probe
            .append_with_spill(batch, reservation, "null aware probe partition")
    }

    /// Evaluate the residual filter between every row of `build_batch` and
    /// every not-yet-matched NULL-keyed probe row, setting matched bits and
    /// short-circuiting per probe row. Without a residual filter every build
    /// row matches.
    pub fn evaluate_null_probe(
        &mut self,
        build_batch: &RecordBatch,
        filter: Option<&JoinFilter>,
    ) -> Result<()> {
        if build_batch.num_rows() == 0 || self.null_probe_rows == 0 {
            return Ok(());
        }
        let filter = match filter {
            None => {
                // a bare `NOT IN`: any build row suppresses any NULL probe row
                for idx in 0..self.null_probe_rows {
                    self.matched_null_probe.set_bit(idx, true);
                }
                return Ok(());
            }
            Some(filter) => filter,
        };

        let mut global = 0;
        for probe_batch in &self.null_probe_batches {
            for row in 0..probe_batch.num_rows() {
                let idx = global + row;
                if self.matched_null_probe.get_bit(idx) {
                    continue;
                }
                if any_filter_match(build_batch, probe_batch, row, filter)? {
                    self.matched_null_probe.set_bit(idx, true);
                }
            }
            global += probe_batch.num_rows();
        }
        Ok(())
    }

    /// Evaluate the residual filter between the NULL-keyed build rows and the
    /// NULL-keyed probe rows.
    pub fn evaluate_null_builds_against_null_probe(
        &mut self,
        filter: Option<&JoinFilter>,
    ) -> Result<()> {
        let build_batches = self.nulls_build_batches.clone();
        for batch in &build_batches {
            self.evaluate_null_probe(batch, filter)?;
        }
        Ok(())
    }

    /// For each row of `probe_batch`, whether any NULL-keyed build row
    /// passes the residual filter against it (suppressing the row). Without
    /// a filter, any NULL-keyed build row suppresses every probe row.
    pub fn suppressed_by_null_builds(
        &self,
        probe_batch: &RecordBatch,
        filter: Option<&JoinFilter>,
    ) -> Result<BooleanArray> {
        let num_rows = probe_batch.num_rows();
        if self.nulls_build_rows == 0 {
            return Ok(BooleanArray::from(vec![false; num_rows]));
        }
        let filter = match filter {
            None => return Ok(BooleanArray::from(vec![true; num_rows])),
            Some(filter) => filter,
        };

        let mut suppressed = vec![false; num_rows];
        for (row, suppressed) in suppressed.iter_mut().enumerate() {
            'builds: for build_batch in &self.nulls_build_batches {
                if any_filter_match(build_batch, probe_batch, row, filter)? {
                    *suppressed = true;
                    break 'builds;
                }
            }
        }
        Ok(BooleanArray::from(suppressed))
    }

    /// Take the accumulated unmatched probe rows for reading, releasing
    /// their reserved memory.
    pub fn take_unmatched_probe(
        &mut self,
        reservation: &mut MemoryReservation,
    ) -> Result<(Vec<RecordBatch>, Option<SpilledFile>)> {
        reservation.shrink(self.unmatched_probe.in_memory_bytes());
        let batches = self.unmatched_probe.take_batches();
        let spilled = self.unmatched_probe.finish_spill()?;
        Ok((batches, spilled))
    }

    /// The `batch_idx`-th batch of NULL-keyed probe rows, reduced to the rows
    /// whose matched bit is still unset.
    pub fn unmatched_null_probe_batch(&self, batch_idx: usize) -> Result<RecordBatch> {
        let offset: usize = self.null_probe_batches[..batch_idx]
            .iter()
            .map(|b| b.num_rows())
            .sum();
        let batch = &self.null_probe_batches[batch_idx];
        let mask = (0..batch.num_rows())
            .map(|row| Some(!self.matched_null_probe.get_bit(offset + row)))
            .collect::<BooleanArray>();
        filter_record_batch(batch, &mask).map_err(Into::into)
    }
}

/// True when any row of `build_batch` joined with row `probe_row` of
/// `probe_batch` passes `filter`. The build side is compared in bounded
/// chunks so the intermediate batch never exceeds [`EVAL_CHUNK_ROWS`].
fn any_filter_match(
    build_batch: &RecordBatch,
    probe_batch: &RecordBatch,
    probe_row: usize,
    filter: &JoinFilter,
) -> Result<bool> {
    let num_rows = build_batch.num_rows();
    let mut offset = 0;
    while offset < num_rows {
        let len = usize::min(EVAL_CHUNK_ROWS, num_rows - offset);
        let chunk = build_batch.slice(offset, len);
        let build_indices = UInt64Array::from_iter_values(0..len as u64);
        let probe_indices = UInt32Array::from(vec![probe_row as u32; len]);
        let (matched_build, _) = apply_join_filter_to_indices(
            &chunk,
            probe_batch,
            build_indices,
            probe_indices,
            filter,
            JoinSide::Left,
        )?;
        if !matched_build.is_empty() {
            return Ok(true);
        }
        offset += len;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::{DataType, Field, Schema};
    use grace_execution::memory_pool::{MemoryConsumer, MemoryPool, UnboundedMemoryPool};
    use grace_execution::runtime_env::RuntimeEnv;
    use grace_physical_expr::expressions::{BinaryExpr, Column};
    use grace_physical_expr::Operator;

    use super::*;
    use crate::joins::utils::ColumnIndex;
    use crate::metrics::{ExecutionPlanMetricsSet, SpillMetrics};
    use crate::test::build_table_i32_nullable;

    fn test_state() -> (NullAwareState, MemoryReservation) {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let reservation = MemoryConsumer::new("naaj-test").register(&pool);
        let metrics = ExecutionPlanMetricsSet::new();
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int32, true),
        ]));
        let manager = Arc::new(SpillManager::new(
            Arc::new(RuntimeEnv::default()),
            SpillMetrics::new(&metrics, 0),
            schema,
        ));
        (NullAwareState::new(manager), reservation)
    }

    /// filter comparing the second payload column of both sides:
    /// `build.b < probe.b`
    fn payload_filter() -> JoinFilter {
        let intermediate_schema = Schema::new(vec![
            Field::new("b_build", DataType::Int32, true),
            Field::new("b_probe", DataType::Int32, true),
        ]);
        let expression = Arc::new(BinaryExpr::new(
            Arc::new(Column::new("b_build", 0)),
            Operator::Lt,
            Arc::new(Column::new("b_probe", 1)),
        ));
        let column_indices = vec![
            ColumnIndex {
                index: 1,
                side: JoinSide::Left,
            },
            ColumnIndex {
                index: 1,
                side: JoinSide::Right,
            },
        ];
        JoinFilter::new(expression, column_indices, intermediate_schema)
    }

    #[test]
    fn no_filter_marks_all_null_probe_rows() -> Result<()> {
        let (mut state, mut reservation) = test_state();
        let probe = build_table_i32_nullable(
            ("a", &vec![None, None]),
            ("b", &vec![Some(1), Some(2)]),
        );
        state.append_null_probe(probe, &mut reservation)?;

        let build = build_table_i32_nullable(("a", &vec![Some(5)]), ("b", &vec![Some(5)]));
        state.evaluate_null_probe(&build, None)?;

        let remaining = state.unmatched_null_probe_batch(0)?;
        assert_eq!(remaining.num_rows(), 0);
        Ok(())
    }

    #[test]
    fn filter_short_circuits_per_row() -> Result<()> {
        let (mut state, mut reservation) = test_state();
        // probe payloads 1 and 10
        let probe = build_table_i32_nullable(
            ("a", &vec![None, None]),
            ("b", &vec![Some(1), Some(10)]),
        );
        state.append_null_probe(probe, &mut reservation)?;

        // build payload 5: filter build.b < probe.b matches only probe row 1
        let build = build_table_i32_nullable(("a", &vec![Some(7)]), ("b", &vec![Some(5)]));
        state.evaluate_null_probe(&build, Some(&payload_filter()))?;

        let remaining = state.unmatched_null_probe_batch(0)?;
        assert_eq!(remaining.num_rows(), 1);
        Ok(())
    }

    #[test]
    fn null_builds_suppress_probe_rows() -> Result<()> {
        let (mut state, mut reservation) = test_state();
        let null_build = build_table_i32_nullable(("a", &vec![None]), ("b", &vec![Some(5)]));
        state.append_null_build(null_build, &mut reservation)?;

        let probe = build_table_i32_nullable(
            ("a", &vec![Some(1), Some(2)]),
            ("b", &vec![Some(1), Some(10)]),
        );

        // without a filter everything is suppressed
        let suppressed = state.suppressed_by_null_builds(&probe, None)?;
        assert_eq!(suppressed.true_count(), 2);

        // with the payload filter only probe rows with b > 5 are suppressed
        let suppressed = state.suppressed_by_null_builds(&probe, Some(&payload_filter()))?;
        assert_eq!(
            suppressed.iter().collect::<Vec<_>>(),
            vec![Some(false), Some(true)]
        );
        Ok(())
    }

    #[test]
    fn unmatched_probe_round_trip() -> Result<()> {
        let (mut state, mut reservation) = test_state();
        let probe = build_table_i32_nullable(
            ("a", &vec![Some(1), Some(2)]),
            ("b", &vec![Some(1), Some(2)]),
        );
        state.append_unmatched_probe(probe.clone(), &mut reservation)?;

        let (batches, spilled) = state.take_unmatched_probe(&mut reservation)?;
        assert!(spilled.is_none());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], probe);
        assert_eq!(reservation.size(), 0);
        Ok(())
    }
}
