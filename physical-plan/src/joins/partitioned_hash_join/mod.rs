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

//! [`PartitionedHashJoinExec`]: a hash join that partitions both inputs and
//! spills partitions to disk when the build side does not fit its memory
//! budget, repartitioning recursively with fresh hash seeds as needed.

mod build;
mod null_aware;
mod stream;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use grace_common::{plan_err, JoinType, Result};
use grace_execution::memory_pool::MemoryConsumer;
use grace_execution::TaskContext;

use crate::joins::utils::{
    build_join_schema, check_join_is_valid, ColumnIndex, JoinFilter, JoinOn,
};
use crate::metrics::{ExecutionPlanMetricsSet, MetricsSet, SpillMetrics};
use crate::spill::SpillManager;
use crate::{
    DisplayAs, DisplayFormatType, ExecutionPlan, SendableRecordBatchStream,
};

use self::stream::{PartitionedHashJoinMetrics, PartitionedHashJoinStream};

/// Default number of partitions each partitioning pass fans out into.
pub const DEFAULT_PARTITION_COUNT: usize = 16;

/// Default bound on the partition repartitioning depth.
pub const DEFAULT_MAX_PARTITION_DEPTH: usize = 16;

/// Join execution plan: evaluates equality predicates (and an optional
/// residual filter) between the rows of two inputs using partitioned hash
/// tables, spilling to disk when the build side exceeds the memory budget.
///
/// The left input is the *build* side: it is consumed first and fanned out
/// into hash partitions, each of which either carries an in-memory hash
/// table or a spill file. The right input is the *probe* side: its rows are
/// routed by the same hash, probed against in-memory partitions and spilled
/// alongside build partitions that did not fit. Spilled partition pairs are
/// then replayed, recursively repartitioned with a re-seeded hash when a
/// single partition is still too large for the budget.
///
/// All nine join variants share this machinery and differ only in their
/// emission rules; see [`JoinType`]. Output order is unspecified.
pub struct PartitionedHashJoinExec {
    /// left (build) side of the join
    left: Arc<dyn ExecutionPlan>,
    /// right (probe) side of the join
    right: Arc<dyn ExecutionPlan>,
    /// Set of equijoin columns from the relations: `(left_col, right_col)`
    on: JoinOn,
    /// Filters which are applied while finding matching rows
    filter: Option<JoinFilter>,
    /// How the join is performed
    join_type: JoinType,
    /// The output schema for the join
    schema: SchemaRef,
    /// Information of index and left / right placement of columns
    column_indices: Vec<ColumnIndex>,
    /// Fanout of each partitioning pass
    partition_count: usize,
    /// Bound on repartitioning recursion
    max_partition_depth: usize,
    /// Execution metrics
    metrics: ExecutionPlanMetricsSet,
}

impl PartitionedHashJoinExec {
    /// Tries to create a new [PartitionedHashJoinExec].
    ///
    /// # Error
    /// This function errors when there are no equijoin keys or their types
    /// mismatch.
    pub fn try_new(
        left: Arc<dyn ExecutionPlan>,
        right: Arc<dyn ExecutionPlan>,
        on: JoinOn,
        filter: Option<JoinFilter>,
        join_type: JoinType,
    ) -> Result<Self> {
        let left_schema = left.schema();
        let right_schema = right.schema();
        check_join_is_valid(&left_schema, &right_schema, &on)?;

        let (schema, column_indices) =
            build_join_schema(&left_schema, &right_schema, &join_type);

        Ok(Self {
            left,
            right,
            on,
            filter,
            join_type,
            schema: Arc::new(schema),
            column_indices,
            partition_count: DEFAULT_PARTITION_COUNT,
            max_partition_depth: DEFAULT_MAX_PARTITION_DEPTH,
            metrics: ExecutionPlanMetricsSet::new(),
        })
    }

    /// Set the fanout of each partitioning pass; must be a power of two of
    /// at least 2.
    pub fn with_partition_count(mut self, partition_count: usize) -> Result<Self> {
        if !partition_count.is_power_of_two() || partition_count < 2 {
            return plan_err!(
                "partition count must be a power of two >= 2, got {partition_count}"
            );
        }
        self.partition_count = partition_count;
        Ok(self)
    }

    /// Set the bound on repartitioning recursion; a spilled partition that
    /// still does not fit at this depth fails the query.
    pub fn with_max_partition_depth(mut self, max_partition_depth: usize) -> Result<Self> {
        if max_partition_depth == 0 {
            return plan_err!("maximum partition depth must be at least 1");
        }
        self.max_partition_depth = max_partition_depth;
        Ok(self)
    }

    /// left (build) side of the join
    pub fn left(&self) -> &Arc<dyn ExecutionPlan> {
        &self.left
    }

    /// right (probe) side of the join
    pub fn right(&self) -> &Arc<dyn ExecutionPlan> {
        &self.right
    }

    /// Set of common columns used to join on
    pub fn on(&self) -> &JoinOn {
        &self.on
    }

    /// Filters applied before join output
    pub fn filter(&self) -> Option<&JoinFilter> {
        self.filter.as_ref()
    }

    /// How the join is performed
    pub fn join_type(&self) -> &JoinType {
        &self.join_type
    }

    /// Fanout of each partitioning pass
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Bound on repartitioning recursion
    pub fn max_partition_depth(&self) -> usize {
        self.max_partition_depth
    }
}

impl fmt::Debug for PartitionedHashJoinExec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_as(DisplayFormatType::Default, f)
    }
}

impl DisplayAs for PartitionedHashJoinExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                let display_on = self
                    .on
                    .iter()
                    .map(|(l, r)| format!("({l}, {r})"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let display_filter = self.filter.as_ref().map_or_else(
                    || "".to_string(),
                    |f| format!(", filter={}", f.expression()),
                );
                write!(
                    f,
                    "PartitionedHashJoinExec: join_type={}, on=[{display_on}]{display_filter}",
                    self.join_type
                )
            }
        }
    }
}

impl ExecutionPlan for PartitionedHashJoinExec {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn children(&self) -> Vec<Arc<dyn ExecutionPlan>> {
        vec![Arc::clone(&self.left), Arc::clone(&self.right)]
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> Result<SendableRecordBatchStream> {
        let on_left = self.on.iter().map(|on| Arc::clone(&on.0)).collect::<Vec<_>>();
        let on_right = self.on.iter().map(|on| Arc::clone(&on.1)).collect::<Vec<_>>();

        let build_stream = self.left.execute(partition, Arc::clone(&context))?;
        let probe_stream = self.right.execute(partition, Arc::clone(&context))?;

        let join_metrics = PartitionedHashJoinMetrics::new(partition, &self.metrics);
        let reservation =
            MemoryConsumer::new(format!("PartitionedHashJoinStream[{partition}]"))
                .with_can_spill(true)
                .register(context.memory_pool());

        let build_spill_manager = Arc::new(SpillManager::new(
            context.runtime_env(),
            SpillMetrics::new(&self.metrics, partition),
            self.left.schema(),
        ));
        let probe_spill_manager = Arc::new(SpillManager::new(
            context.runtime_env(),
            SpillMetrics::new(&self.metrics, partition),
            self.right.schema(),
        ));

        Ok(Box::pin(PartitionedHashJoinStream::new(
            Arc::clone(&self.schema),
            on_left,
            on_right,
            self.filter.clone(),
            self.join_type,
            self.column_indices.clone(),
            self.partition_count,
            self.max_partition_depth,
            build_stream,
            probe_stream,
            context,
            reservation,
            build_spill_manager,
            probe_spill_manager,
            join_metrics,
        )))
    }

    fn metrics(&self) -> Option<MetricsSet> {
        Some(self.metrics.clone_inner())
    }
}
