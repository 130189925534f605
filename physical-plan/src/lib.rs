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

//! Physical operators: the spill-capable partitioned hash join and the
//! infrastructure it executes on (streams, metrics, spill files, in-memory
//! sources).

use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use grace_common::Result;
use grace_execution::TaskContext;

pub mod common;
pub mod joins;
pub mod memory;
pub mod metrics;
pub mod spill;
pub mod stream;

pub use grace_execution::stream::{RecordBatchStream, SendableRecordBatchStream};

use crate::metrics::MetricsSet;

/// The formats a plan can be displayed in.
#[derive(Debug, Clone, Copy)]
pub enum DisplayFormatType {
    /// Default, compact format. Example: `PartitionedHashJoinExec: join_type=Inner`
    Default,
    /// Verbose, showing all available details
    Verbose,
}

/// Trait for types which could have additional details when formatted in
/// `Verbose` mode.
pub trait DisplayAs {
    /// Format according to `DisplayFormatType`, used when verbose representation looks
    /// different from the default one
    fn fmt_as(&self, t: DisplayFormatType, f: &mut Formatter) -> fmt::Result;
}

/// Represents a node in a query's physical execution plan.
///
/// Calling [`execute`](ExecutionPlan::execute) produces a
/// [`SendableRecordBatchStream`] of record batches for one partition of the
/// node's output. Each partition is an independent unit of execution; the
/// only shared state between partitions is the memory pool of the
/// [`TaskContext`].
pub trait ExecutionPlan: Debug + DisplayAs + Send + Sync {
    /// Returns the execution plan as [`Any`] so that it can be
    /// downcast to a specific implementation.
    fn as_any(&self) -> &dyn Any;

    /// Get the schema for this execution plan
    fn schema(&self) -> SchemaRef;

    /// Get a list of child execution plans that provide the input for this plan.
    fn children(&self) -> Vec<Arc<dyn ExecutionPlan>>;

    /// Begin execution of `partition`, returning a stream of record batches.
    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> Result<SendableRecordBatchStream>;

    /// Return a snapshot of the set of metrics for this plan node, if any.
    ///
    /// While the values of the metrics in the returned set are not guaranteed
    /// to be the same as at any user-visible point, they will be a consistent
    /// snapshot once the plan's streams are exhausted.
    fn metrics(&self) -> Option<MetricsSet> {
        None
    }
}
