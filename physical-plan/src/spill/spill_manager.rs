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

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use grace_common::Result;
use grace_execution::runtime_env::RuntimeEnv;

use super::{InProgressSpillFile, SpillFileReader, SpilledFile};
use crate::metrics::SpillMetrics;

/// The `SpillManager` is responsible for the communication with the
/// [`RuntimeEnv`]'s disk manager when spilling record batches of one schema:
/// it creates spill files, tracks the spill metrics, and reads finished files
/// back.
#[derive(Debug, Clone)]
pub struct SpillManager {
    env: Arc<RuntimeEnv>,
    pub(crate) metrics: SpillMetrics,
    schema: SchemaRef,
}

impl SpillManager {
    /// Create a manager spilling batches of `schema`
    pub fn new(env: Arc<RuntimeEnv>, metrics: SpillMetrics, schema: SchemaRef) -> Self {
        Self {
            env,
            metrics,
            schema,
        }
    }

    /// Schema of the batches this manager spills
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// The runtime environment of this manager
    pub(crate) fn env(&self) -> &Arc<RuntimeEnv> {
        &self.env
    }

    /// Creates a temporary file for in-progress operations, returning an error
    /// message if file creation fails. The file can be used to append batches
    /// incrementally and then finish the file when done.
    pub fn create_in_progress_file(
        self: &Arc<Self>,
        request_msg: &str,
    ) -> Result<InProgressSpillFile> {
        let temp_file = self.env.disk_manager.create_tmp_file(request_msg)?;
        Ok(InProgressSpillFile::new(Arc::clone(self), temp_file))
    }

    /// Spill input `batches` into a single file in one operation. Returns
    /// `None` if no rows were spilled (all batches empty).
    pub fn spill_record_batches_and_finish(
        self: &Arc<Self>,
        batches: &[RecordBatch],
        request_msg: &str,
    ) -> Result<Option<SpilledFile>> {
        let mut in_progress_file = self.create_in_progress_file(request_msg)?;

        for batch in batches {
            in_progress_file.append_batch(batch)?;
        }

        in_progress_file.finish()
    }

    /// Open a finished spill file for sequential, delete-on-read consumption.
    pub fn read_spill_file(&self, file: SpilledFile) -> SpillFileReader {
        SpillFileReader::new(file)
    }
}
