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

use arrow::record_batch::RecordBatch;
use grace_common::{internal_err, Result};
use grace_execution::disk_manager::RefCountedTempFile;

use super::{IPCStreamWriter, SpillManager, SpilledFile};

/// Represents an in-progress spill file used for writing `RecordBatch`es to
/// disk, created by [`SpillManager`]. Caller is able to use this struct to
/// incrementally append in-memory batches to the file, and then finalize the
/// file by calling the `finish` method.
pub struct InProgressSpillFile {
    spill_writer: Arc<SpillManager>,
    /// Lazily initialized on the first batch write
    writer: Option<IPCStreamWriter>,
    /// Lazily created on the first batch write
    in_progress_file: Option<RefCountedTempFile>,
}

impl InProgressSpillFile {
    /// Create a new in-progress file backed by `in_progress_file`
    pub fn new(
        spill_writer: Arc<SpillManager>,
        in_progress_file: RefCountedTempFile,
    ) -> Self {
        Self {
            spill_writer,
            in_progress_file: Some(in_progress_file),
            writer: None,
        }
    }

    /// Rows appended so far
    pub fn num_rows(&self) -> usize {
        self.writer.as_ref().map(|w| w.num_rows).unwrap_or(0)
    }

    /// Estimated in-memory bytes of the rows appended so far
    pub fn num_bytes(&self) -> usize {
        self.writer.as_ref().map(|w| w.num_bytes).unwrap_or(0)
    }

    /// Appends a `RecordBatch` to the file, initializing the writer if this
    /// is the first append. Empty batches are skipped.
    pub fn append_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if self.in_progress_file.is_none() {
            return internal_err!("append_batch() on a finished spill file");
        }
        if self.writer.is_none() {
            let schema = batch.schema();
            if let Some(in_progress_file) = &self.in_progress_file {
                self.writer = Some(IPCStreamWriter::new(
                    in_progress_file.path(),
                    schema.as_ref(),
                )?);

                // Update metrics
                self.spill_writer.metrics.spill_file_count.add(1);
            }
        }
        if let Some(writer) = &mut self.writer {
            let batch_bytes = batch.get_array_memory_size();
            self.spill_writer
                .env()
                .disk_manager
                .try_register_disk_usage(batch_bytes)?;

            writer.write(batch)?;

            // Update metrics
            self.spill_writer.metrics.spilled_rows.add(batch.num_rows());
            self.spill_writer.metrics.spilled_bytes.add(batch_bytes);
        }
        Ok(())
    }

    /// Finalizes the file, returning the completed file reference.
    /// If there are no batches spilled before, it returns `None`.
    pub fn finish(&mut self) -> Result<Option<SpilledFile>> {
        if let Some(writer) = &mut self.writer {
            writer.finish()?;
        } else {
            return Ok(None);
        }
        let (num_rows, num_batches, num_bytes) = self
            .writer
            .as_ref()
            .map(|w| (w.num_rows, w.num_batches, w.num_bytes))
            .unwrap_or((0, 0, 0));

        Ok(self.in_progress_file.take().map(|file| SpilledFile {
            file,
            num_rows,
            num_batches,
            num_bytes,
        }))
    }
}
