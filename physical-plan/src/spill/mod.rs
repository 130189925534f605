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

//! Spill files: writing record batches to disk and reading them back.
//!
//! Spilled data is stored in the Arrow IPC stream format. Stream format is
//! used because it supports dictionary replacement and the random access of
//! the IPC file format is not needed: spill files are always consumed
//! sequentially, once, and deleted afterwards.

mod in_progress_spill_file;
mod spill_manager;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use arrow::datatypes::Schema;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use grace_common::{exec_grace_err, Result};
use grace_execution::disk_manager::RefCountedTempFile;

pub use in_progress_spill_file::InProgressSpillFile;
pub use spill_manager::SpillManager;

/// A finished spill file together with what was written into it.
///
/// The underlying temporary file is deleted when the last reference to it is
/// dropped, which makes consuming a `SpilledFile` a "delete on read"
/// operation: readers take ownership and drop it at end of stream.
#[derive(Debug)]
pub struct SpilledFile {
    /// Handle of the temporary file, deleted on drop
    pub file: RefCountedTempFile,
    /// Rows written to the file
    pub num_rows: usize,
    /// Batches written to the file
    pub num_batches: usize,
    /// In-memory size estimate of the data in the file
    pub num_bytes: usize,
}

/// Write in Arrow IPC Stream format to a file.
pub struct IPCStreamWriter {
    /// Inner writer
    pub writer: StreamWriter<File>,
    /// Batches written
    pub num_batches: usize,
    /// Rows written
    pub num_rows: usize,
    /// Bytes written, estimated from the in-memory size of the batches
    pub num_bytes: usize,
}

impl IPCStreamWriter {
    /// Create new writer
    pub fn new(path: &Path, schema: &Schema) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            exec_grace_err!("Failed to create partition file at {path:?}: {e:?}")
        })?;
        Ok(Self {
            num_batches: 0,
            num_rows: 0,
            num_bytes: 0,
            writer: StreamWriter::try_new(file, schema)?,
        })
    }

    /// Write one single batch
    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch)?;
        self.num_batches += 1;
        self.num_rows += batch.num_rows();
        self.num_bytes += batch.get_array_memory_size();
        Ok(())
    }

    /// Finish the writer
    pub fn finish(&mut self) -> Result<()> {
        self.writer.finish().map_err(Into::into)
    }
}

/// Sequential reader over a [`SpilledFile`].
///
/// The reader owns the temp file; when the reader is dropped (normally after
/// the stream is exhausted) the file is deleted.
pub struct SpillFileReader {
    /// The temp file handle (auto-deletes when dropped)
    file: SpilledFile,
    /// Sequential reader for this file (lazily initialized on first read)
    reader: Option<StreamReader<BufReader<File>>>,
}

impl SpillFileReader {
    /// Create a reader for `file`
    pub fn new(file: SpilledFile) -> Self {
        Self { file, reader: None }
    }

    /// Rows remaining in the file when the reader was created
    pub fn num_rows(&self) -> usize {
        self.file.num_rows
    }

    fn init_reader(&mut self) -> Result<()> {
        if self.reader.is_none() {
            let file_handle = File::open(self.file.file.path()).map_err(|e| {
                exec_grace_err!(
                    "Failed to open spill file {:?} for reading: {e}",
                    self.file.file.path()
                )
            })?;
            let buf_reader = BufReader::new(file_handle);
            self.reader = Some(StreamReader::try_new(buf_reader, None)?);
        }
        Ok(())
    }
}

impl Iterator for SpillFileReader {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.init_reader() {
            return Some(Err(e));
        }
        let reader = self.reader.as_mut().expect("reader initialized above");
        match reader.next() {
            Some(Ok(batch)) => Some(Ok(batch)),
            Some(Err(e)) => Some(Err(e.into())),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use grace_execution::runtime_env::RuntimeEnv;

    use super::*;
    use crate::metrics::{ExecutionPlanMetricsSet, SpillMetrics};

    fn test_batch(values: Vec<i32>) -> (SchemaRef, RecordBatch) {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from(values))],
        )
        .unwrap();
        (schema, batch)
    }

    fn test_spill_manager(schema: SchemaRef) -> Arc<SpillManager> {
        let metrics = ExecutionPlanMetricsSet::new();
        Arc::new(SpillManager::new(
            Arc::new(RuntimeEnv::default()),
            SpillMetrics::new(&metrics, 0),
            schema,
        ))
    }

    #[test]
    fn spill_roundtrip() -> Result<()> {
        let (schema, batch) = test_batch(vec![1, 2, 3]);
        let manager = test_spill_manager(schema);

        let spilled = manager
            .spill_record_batches_and_finish(&[batch.clone(), batch.clone()], "test")?
            .expect("non-empty spill");
        assert_eq!(spilled.num_rows, 6);
        assert_eq!(spilled.num_batches, 2);

        let path = spilled.file.path().to_owned();
        assert!(path.exists());

        let batches = SpillFileReader::new(spilled).collect::<Result<Vec<_>>>()?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], batch);
        Ok(())
    }

    #[test]
    fn spill_file_deleted_after_read() -> Result<()> {
        let (schema, batch) = test_batch(vec![7]);
        let manager = test_spill_manager(schema);

        let spilled = manager
            .spill_record_batches_and_finish(&[batch], "test")?
            .unwrap();
        let path = spilled.file.path().to_owned();

        let reader = SpillFileReader::new(spilled);
        drop(reader);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn empty_spill_returns_none() -> Result<()> {
        let (schema, _) = test_batch(vec![]);
        let manager = test_spill_manager(schema);
        assert!(manager
            .spill_record_batches_and_finish(&[], "test")?
            .is_none());
        Ok(())
    }

    #[test]
    fn spill_metrics_updated() -> Result<()> {
        let (schema, batch) = test_batch(vec![1, 2]);
        let metrics = ExecutionPlanMetricsSet::new();
        let manager = Arc::new(SpillManager::new(
            Arc::new(RuntimeEnv::default()),
            SpillMetrics::new(&metrics, 0),
            schema,
        ));
        manager.spill_record_batches_and_finish(&[batch], "test")?;

        let set = metrics.clone_inner();
        assert_eq!(set.spill_count(), Some(1));
        assert_eq!(set.spilled_rows(), Some(2));
        assert!(set.spilled_bytes().unwrap() > 0);
        Ok(())
    }
}
