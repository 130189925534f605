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

//! Defines common code used in execution plans

use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use grace_common::Result;

use crate::SendableRecordBatchStream;

/// Create a vector of record batches from a stream
pub async fn collect(stream: SendableRecordBatchStream) -> Result<Vec<RecordBatch>> {
    stream.try_collect::<Vec<_>>().await
}

/// Recursively builds a list of record batches from an iterator of
/// streams, preserving order.
pub async fn collect_all(
    streams: Vec<SendableRecordBatchStream>,
) -> Result<Vec<RecordBatch>> {
    let mut batches = vec![];
    for stream in streams {
        batches.extend(collect(stream).await?);
    }
    Ok(batches)
}
