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

//! Session-level configuration options.

/// Default batch size of produced record batches.
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Configuration options for one execution session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target number of rows per output record batch.
    batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl SessionConfig {
    /// Create an execution config with default setting
    pub fn new() -> Self {
        Self::default()
    }

    /// Customize batch size. Batch size should be a positive value, and
    /// operators produce output in batches of at most this many rows.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0);
        self.batch_size = batch_size;
        self
    }

    /// Target number of rows per output record batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_configurable() {
        assert_eq!(SessionConfig::new().batch_size(), DEFAULT_BATCH_SIZE);
        assert_eq!(SessionConfig::new().with_batch_size(3).batch_size(), 3);
    }
}
