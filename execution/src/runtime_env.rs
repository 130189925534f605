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

//! Execution [`RuntimeEnv`] environment that manages access to memory and
//! disk across executions.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use grace_common::Result;

use crate::disk_manager::{DiskManager, DiskManagerConfig};
use crate::memory_pool::{GreedyMemoryPool, MemoryPool, UnboundedMemoryPool};

/// Execution runtime environment that holds the resources shared by the
/// operators of one or more queries: a [`MemoryPool`] and a [`DiskManager`].
pub struct RuntimeEnv {
    /// Runtime memory management
    pub memory_pool: Arc<dyn MemoryPool>,
    /// Manage temporary files during query execution
    pub disk_manager: Arc<DiskManager>,
}

impl Debug for RuntimeEnv {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "RuntimeEnv")
    }
}

impl RuntimeEnv {
    /// Create an execution runtime environment from the configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let RuntimeConfig {
            memory_pool,
            disk_manager,
        } = config;

        let memory_pool =
            memory_pool.unwrap_or_else(|| Arc::new(UnboundedMemoryPool::default()));

        Ok(Self {
            memory_pool,
            disk_manager: DiskManager::try_new(disk_manager)?,
        })
    }
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        RuntimeEnv::new(RuntimeConfig::new()).unwrap()
    }
}

/// Execution runtime configuration
#[derive(Clone)]
pub struct RuntimeConfig {
    /// DiskManager to manage temporary disk file usage
    pub disk_manager: DiskManagerConfig,
    /// [`MemoryPool`] from which to allocate memory
    ///
    /// Defaults to using an [`UnboundedMemoryPool`] if `None`
    pub memory_pool: Option<Arc<dyn MemoryPool>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            disk_manager: DiskManagerConfig::default(),
            memory_pool: None,
        }
    }
}

impl RuntimeConfig {
    /// New with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Customize disk manager
    pub fn with_disk_manager(mut self, disk_manager: DiskManagerConfig) -> Self {
        self.disk_manager = disk_manager;
        self
    }

    /// Customize memory policy
    pub fn with_memory_pool(mut self, memory_pool: Arc<dyn MemoryPool>) -> Self {
        self.memory_pool = Some(memory_pool);
        self
    }

    /// Specify the total memory to use while running the query via a
    /// [`GreedyMemoryPool`]
    ///
    /// `memory_fraction` is the fraction of `max_memory` the pool may
    /// actually hand out, leaving headroom for untracked allocations.
    pub fn with_memory_limit(self, max_memory: usize, memory_fraction: f64) -> Self {
        let budget = (max_memory as f64 * memory_fraction) as usize;
        self.with_memory_pool(Arc::new(GreedyMemoryPool::new(budget)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_is_unbounded() {
        let env = RuntimeEnv::default();
        assert_eq!(env.memory_pool.reserved(), 0);
        assert!(env.disk_manager.tmp_files_enabled());
    }

    #[test]
    fn memory_limit_creates_bounded_pool() {
        let env =
            RuntimeEnv::new(RuntimeConfig::new().with_memory_limit(1000, 0.5)).unwrap();
        let mut r = crate::memory_pool::MemoryConsumer::new("t")
            .register(&env.memory_pool);
        assert!(r.try_grow(500).is_ok());
        assert!(r.try_grow(1).is_err());
    }
}
