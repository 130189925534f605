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

//! [`TaskContext`]: the state available to operators during execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::memory_pool::MemoryPool;
use crate::runtime_env::RuntimeEnv;

/// Task execution context handed to every operator `execute` call.
///
/// Carries the session configuration, the shared [`RuntimeEnv`], and the
/// cancellation flag. Operators observe cancellation at batch boundaries and
/// stop with a cancelled status.
#[derive(Debug)]
pub struct TaskContext {
    /// Session configuration
    session_config: SessionConfig,
    /// Runtime environment associated with this task context
    runtime: Arc<RuntimeEnv>,
    /// Set once the task has been cancelled
    cancelled: AtomicBool,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            session_config: SessionConfig::new(),
            runtime: Arc::new(RuntimeEnv::default()),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl TaskContext {
    /// Create a new task context with the given configuration and runtime.
    pub fn new(session_config: SessionConfig, runtime: Arc<RuntimeEnv>) -> Self {
        Self {
            session_config,
            runtime,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Replace the runtime environment.
    pub fn with_runtime(mut self, runtime: Arc<RuntimeEnv>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Replace the session configuration.
    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    /// Session configuration for this task.
    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    /// The runtime environment.
    pub fn runtime_env(&self) -> Arc<RuntimeEnv> {
        Arc::clone(&self.runtime)
    }

    /// The memory pool of the runtime environment.
    pub fn memory_pool(&self) -> &Arc<dyn MemoryPool> {
        &self.runtime.memory_pool
    }

    /// Request cancellation; running operators observe this at their next
    /// batch boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// True once [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_flag() {
        let ctx = TaskContext::default();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }
}
