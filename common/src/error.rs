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

//! [`GraceError`] and [`Result`], the error types used throughout the crates.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

use arrow::error::ArrowError;

/// Result type used throughout the grace crates.
pub type Result<T, E = GraceError> = result::Result<T, E>;

/// Error type for all operations in this workspace.
#[derive(Debug)]
pub enum GraceError {
    /// Error returned by arrow.
    ArrowError(ArrowError),
    /// Error when an I/O operation fails, e.g. on a spill file.
    IoError(io::Error),
    /// Error when a feature is not yet implemented.
    NotImplemented(String),
    /// Error due to bugs: an internal invariant did not hold. This should not
    /// happen in normal usage and most likely indicates a bug worth a report
    /// in the issue tracker.
    Internal(String),
    /// Error when an operator is constructed from invalid inputs, for example
    /// a join without equality keys.
    Plan(String),
    /// Error during execution.
    Execution(String),
    /// Error when a memory or disk budget was exceeded and spilling could not
    /// reclaim enough resources to continue.
    ResourcesExhausted(String),
    /// The runtime context was cancelled; execution stopped at a batch
    /// boundary.
    Cancelled,
}

impl From<ArrowError> for GraceError {
    fn from(e: ArrowError) -> Self {
        GraceError::ArrowError(e)
    }
}

impl From<io::Error> for GraceError {
    fn from(e: io::Error) -> Self {
        GraceError::IoError(e)
    }
}

impl From<GraceError> for ArrowError {
    fn from(e: GraceError) -> Self {
        ArrowError::ExternalError(Box::new(e))
    }
}

impl Display for GraceError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GraceError::ArrowError(desc) => write!(f, "Arrow error: {desc}"),
            GraceError::IoError(desc) => write!(f, "IO error: {desc}"),
            GraceError::NotImplemented(desc) => {
                write!(f, "This feature is not implemented: {desc}")
            }
            GraceError::Internal(desc) => {
                write!(
                    f,
                    "Internal error: {desc}.\nThis was likely caused by a bug \
                     and we would welcome that you file a bug report in our \
                     issue tracker"
                )
            }
            GraceError::Plan(desc) => write!(f, "Error during planning: {desc}"),
            GraceError::Execution(desc) => write!(f, "Execution error: {desc}"),
            GraceError::ResourcesExhausted(desc) => {
                write!(f, "Resources exhausted: {desc}")
            }
            GraceError::Cancelled => write!(f, "Execution cancelled"),
        }
    }
}

impl Error for GraceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GraceError::ArrowError(e) => Some(e),
            GraceError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

/// Macro wrapping a message with `GraceError::Internal`.
#[macro_export]
macro_rules! internal_grace_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::GraceError::Internal(format!($($args),*))
    }
}

/// Macro wrapping a message with `Err(GraceError::Internal)`.
#[macro_export]
macro_rules! internal_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::internal_grace_err!($($args),*))
    }
}

/// Macro wrapping a message with `GraceError::Execution`.
#[macro_export]
macro_rules! exec_grace_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::GraceError::Execution(format!($($args),*))
    }
}

/// Macro wrapping a message with `Err(GraceError::Execution)`.
#[macro_export]
macro_rules! exec_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::exec_grace_err!($($args),*))
    }
}

/// Macro wrapping a message with `GraceError::Plan`.
#[macro_export]
macro_rules! plan_grace_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::GraceError::Plan(format!($($args),*))
    }
}

/// Macro wrapping a message with `Err(GraceError::Plan)`.
#[macro_export]
macro_rules! plan_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::plan_grace_err!($($args),*))
    }
}

/// Macro wrapping a message with `GraceError::NotImplemented`.
#[macro_export]
macro_rules! not_impl_grace_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::GraceError::NotImplemented(format!($($args),*))
    }
}

/// Macro wrapping a message with `Err(GraceError::NotImplemented)`.
#[macro_export]
macro_rules! not_impl_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::not_impl_grace_err!($($args),*))
    }
}

/// Macro wrapping a message with `GraceError::ResourcesExhausted`.
#[macro_export]
macro_rules! resources_grace_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::GraceError::ResourcesExhausted(format!($($args),*))
    }
}

/// Macro wrapping a message with `Err(GraceError::ResourcesExhausted)`.
#[macro_export]
macro_rules! resources_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::resources_grace_err!($($args),*))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = GraceError::ResourcesExhausted("out of budget".to_string());
        assert_eq!(e.to_string(), "Resources exhausted: out of budget");

        let e = GraceError::Cancelled;
        assert_eq!(e.to_string(), "Execution cancelled");
    }

    #[test]
    fn error_macros() {
        let res: Result<()> = exec_err!("bad {}", "thing");
        let err = res.unwrap_err();
        assert_eq!(err.to_string(), "Execution error: bad thing");

        let err = internal_grace_err!("broken invariant");
        assert!(matches!(err, GraceError::Internal(_)));
    }

    #[test]
    fn arrow_error_roundtrip() {
        let arrow_err = ArrowError::ComputeError("nope".to_string());
        let err: GraceError = arrow_err.into();
        assert!(err.source().is_some());
    }
}
