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

//! Defines the [`JoinType`] and [`JoinSide`] types.

use std::fmt::{self, Display, Formatter};

/// Join type.
///
/// Throughout this workspace the left input of a join is the *build* side
/// (materialized into hash tables) and the right input is the *probe* side
/// (streamed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Inner Join - Returns only rows where there is a matching value in both
    /// inputs based on the join keys and filter.
    Inner,
    /// Left Join - Returns all rows from the left input and matching rows from
    /// the right input. If no match, NULL values are returned for columns from
    /// the right input.
    Left,
    /// Right Join - Returns all rows from the right input and matching rows
    /// from the left input. If no match, NULL values are returned for columns
    /// from the left input.
    Right,
    /// Full Join - Returns all rows from both inputs, matching rows where
    /// possible and filling the other side with NULL values otherwise.
    Full,
    /// Left Semi Join - Returns rows from the left input that have at least
    /// one matching row in the right input. Only left columns are returned,
    /// each row at most once.
    LeftSemi,
    /// Right Semi Join - Returns rows from the right input that have at least
    /// one matching row in the left input. Only right columns are returned,
    /// each row at most once.
    RightSemi,
    /// Left Anti Join - Returns rows from the left input that have no matching
    /// row in the right input.
    LeftAnti,
    /// Right Anti Join - Returns rows from the right input that have no
    /// matching row in the left input.
    RightAnti,
    /// Null-aware anti join, the `NOT IN` subquery variant.
    ///
    /// Returns rows from the right (probe) input for which no left (build)
    /// row matches under null-aware equality plus the residual filter. Unlike
    /// [`JoinType::RightAnti`], a NULL join key on either side counts as a
    /// potential match and therefore suppresses output: a probe row with a
    /// NULL key is suppressed by any build row that passes the filter, and
    /// any build row with a NULL key suppresses every probe row it passes the
    /// filter with.
    NullAwareAnti,
}

impl JoinType {
    /// Returns true if the join preserves unmatched rows of at least one side
    /// by padding the other side with NULLs.
    pub fn is_outer(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Right | JoinType::Full)
    }

    /// Returns true if the output contains only columns of the left (build)
    /// input.
    pub fn emits_left_only(self) -> bool {
        matches!(self, JoinType::LeftSemi | JoinType::LeftAnti)
    }

    /// Returns true if the output contains only columns of the right (probe)
    /// input.
    pub fn emits_right_only(self) -> bool {
        matches!(
            self,
            JoinType::RightSemi | JoinType::RightAnti | JoinType::NullAwareAnti
        )
    }
}

impl Display for JoinType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let join_type = match self {
            JoinType::Inner => "Inner",
            JoinType::Left => "Left",
            JoinType::Right => "Right",
            JoinType::Full => "Full",
            JoinType::LeftSemi => "LeftSemi",
            JoinType::RightSemi => "RightSemi",
            JoinType::LeftAnti => "LeftAnti",
            JoinType::RightAnti => "RightAnti",
            JoinType::NullAwareAnti => "NullAwareAnti",
        };
        write!(f, "{join_type}")
    }
}

/// Join side: distinguishes the build (left) from the probe (right) input of
/// a join when composing output columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Left side of the join (build side).
    Left,
    /// Right side of the join (probe side).
    Right,
}

impl JoinSide {
    /// Inverse of the side.
    pub fn negate(&self) -> Self {
        match self {
            JoinSide::Left => JoinSide::Right,
            JoinSide::Right => JoinSide::Left,
        }
    }
}

impl Display for JoinSide {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            JoinSide::Left => write!(f, "left"),
            JoinSide::Right => write!(f, "right"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_type_output_sides() {
        assert!(JoinType::LeftSemi.emits_left_only());
        assert!(JoinType::NullAwareAnti.emits_right_only());
        assert!(!JoinType::Full.emits_left_only());
        assert!(JoinType::Full.is_outer());
        assert!(!JoinType::Inner.is_outer());
    }

    #[test]
    fn join_side_negate() {
        assert_eq!(JoinSide::Left.negate(), JoinSide::Right);
        assert_eq!(JoinSide::Right.negate(), JoinSide::Left);
    }
}
