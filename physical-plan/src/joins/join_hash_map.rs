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

//! [`JoinHashMap`], the hash table used to store one build partition during a
//! hash join.

use std::mem::size_of;

use hashbrown::raw::RawTable;

/// Maps a `u64` hash value to a chain of build-side row indices holding that
/// hash.
///
/// Chained indices are stored 1-based so that `0` marks the end of a chain:
/// `map` stores the hash and the 1-based index of the *last* inserted row
/// with that hash, and `next[i]` stores the 1-based index of the previous row
/// in the chain of row `i` (or `0`).
///
/// ```text
/// Insert (10,1)            <-- insert hash value 10 with row index 1
/// map:
/// ----------
/// | 10 | 2 |
/// ----------
/// next:
/// ---------------------
/// | 0 | 0 | 0 | 0 | 0 |
/// ---------------------
/// Insert (10,3)            <-- collision! row index 3 has a hash value of 10 as well
/// map:
/// ----------
/// | 10 | 4 |
/// ----------
/// next:
/// ---------------------
/// | 0 | 0 | 0 | 2 | 0 |  <--- hash value 10 maps to 4,2 (which means indices values 3,1)
/// ---------------------
/// ```
pub struct JoinHashMap {
    // Stores hash value to last row index
    map: RawTable<(u64, u64)>,
    // Stores indices in chained list data structure
    next: Vec<u64>,
}

/// Offset of a partially processed probe batch within a [`JoinHashMap`]
/// lookup: the probe row index to resume at and, if that row's duplicate
/// chain was interrupted, the chain position (1-based) to continue from.
pub type JoinHashMapOffset = (usize, Option<u64>);

impl JoinHashMap {
    /// Create a map for `capacity` build rows
    pub fn with_capacity(capacity: usize) -> Self {
        JoinHashMap {
            map: RawTable::with_capacity(capacity),
            next: vec![0; capacity],
        }
    }

    /// Number of build rows inserted
    pub fn num_rows(&self) -> usize {
        self.next.len()
    }

    /// True if no build rows were inserted
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Estimated memory footprint of a map over `num_rows` rows, used to
    /// reserve memory before constructing one.
    pub fn estimate_memory_size(num_rows: usize) -> usize {
        // hashbrown resizes at 7/8 occupancy, one control byte per bucket
        let buckets = usize::max(num_rows.saturating_mul(8) / 7, 8).next_power_of_two();
        buckets * (size_of::<(u64, u64)>() + 1) + num_rows * size_of::<u64>()
    }

    /// Insert `(hash, row)` where `row` is the index of the next build row.
    ///
    /// Rows must be inserted in increasing row order starting from zero.
    pub fn insert(&mut self, row: usize, hash: u64) {
        debug_assert!(row < self.next.len());
        if let Some((_, chain_head)) = self.map.get_mut(hash, |(h, _)| *h == hash) {
            self.next[row] = *chain_head;
            *chain_head = (row + 1) as u64;
        } else {
            self.map
                .insert(hash, (hash, (row + 1) as u64), |(h, _)| *h);
            // `next[row]` stays 0, marking the end of this chain
        }
    }

    /// Look up `hash_values` (one per probe row) and collect up to `limit`
    /// matching `(probe_idx, build_idx)` pairs, resuming from `offset`.
    ///
    /// Matches are produced in increasing probe-row order; all matches for
    /// one probe row are contiguous. If the limit interrupts a duplicate
    /// chain, the returned offset resumes mid-chain, so every pair is
    /// produced exactly once across calls. Returns `None` as the offset once
    /// all probe rows have been fully traversed.
    pub fn get_matched_indices_with_limit_offset(
        &self,
        hash_values: &[u64],
        limit: usize,
        offset: JoinHashMapOffset,
    ) -> (Vec<u32>, Vec<u64>, Option<JoinHashMapOffset>) {
        let mut probe_indices: Vec<u32> = Vec::with_capacity(limit);
        let mut build_indices: Vec<u64> = Vec::with_capacity(limit);
        let mut remaining = limit;

        let (initial_idx, initial_next) = offset;

        // Finish a chain interrupted by a previous call
        let to_skip = match initial_next {
            None => initial_idx,
            // `Some(0)` means the chain was fully traversed exactly when the
            // previous limit was hit; move on to the next row
            Some(0) => initial_idx + 1,
            Some(next) => {
                let is_last = initial_idx == hash_values.len() - 1;
                if let Some(offset) = traverse_chain(
                    &self.next,
                    initial_idx,
                    next,
                    &mut remaining,
                    &mut probe_indices,
                    &mut build_indices,
                    is_last,
                ) {
                    return (probe_indices, build_indices, Some(offset));
                }
                initial_idx + 1
            }
        };

        for (row_idx, &hash) in hash_values.iter().enumerate().skip(to_skip) {
            if let Some((_, chain_head)) = self.map.get(hash, |(h, _)| *h == hash) {
                let is_last = row_idx == hash_values.len() - 1;
                if let Some(offset) = traverse_chain(
                    &self.next,
                    row_idx,
                    *chain_head,
                    &mut remaining,
                    &mut probe_indices,
                    &mut build_indices,
                    is_last,
                ) {
                    return (probe_indices, build_indices, Some(offset));
                }
            }
        }

        (probe_indices, build_indices, None)
    }
}

impl std::fmt::Debug for JoinHashMap {
    fn fmt(&self, _f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Ok(())
    }
}

/// Traverses the chain of matching indices, collecting results up to the
/// remaining limit. Returns `Some(offset)` if the limit was reached and there
/// are more results to process, or `None` if the chain was fully traversed.
#[inline(always)]
fn traverse_chain(
    next_chain: &[u64],
    probe_idx: usize,
    start_chain_idx: u64,
    remaining: &mut usize,
    probe_indices: &mut Vec<u32>,
    build_indices: &mut Vec<u64>,
    is_last_input: bool,
) -> Option<JoinHashMapOffset> {
    let mut match_row_idx = start_chain_idx - 1;

    loop {
        build_indices.push(match_row_idx);
        probe_indices.push(probe_idx as u32);
        *remaining -= 1;

        let next = next_chain[match_row_idx as usize];

        if *remaining == 0 {
            // Limit reached - return offset for next call
            return if is_last_input && next == 0 {
                // Finished processing the last input row
                None
            } else {
                Some((probe_idx, Some(next)))
            };
        }
        if next == 0 {
            // End of chain
            return None;
        }
        match_row_idx = next - 1;
    }
}
