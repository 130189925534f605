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

//! Join related functionality used by the join operators

use std::ops::Range;
use std::sync::Arc;

use arrow::array::{
    downcast_array, new_null_array, Array, ArrayRef, BooleanArray, BooleanBufferBuilder,
    RecordBatchOptions, UInt32Array, UInt32Builder, UInt64Array,
};
use arrow::compute::{self, kernels::boolean::and, kernels::cmp::eq};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use grace_common::{internal_err, plan_err, JoinSide, JoinType, Result};
use grace_physical_expr::PhysicalExprRef;

use crate::metrics::{Count, ExecutionPlanMetricsSet, Gauge, MetricBuilder, Time};

/// The on clause of the join, as vector of (left, right) key expressions.
pub type JoinOn = Vec<(PhysicalExprRef, PhysicalExprRef)>;
/// Reference for JoinOn.
pub type JoinOnRef<'a> = &'a [(PhysicalExprRef, PhysicalExprRef)];

/// Checks whether the schemas "left" and "right" and columns "on" represent a
/// valid join: at least one equality key, with matching types on both sides.
pub fn check_join_is_valid(left: &Schema, right: &Schema, on: JoinOnRef) -> Result<()> {
    if on.is_empty() {
        return plan_err!("A hash join requires at least one equality key pair");
    }
    for (left_expr, right_expr) in on {
        let left_type = left_expr.data_type(left)?;
        let right_type = right_expr.data_type(right)?;
        if left_type != right_type {
            return plan_err!(
                "Join key data types must match: {left_expr} is {left_type}, \
                 {right_expr} is {right_type}"
            );
        }
    }
    Ok(())
}

/// Information about the index and placement (left or right) of the columns
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnIndex {
    /// Index of the column
    pub index: usize,
    /// Whether the column is at the left or right side
    pub side: JoinSide,
}

/// Filter applied before join output. The filter expression is evaluated over
/// an intermediate batch assembled from the referenced columns of both sides.
#[derive(Debug, Clone)]
pub struct JoinFilter {
    /// Filter expression
    expression: PhysicalExprRef,
    /// Column indices required to construct intermediate batch for filtering
    column_indices: Vec<ColumnIndex>,
    /// Physical schema of intermediate batch
    schema: Schema,
}

impl JoinFilter {
    /// Creates new JoinFilter
    pub fn new(
        expression: PhysicalExprRef,
        column_indices: Vec<ColumnIndex>,
        schema: Schema,
    ) -> JoinFilter {
        JoinFilter {
            expression,
            column_indices,
            schema,
        }
    }

    /// Helper for building ColumnIndex vector from left and right indices
    pub fn build_column_indices(
        left_indices: Vec<usize>,
        right_indices: Vec<usize>,
    ) -> Vec<ColumnIndex> {
        left_indices
            .into_iter()
            .map(|i| ColumnIndex {
                index: i,
                side: JoinSide::Left,
            })
            .chain(right_indices.into_iter().map(|i| ColumnIndex {
                index: i,
                side: JoinSide::Right,
            }))
            .collect()
    }

    /// Filter expression
    pub fn expression(&self) -> &PhysicalExprRef {
        &self.expression
    }

    /// Column indices for intermediate batch creation
    pub fn column_indices(&self) -> &[ColumnIndex] {
        &self.column_indices
    }

    /// Intermediate batch schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Returns the output field given the input field. Outer joins may
/// insert nulls even if the input was not null
fn output_join_field(old_field: &Field, join_type: &JoinType, is_left: bool) -> Field {
    let force_nullable = match join_type {
        JoinType::Inner => false,
        JoinType::Left => !is_left, // right input is padded with nulls
        JoinType::Right => is_left, // left input is padded with nulls
        JoinType::Full => true,     // both inputs can be padded with nulls
        JoinType::LeftSemi => false,
        JoinType::RightSemi => false,
        JoinType::LeftAnti => false,
        JoinType::RightAnti => false,
        JoinType::NullAwareAnti => false,
    };

    if force_nullable {
        old_field.clone().with_nullable(true)
    } else {
        old_field.clone()
    }
}

/// Creates a schema for a join operation.
/// The fields from the left side are first
pub fn build_join_schema(
    left: &Schema,
    right: &Schema,
    join_type: &JoinType,
) -> (Schema, Vec<ColumnIndex>) {
    let (fields, column_indices): (Vec<Field>, Vec<ColumnIndex>) = match join_type {
        JoinType::Inner | JoinType::Left | JoinType::Right | JoinType::Full => {
            let left_fields = left
                .fields()
                .iter()
                .map(|f| output_join_field(f, join_type, true))
                .enumerate()
                .map(|(index, f)| {
                    (
                        f,
                        ColumnIndex {
                            index,
                            side: JoinSide::Left,
                        },
                    )
                });
            let right_fields = right
                .fields()
                .iter()
                .map(|f| output_join_field(f, join_type, false))
                .enumerate()
                .map(|(index, f)| {
                    (
                        f,
                        ColumnIndex {
                            index,
                            side: JoinSide::Right,
                        },
                    )
                });

            // left then right
            left_fields.chain(right_fields).unzip()
        }
        JoinType::LeftSemi | JoinType::LeftAnti => left
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .enumerate()
            .map(|(index, f)| {
                (
                    f,
                    ColumnIndex {
                        index,
                        side: JoinSide::Left,
                    },
                )
            })
            .unzip(),
        JoinType::RightSemi | JoinType::RightAnti | JoinType::NullAwareAnti => right
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .enumerate()
            .map(|(index, f)| {
                (
                    f,
                    ColumnIndex {
                        index,
                        side: JoinSide::Right,
                    },
                )
            })
            .unzip(),
    };

    (Schema::new(fields), column_indices)
}

/// Some join types need to maintain a bitmap of matched build-side rows and
/// use the bitmap to produce the remainder of the join output once the probe
/// side is exhausted.
///
/// For example for the `Left` join, every probed batch produces the matched
/// result directly, but the unmatched build rows can only be emitted after
/// the last probe row has been seen.
pub(crate) fn need_produce_result_in_final(join_type: JoinType) -> bool {
    matches!(
        join_type,
        JoinType::Left | JoinType::LeftAnti | JoinType::LeftSemi | JoinType::Full
    )
}

/// At the end of a partition's probe pass, use the bitmap of matched build
/// indices to produce the final build-side output for `range` of the build
/// rows.
///
/// For example:
///
/// 1. `matched_bitmap`: `[true, false, true, true, false]`
/// 2. `join_type`: `Left`
///
/// The result is `([1, 4], [null, null])`.
pub(crate) fn get_final_indices_from_bit_map_range(
    matched_bitmap: &BooleanBufferBuilder,
    join_type: JoinType,
    range: Range<usize>,
) -> (UInt64Array, UInt32Array) {
    let build_indices = if join_type == JoinType::LeftSemi {
        range
            .filter_map(|idx| (matched_bitmap.get_bit(idx)).then_some(idx as u64))
            .collect::<UInt64Array>()
    } else {
        // just for `Left`, `LeftAnti` and `Full` join
        // `LeftAnti`, `Left` and `Full` will produce the unmatched build row finally
        range
            .filter_map(|idx| (!matched_bitmap.get_bit(idx)).then_some(idx as u64))
            .collect::<UInt64Array>()
    };
    // all the elements on the probe side are None
    let mut builder = UInt32Builder::with_capacity(build_indices.len());
    builder.append_nulls(build_indices.len());
    let probe_indices = builder.finish();
    (build_indices, probe_indices)
}

/// Evaluate the join filter on the candidate `(build, probe)` index pairs and
/// return the pairs that passed.
pub(crate) fn apply_join_filter_to_indices(
    build_input_buffer: &RecordBatch,
    probe_batch: &RecordBatch,
    build_indices: UInt64Array,
    probe_indices: UInt32Array,
    filter: &JoinFilter,
    build_side: JoinSide,
) -> Result<(UInt64Array, UInt32Array)> {
    if build_indices.is_empty() && probe_indices.is_empty() {
        return Ok((build_indices, probe_indices));
    };

    let intermediate_batch = build_batch_from_indices(
        filter.schema(),
        build_input_buffer,
        probe_batch,
        &build_indices,
        &probe_indices,
        filter.column_indices(),
        build_side,
    )?;
    let filter_result = filter
        .expression()
        .evaluate(&intermediate_batch)?
        .into_array(intermediate_batch.num_rows())?;
    let mask = as_boolean_array(&filter_result)?;

    let left_filtered = compute::filter(&build_indices, mask)?;
    let right_filtered = compute::filter(&probe_indices, mask)?;
    Ok((
        downcast_array(left_filtered.as_ref()),
        downcast_array(right_filtered.as_ref()),
    ))
}

fn as_boolean_array(array: &ArrayRef) -> Result<&BooleanArray> {
    match array.as_any().downcast_ref::<BooleanArray>() {
        Some(boolean) => Ok(boolean),
        None => internal_err!(
            "Join filter did not evaluate to a boolean array, got {}",
            array.data_type()
        ),
    }
}

/// Returns a new [RecordBatch] by combining the `build` and `probe` sides
/// according to `indices`. The resulting batch has [Schema] `schema`.
pub(crate) fn build_batch_from_indices(
    schema: &Schema,
    build_input_buffer: &RecordBatch,
    probe_batch: &RecordBatch,
    build_indices: &UInt64Array,
    probe_indices: &UInt32Array,
    column_indices: &[ColumnIndex],
    build_side: JoinSide,
) -> Result<RecordBatch> {
    if schema.fields().is_empty() {
        let options = RecordBatchOptions::new()
            .with_match_field_names(true)
            .with_row_count(Some(build_indices.len()));

        return Ok(RecordBatch::try_new_with_options(
            Arc::new(schema.clone()),
            vec![],
            &options,
        )?);
    }

    // build the columns of the new [RecordBatch]:
    // 1. pick whether the column is from the build or the probe side
    // 2. based on the pick, `take` items from the different RecordBatches
    let mut columns: Vec<Arc<dyn Array>> = Vec::with_capacity(schema.fields().len());

    for column_index in column_indices {
        let array = if column_index.side == build_side {
            let array = build_input_buffer.column(column_index.index);
            if array.is_empty() || build_indices.null_count() == build_indices.len() {
                // Outer join would generate a null index when finding no match at our side.
                // Therefore, it's possible we are empty but need to populate an n-length null array,
                // where n is the length of the index array.
                assert_eq!(build_indices.null_count(), build_indices.len());
                new_null_array(array.data_type(), build_indices.len())
            } else {
                compute::take(array.as_ref(), build_indices, None)?
            }
        } else {
            let array = probe_batch.column(column_index.index);
            if array.is_empty() || probe_indices.null_count() == probe_indices.len() {
                assert_eq!(probe_indices.null_count(), probe_indices.len());
                new_null_array(array.data_type(), probe_indices.len())
            } else {
                compute::take(array.as_ref(), probe_indices, None)?
            }
        };
        columns.push(array);
    }
    Ok(RecordBatch::try_new(Arc::new(schema.clone()), columns)?)
}

/// Take `indices` rows of `batch`, producing a new batch with the same
/// schema.
pub(crate) fn take_record_batch(
    batch: &RecordBatch,
    indices: &UInt32Array,
) -> Result<RecordBatch> {
    let columns = batch
        .columns()
        .iter()
        .map(|c| compute::take(c.as_ref(), indices, None).map_err(Into::into))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new_with_options(
        batch.schema(),
        columns,
        &RecordBatchOptions::new().with_row_count(Some(indices.len())),
    )
    .map_err(Into::into)
}

/// Returns a mask with one bit per row of `key_arrays`, set when any of the
/// key columns is NULL for that row.
pub(crate) fn keys_null_mask(key_arrays: &[ArrayRef], num_rows: usize) -> Result<BooleanArray> {
    let mut mask = BooleanArray::from(vec![false; num_rows]);
    for key in key_arrays {
        if key.null_count() > 0 {
            mask = compute::kernels::boolean::or(&mask, &compute::is_null(key.as_ref())?)?;
        }
    }
    Ok(mask)
}

/// After a hash lookup, verify that the keys of the candidate pairs are
/// actually equal (discarding hash collisions). NULL keys compare as not
/// equal.
pub(crate) fn equal_rows_arr(
    indices_left: &UInt64Array,
    indices_right: &UInt32Array,
    left_arrays: &[ArrayRef],
    right_arrays: &[ArrayRef],
) -> Result<(UInt64Array, UInt32Array)> {
    if indices_left.is_empty() {
        return Ok((indices_left.clone(), indices_right.clone()));
    }

    let mut iter = left_arrays.iter().zip(right_arrays.iter());

    let (first_left, first_right) = iter
        .next()
        .ok_or_else(|| grace_common::internal_grace_err!("join keys should not be empty"))?;

    let arr_left = compute::take(first_left.as_ref(), indices_left, None)?;
    let arr_right = compute::take(first_right.as_ref(), indices_right, None)?;

    let mut equal: BooleanArray = eq(&arr_left, &arr_right)?;

    // Use map and try_fold to iterate over the remaining pairs of arrays.
    // In some cases at least one of the fold can be skipped.
    // This requires a null-propagating `and` so that a NULL key comparison
    // never survives the filter below.
    equal = iter
        .map(|(left, right)| {
            let arr_left = compute::take(left.as_ref(), indices_left, None)?;
            let arr_right = compute::take(right.as_ref(), indices_right, None)?;
            eq(&arr_left, &arr_right)
        })
        .try_fold(equal, |acc, equal2| and(&acc, &equal2?))?;

    let filter_builder = compute::FilterBuilder::new(&equal).optimize().build();

    let left_filtered = filter_builder.filter(indices_left)?;
    let right_filtered = filter_builder.filter(indices_right)?;

    Ok((
        downcast_array(left_filtered.as_ref()),
        downcast_array(right_filtered.as_ref()),
    ))
}

/// Matched and deduplicated probe indices within `range`.
///
/// `carried_matched` marks a probe row whose duplicate chain was interrupted
/// by an earlier output chunk after producing matches; it counts as matched
/// even if this chunk contributed none.
pub(crate) fn get_semi_indices(
    range: Range<usize>,
    input_indices: &UInt32Array,
    carried_matched: Option<usize>,
) -> UInt32Array {
    let bitmap = matched_bitmap_in_range(&range, input_indices, carried_matched);
    range
        .clone()
        .filter_map(|idx| (bitmap.get_bit(idx - range.start)).then_some(idx as u32))
        .collect::<UInt32Array>()
}

/// Unmatched and deduplicated probe indices within `range`; see
/// [`get_semi_indices`] for the meaning of `carried_matched`.
pub(crate) fn get_anti_indices(
    range: Range<usize>,
    input_indices: &UInt32Array,
    carried_matched: Option<usize>,
) -> UInt32Array {
    let bitmap = matched_bitmap_in_range(&range, input_indices, carried_matched);
    range
        .clone()
        .filter_map(|idx| (!bitmap.get_bit(idx - range.start)).then_some(idx as u32))
        .collect::<UInt32Array>()
}

fn matched_bitmap_in_range(
    range: &Range<usize>,
    input_indices: &UInt32Array,
    carried_matched: Option<usize>,
) -> BooleanBufferBuilder {
    let mut bitmap = BooleanBufferBuilder::new(range.len());
    bitmap.append_n(range.len(), false);
    input_indices
        .iter()
        .flatten()
        .map(|v| v as usize)
        .filter(|v| range.contains(v))
        .for_each(|v| {
            bitmap.set_bit(v - range.start, true);
        });
    if let Some(carried) = carried_matched {
        if range.contains(&carried) {
            bitmap.set_bit(carried - range.start, true);
        }
    }
    bitmap
}

/// Appends probe indices in `appended_probe_indices` (which found no matching
/// build row) to the matched pairs, padding the build side with nulls.
pub(crate) fn append_probe_indices_in_order(
    build_indices: UInt64Array,
    probe_indices: UInt32Array,
    appended_probe_indices: UInt32Array,
) -> (UInt64Array, UInt32Array) {
    if appended_probe_indices.is_empty() {
        return (build_indices, probe_indices);
    }
    let unmatched_size = appended_probe_indices.len();
    // the new build indices: build_indices + null array
    // the new probe indices: probe_indices + appended_probe_indices
    let new_build_indices = build_indices
        .iter()
        .chain(std::iter::repeat(None).take(unmatched_size))
        .collect::<UInt64Array>();
    let new_probe_indices = probe_indices
        .iter()
        .chain(appended_probe_indices.iter())
        .collect::<UInt32Array>();
    (new_build_indices, new_probe_indices)
}

/// Metrics for build & probe joins
#[derive(Clone, Debug)]
pub(crate) struct BuildProbeJoinMetrics {
    /// Total time for collecting build-side of join
    pub(crate) build_time: Time,
    /// Number of batches consumed by build-side
    pub(crate) build_input_batches: Count,
    /// Number of rows consumed by build-side
    pub(crate) build_input_rows: Count,
    /// Memory used by build-side in bytes
    pub(crate) build_mem_used: Gauge,
    /// Total time for joining probe-side batches to the build-side batches
    pub(crate) join_time: Time,
    /// Number of batches consumed by probe-side of this operator
    pub(crate) input_batches: Count,
    /// Number of rows consumed by probe-side this operator
    pub(crate) input_rows: Count,
    /// Number of batches produced by this operator
    pub(crate) output_batches: Count,
    /// Number of rows produced by this operator
    pub(crate) output_rows: Count,
}

impl BuildProbeJoinMetrics {
    pub fn new(partition: usize, metrics: &ExecutionPlanMetricsSet) -> Self {
        let join_time = MetricBuilder::new(metrics).subset_time("join_time", partition);

        let build_time = MetricBuilder::new(metrics).subset_time("build_time", partition);

        let build_input_batches =
            MetricBuilder::new(metrics).counter("build_input_batches", partition);

        let build_input_rows =
            MetricBuilder::new(metrics).counter("build_input_rows", partition);

        let build_mem_used =
            MetricBuilder::new(metrics).gauge("build_mem_used", partition);

        let input_batches =
            MetricBuilder::new(metrics).counter("input_batches", partition);

        let input_rows = MetricBuilder::new(metrics).counter("input_rows", partition);

        let output_batches =
            MetricBuilder::new(metrics).counter("output_batches", partition);

        let output_rows = MetricBuilder::new(metrics).output_rows(partition);

        Self {
            build_time,
            build_input_batches,
            build_input_rows,
            build_mem_used,
            join_time,
            input_batches,
            input_rows,
            output_batches,
            output_rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Int32Array;
    use arrow::datatypes::DataType;

    use super::*;

    fn schema_ab() -> (Schema, Schema) {
        (
            Schema::new(vec![Field::new("a", DataType::Int32, false)]),
            Schema::new(vec![Field::new("b", DataType::Int32, false)]),
        )
    }

    #[test]
    fn join_schema_outer_nullability() {
        let (left, right) = schema_ab();

        let (schema, indices) = build_join_schema(&left, &right, &JoinType::Left);
        assert_eq!(schema.fields().len(), 2);
        assert!(!schema.field(0).is_nullable());
        assert!(schema.field(1).is_nullable());
        assert_eq!(indices[1].side, JoinSide::Right);

        let (schema, _) = build_join_schema(&left, &right, &JoinType::Full);
        assert!(schema.field(0).is_nullable());
        assert!(schema.field(1).is_nullable());
    }

    #[test]
    fn join_schema_single_sided() {
        let (left, right) = schema_ab();

        let (schema, _) = build_join_schema(&left, &right, &JoinType::LeftSemi);
        assert_eq!(schema.field(0).name(), "a");
        assert_eq!(schema.fields().len(), 1);

        let (schema, _) = build_join_schema(&left, &right, &JoinType::NullAwareAnti);
        assert_eq!(schema.field(0).name(), "b");
        assert_eq!(schema.fields().len(), 1);
    }

    #[test]
    fn semi_anti_indices_with_carry() {
        // probe rows 0..5, matches for rows 1 (twice) and 3
        let matched = UInt32Array::from(vec![1, 1, 3]);

        let semi = get_semi_indices(0..5, &matched, None);
        assert_eq!(semi, UInt32Array::from(vec![1, 3]));

        let anti = get_anti_indices(0..5, &matched, None);
        assert_eq!(anti, UInt32Array::from(vec![0, 2, 4]));

        // row 0 matched in a previous chunk
        let semi = get_semi_indices(0..5, &matched, Some(0));
        assert_eq!(semi, UInt32Array::from(vec![0, 1, 3]));
        let anti = get_anti_indices(0..5, &matched, Some(0));
        assert_eq!(anti, UInt32Array::from(vec![2, 4]));

        // stale carry outside the range is ignored
        let anti = get_anti_indices(2..5, &matched, Some(0));
        assert_eq!(anti, UInt32Array::from(vec![2, 4]));
    }

    #[test]
    fn equal_rows_filters_hash_collisions() -> Result<()> {
        let left: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3]));
        let right: ArrayRef = Arc::new(Int32Array::from(vec![2, 2]));

        // candidate pairs: (0,0), (1,0), (2,1)
        let build = UInt64Array::from(vec![0, 1, 2]);
        let probe = UInt32Array::from(vec![0, 0, 1]);

        let (build, probe) =
            equal_rows_arr(&build, &probe, &[left], &[right])?;
        assert_eq!(build, UInt64Array::from(vec![1]));
        assert_eq!(probe, UInt32Array::from(vec![0]));
        Ok(())
    }

    #[test]
    fn equal_rows_null_keys_never_match() -> Result<()> {
        let left: ArrayRef = Arc::new(Int32Array::from(vec![None, Some(2)]));
        let right: ArrayRef = Arc::new(Int32Array::from(vec![None, Some(2)]));

        let build = UInt64Array::from(vec![0, 1]);
        let probe = UInt32Array::from(vec![0, 1]);

        let (build, probe) = equal_rows_arr(&build, &probe, &[left], &[right])?;
        assert_eq!(build, UInt64Array::from(vec![1]));
        assert_eq!(probe, UInt32Array::from(vec![1]));
        Ok(())
    }

    #[test]
    fn null_mask_over_keys() -> Result<()> {
        let a: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3)]));
        let b: ArrayRef = Arc::new(Int32Array::from(vec![None, Some(2), Some(3)]));
        let mask = keys_null_mask(&[a, b], 3)?;
        assert_eq!(
            mask.iter().collect::<Vec<_>>(),
            vec![Some(true), Some(true), Some(false)]
        );
        Ok(())
    }
}
