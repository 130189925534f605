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

//! Functionality used to hash Arrow arrays into 64-bit hash values, one value
//! per row.

use std::hash::BuildHasher;

use ahash::RandomState;
use arrow::array::{
    Array, ArrayAccessor, ArrayRef, AsArray, BooleanArray, PrimitiveArray,
};
use arrow::datatypes::{
    ArrowPrimitiveType, DataType, Date32Type, Date64Type, Float32Type, Float64Type,
    Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type, UInt32Type, UInt64Type,
    UInt8Type,
};

use crate::error::Result;

/// Combines two hash values into one.
#[inline]
fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}

/// Types hashable as a single row value.
///
/// Floats hash by bit pattern so that hashing is deterministic and total.
pub trait HashValue {
    fn hash_one(&self, state: &RandomState) -> u64;
}

macro_rules! hash_value {
    ($($t:ty),+) => {
        $(impl HashValue for $t {
            fn hash_one(&self, state: &RandomState) -> u64 {
                state.hash_one(self)
            }
        })+
    };
}
hash_value!(i8, i16, i32, i64, u8, u16, u32, u64, bool, str, [u8]);
hash_value!(&str, &[u8]);

macro_rules! hash_float_value {
    ($(($t:ty, $i:ty)),+) => {
        $(impl HashValue for $t {
            fn hash_one(&self, state: &RandomState) -> u64 {
                state.hash_one(<$i>::from_ne_bytes(self.to_ne_bytes()))
            }
        })+
    };
}
hash_float_value!((f32, u32), (f64, u64));

fn hash_array_primitive<T>(
    array: &PrimitiveArray<T>,
    random_state: &RandomState,
    hashes_buffer: &mut [u64],
    rehash: bool,
) where
    T: ArrowPrimitiveType,
    <T as ArrowPrimitiveType>::Native: HashValue,
{
    if array.null_count() == 0 {
        if rehash {
            for (hash, value) in hashes_buffer.iter_mut().zip(array.values().iter()) {
                *hash = combine_hashes(value.hash_one(random_state), *hash);
            }
        } else {
            for (hash, value) in hashes_buffer.iter_mut().zip(array.values().iter()) {
                *hash = value.hash_one(random_state);
            }
        }
    } else if rehash {
        for (i, hash) in hashes_buffer.iter_mut().enumerate() {
            if !array.is_null(i) {
                *hash = combine_hashes(array.value(i).hash_one(random_state), *hash);
            }
        }
    } else {
        for (i, hash) in hashes_buffer.iter_mut().enumerate() {
            if !array.is_null(i) {
                *hash = array.value(i).hash_one(random_state);
            }
        }
    }
}

fn hash_array<T>(
    array: T,
    random_state: &RandomState,
    hashes_buffer: &mut [u64],
    rehash: bool,
) where
    T: ArrayAccessor,
    T::Item: HashValue,
{
    if array.null_count() == 0 {
        if rehash {
            for (i, hash) in hashes_buffer.iter_mut().enumerate() {
                *hash =
                    combine_hashes(array.value(i).hash_one(random_state), *hash);
            }
        } else {
            for (i, hash) in hashes_buffer.iter_mut().enumerate() {
                *hash = array.value(i).hash_one(random_state);
            }
        }
    } else if rehash {
        for (i, hash) in hashes_buffer.iter_mut().enumerate() {
            if !array.is_null(i) {
                *hash = combine_hashes(array.value(i).hash_one(random_state), *hash);
            }
        }
    } else {
        for (i, hash) in hashes_buffer.iter_mut().enumerate() {
            if !array.is_null(i) {
                *hash = array.value(i).hash_one(random_state);
            }
        }
    }
}

fn hash_array_boolean(
    array: &BooleanArray,
    random_state: &RandomState,
    hashes_buffer: &mut [u64],
    rehash: bool,
) {
    for (i, hash) in hashes_buffer.iter_mut().enumerate() {
        if !array.is_null(i) {
            let value_hash = array.value(i).hash_one(random_state);
            *hash = if rehash {
                combine_hashes(value_hash, *hash)
            } else {
                value_hash
            };
        }
    }
}

/// Creates hash values for every row, based on the values in the `arrays`.
///
/// The number of rows to hash is determined by `hashes_buffer.len()`, which
/// the caller must have sized (and zeroed) to the row count of the arrays.
/// Rows whose value is NULL in a column leave the running hash unchanged for
/// that column, so a NULL in the first column hashes to the buffer's initial
/// value.
pub fn create_hashes<'a>(
    arrays: &[ArrayRef],
    random_state: &RandomState,
    hashes_buffer: &'a mut Vec<u64>,
) -> Result<&'a mut Vec<u64>> {
    for (i, col) in arrays.iter().enumerate() {
        // combine hashes with `combine_hashes` for all columns besides the
        // first
        let rehash = i >= 1;
        match col.data_type() {
            DataType::Null => {}
            DataType::Boolean => {
                hash_array_boolean(col.as_boolean(), random_state, hashes_buffer, rehash)
            }
            DataType::Int8 => hash_array_primitive(
                col.as_primitive::<Int8Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Int16 => hash_array_primitive(
                col.as_primitive::<Int16Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Int32 => hash_array_primitive(
                col.as_primitive::<Int32Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Int64 => hash_array_primitive(
                col.as_primitive::<Int64Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::UInt8 => hash_array_primitive(
                col.as_primitive::<UInt8Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::UInt16 => hash_array_primitive(
                col.as_primitive::<UInt16Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::UInt32 => hash_array_primitive(
                col.as_primitive::<UInt32Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::UInt64 => hash_array_primitive(
                col.as_primitive::<UInt64Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Float32 => hash_array_primitive(
                col.as_primitive::<Float32Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Float64 => hash_array_primitive(
                col.as_primitive::<Float64Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Date32 => hash_array_primitive(
                col.as_primitive::<Date32Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Date64 => hash_array_primitive(
                col.as_primitive::<Date64Type>(),
                random_state,
                hashes_buffer,
                rehash,
            ),
            DataType::Utf8 => {
                hash_array(col.as_string::<i32>(), random_state, hashes_buffer, rehash)
            }
            DataType::LargeUtf8 => {
                hash_array(col.as_string::<i64>(), random_state, hashes_buffer, rehash)
            }
            DataType::Binary => {
                hash_array(col.as_binary::<i32>(), random_state, hashes_buffer, rehash)
            }
            DataType::LargeBinary => {
                hash_array(col.as_binary::<i64>(), random_state, hashes_buffer, rehash)
            }
            _ => {
                return crate::not_impl_err!(
                    "Unsupported data type in hasher: {}",
                    col.data_type()
                );
            }
        }
    }
    Ok(hashes_buffer)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Float64Array, Int32Array, StringArray};

    use super::*;

    #[test]
    fn create_hashes_for_int_arrays() -> Result<()> {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 2, 4]));
        let random_state = RandomState::with_seeds(0, 0, 0, 0);
        let mut hashes = vec![0; array.len()];
        create_hashes(&[Arc::clone(&array)], &random_state, &mut hashes)?;

        // same value, same hash; distinct values, distinct hashes
        assert_eq!(hashes[1], hashes[2]);
        assert_ne!(hashes[0], hashes[1]);
        assert_ne!(hashes[0], hashes[3]);
        Ok(())
    }

    #[test]
    fn create_hashes_deterministic_across_calls() -> Result<()> {
        let array: ArrayRef = Arc::new(StringArray::from(vec!["a", "bb", "ccc"]));
        let random_state = RandomState::with_seeds(0, 0, 0, 0);
        let mut one = vec![0; 3];
        let mut two = vec![0; 3];
        create_hashes(&[Arc::clone(&array)], &random_state, &mut one)?;
        create_hashes(&[array], &random_state, &mut two)?;
        assert_eq!(one, two);
        Ok(())
    }

    #[test]
    fn create_hashes_with_nulls_leave_buffer() -> Result<()> {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3)]));
        let random_state = RandomState::with_seeds(0, 0, 0, 0);
        let mut hashes = vec![0; 3];
        create_hashes(&[array], &random_state, &mut hashes)?;
        assert_eq!(hashes[1], 0);
        assert_ne!(hashes[0], 0);
        Ok(())
    }

    #[test]
    fn create_multi_column_hashes() -> Result<()> {
        let int: ArrayRef = Arc::new(Int32Array::from(vec![1, 1, 2]));
        let float: ArrayRef = Arc::new(Float64Array::from(vec![0.5, 0.5, 0.5]));
        let random_state = RandomState::with_seeds(0, 0, 0, 0);
        let mut hashes = vec![0; 3];
        create_hashes(&[int, float], &random_state, &mut hashes)?;
        assert_eq!(hashes[0], hashes[1]);
        assert_ne!(hashes[0], hashes[2]);
        Ok(())
    }

    #[test]
    fn different_seeds_different_hashes() -> Result<()> {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![42]));
        let mut level0 = vec![0; 1];
        let mut level1 = vec![0; 1];
        create_hashes(
            &[Arc::clone(&array)],
            &RandomState::with_seeds(0, 0, 0, 0),
            &mut level0,
        )?;
        create_hashes(&[array], &RandomState::with_seeds(0, 0, 0, 1), &mut level1)?;
        assert_ne!(level0, level1);
        Ok(())
    }
}
