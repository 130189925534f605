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

//! [`ScalarValue`]: a single, typed value.

use std::fmt;
use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float32Array, Float64Array,
    Int32Array, Int64Array, StringArray, UInt32Array, UInt64Array,
};
use arrow::datatypes::DataType;

use crate::error::Result;

/// A single value of a supported scalar type.
///
/// This covers the types used for join keys, literals in residual filters,
/// and tests; it is not a complete scalar type system.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// Untyped null
    Null,
    /// Boolean value
    Boolean(Option<bool>),
    /// 32bit int
    Int32(Option<i32>),
    /// 64bit int
    Int64(Option<i64>),
    /// Unsigned 32bit int
    UInt32(Option<u32>),
    /// Unsigned 64bit int
    UInt64(Option<u64>),
    /// 32bit float
    Float32(Option<f32>),
    /// 64bit float
    Float64(Option<f64>),
    /// Utf-8 encoded string
    Utf8(Option<String>),
}

macro_rules! build_array_from_option {
    ($DATA_TYPE:ident, $ARRAY_TYPE:ident, $EXPR:expr, $SIZE:expr) => {
        match $EXPR {
            Some(value) => Arc::new($ARRAY_TYPE::from_value(*value, $SIZE)),
            None => new_null_array(&DataType::$DATA_TYPE, $SIZE),
        }
    };
}

impl ScalarValue {
    /// The [`DataType`] of the value.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Null => DataType::Null,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::UInt32(_) => DataType::UInt32,
            ScalarValue::UInt64(_) => DataType::UInt64,
            ScalarValue::Float32(_) => DataType::Float32,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
        }
    }

    /// Whether this value is null.
    pub fn is_null(&self) -> bool {
        match self {
            ScalarValue::Null => true,
            ScalarValue::Boolean(v) => v.is_none(),
            ScalarValue::Int32(v) => v.is_none(),
            ScalarValue::Int64(v) => v.is_none(),
            ScalarValue::UInt32(v) => v.is_none(),
            ScalarValue::UInt64(v) => v.is_none(),
            ScalarValue::Float32(v) => v.is_none(),
            ScalarValue::Float64(v) => v.is_none(),
            ScalarValue::Utf8(v) => v.is_none(),
        }
    }

    /// Converts the value to an array of `size` repeated elements.
    pub fn to_array_of_size(&self, size: usize) -> ArrayRef {
        match self {
            ScalarValue::Null => new_null_array(&DataType::Null, size),
            ScalarValue::Boolean(e) => {
                Arc::new(BooleanArray::from(vec![*e; size])) as ArrayRef
            }
            ScalarValue::Int32(e) => {
                build_array_from_option!(Int32, Int32Array, e, size)
            }
            ScalarValue::Int64(e) => {
                build_array_from_option!(Int64, Int64Array, e, size)
            }
            ScalarValue::UInt32(e) => {
                build_array_from_option!(UInt32, UInt32Array, e, size)
            }
            ScalarValue::UInt64(e) => {
                build_array_from_option!(UInt64, UInt64Array, e, size)
            }
            ScalarValue::Float32(e) => {
                build_array_from_option!(Float32, Float32Array, e, size)
            }
            ScalarValue::Float64(e) => {
                build_array_from_option!(Float64, Float64Array, e, size)
            }
            ScalarValue::Utf8(e) => match e {
                Some(value) => {
                    Arc::new(StringArray::from(vec![value.as_str(); size])) as ArrayRef
                }
                None => new_null_array(&DataType::Utf8, size),
            },
        }
    }

    /// Converts a value in `array` at `index` into a `ScalarValue`.
    pub fn try_from_array(array: &dyn Array, index: usize) -> Result<Self> {
        macro_rules! typed_value {
            ($ARRAY_TYPE:ident, $SCALAR:ident) => {{
                let array = array
                    .as_any()
                    .downcast_ref::<$ARRAY_TYPE>()
                    .expect("array type and data type are consistent");
                match array.is_null(index) {
                    true => ScalarValue::$SCALAR(None),
                    false => ScalarValue::$SCALAR(Some(array.value(index).into())),
                }
            }};
        }

        Ok(match array.data_type() {
            DataType::Null => ScalarValue::Null,
            DataType::Boolean => typed_value!(BooleanArray, Boolean),
            DataType::Int32 => typed_value!(Int32Array, Int32),
            DataType::Int64 => typed_value!(Int64Array, Int64),
            DataType::UInt32 => typed_value!(UInt32Array, UInt32),
            DataType::UInt64 => typed_value!(UInt64Array, UInt64),
            DataType::Float32 => typed_value!(Float32Array, Float32),
            DataType::Float64 => typed_value!(Float64Array, Float64),
            DataType::Utf8 => typed_value!(StringArray, Utf8),
            other => {
                return crate::not_impl_err!("Unsupported data type for ScalarValue: {other}")
            }
        })
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        macro_rules! format_option {
            ($F:expr, $EXPR:expr) => {
                match $EXPR {
                    Some(e) => write!($F, "{e}"),
                    None => write!($F, "NULL"),
                }
            };
        }
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(e) => format_option!(f, e),
            ScalarValue::Int32(e) => format_option!(f, e),
            ScalarValue::Int64(e) => format_option!(f, e),
            ScalarValue::UInt32(e) => format_option!(f, e),
            ScalarValue::UInt64(e) => format_option!(f, e),
            ScalarValue::Float32(e) => format_option!(f, e),
            ScalarValue::Float64(e) => format_option!(f, e),
            ScalarValue::Utf8(e) => format_option!(f, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_to_array_roundtrip() -> Result<()> {
        let scalar = ScalarValue::Int32(Some(7));
        let array = scalar.to_array_of_size(3);
        assert_eq!(array.len(), 3);
        assert_eq!(ScalarValue::try_from_array(array.as_ref(), 1)?, scalar);
        Ok(())
    }

    #[test]
    fn null_scalar() -> Result<()> {
        let scalar = ScalarValue::Utf8(None);
        assert!(scalar.is_null());
        let array = scalar.to_array_of_size(2);
        assert_eq!(array.null_count(), 2);
        assert_eq!(
            ScalarValue::try_from_array(array.as_ref(), 0)?,
            ScalarValue::Utf8(None)
        );
        Ok(())
    }

    #[test]
    fn scalar_display() {
        assert_eq!(ScalarValue::Int64(Some(-1)).to_string(), "-1");
        assert_eq!(ScalarValue::Float64(None).to_string(), "NULL");
    }
}
