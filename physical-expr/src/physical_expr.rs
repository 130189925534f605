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

use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use grace_common::{Result, ScalarValue};

/// The result of evaluating a [`PhysicalExpr`]: either a full column or a
/// single value standing for every row.
#[derive(Clone, Debug)]
pub enum ColumnarValue {
    /// Array of values, one per input row
    Array(ArrayRef),
    /// A single value that applies to all rows
    Scalar(ScalarValue),
}

impl ColumnarValue {
    /// Data type of the contained value.
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnarValue::Array(array) => array.data_type().clone(),
            ColumnarValue::Scalar(scalar) => scalar.data_type(),
        }
    }

    /// Convert into an array of `num_rows` rows, expanding a scalar as
    /// needed.
    pub fn into_array(self, num_rows: usize) -> Result<ArrayRef> {
        Ok(match self {
            ColumnarValue::Array(array) => array,
            ColumnarValue::Scalar(scalar) => scalar.to_array_of_size(num_rows),
        })
    }
}

/// Expression that can be evaluated against a [`RecordBatch`].
pub trait PhysicalExpr: Send + Sync + Display + Debug {
    /// Return a reference to Any that can be used for downcasting
    fn as_any(&self) -> &dyn Any;

    /// The [`DataType`] this expression evaluates to, given the input schema.
    fn data_type(&self, input_schema: &Schema) -> Result<DataType>;

    /// Whether this expression may evaluate to null, given the input schema.
    fn nullable(&self, input_schema: &Schema) -> Result<bool>;

    /// Evaluate the expression against a batch.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ColumnarValue>;
}

/// Shared reference to a [`PhysicalExpr`].
pub type PhysicalExprRef = Arc<dyn PhysicalExpr>;
