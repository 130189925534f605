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

//! Binary expression: comparisons and boolean connectives over two child
//! expressions.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray};
use arrow::compute::kernels::boolean::{and_kleene, or_kleene};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use grace_common::{internal_err, Result};

use crate::operator::Operator;
use crate::physical_expr::{ColumnarValue, PhysicalExpr, PhysicalExprRef};

/// Binary expression
#[derive(Debug, Clone)]
pub struct BinaryExpr {
    left: PhysicalExprRef,
    op: Operator,
    right: PhysicalExprRef,
}

impl BinaryExpr {
    /// Create new binary expression
    pub fn new(left: PhysicalExprRef, op: Operator, right: PhysicalExprRef) -> Self {
        Self { left, op, right }
    }

    /// Get the left side of the binary expression
    pub fn left(&self) -> &PhysicalExprRef {
        &self.left
    }

    /// Get the operator for this binary expression
    pub fn op(&self) -> &Operator {
        &self.op
    }

    /// Get the right side of the binary expression
    pub fn right(&self) -> &PhysicalExprRef {
        &self.right
    }
}

impl fmt::Display for BinaryExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op, self.right)
    }
}

fn as_boolean_array(array: &ArrayRef) -> Result<&BooleanArray> {
    match array.as_any().downcast_ref::<BooleanArray>() {
        Some(boolean) => Ok(boolean),
        None => internal_err!(
            "Expected boolean array for logical operator, got {}",
            array.data_type()
        ),
    }
}

impl PhysicalExpr for BinaryExpr {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn data_type(&self, _input_schema: &Schema) -> Result<DataType> {
        // all supported operators produce booleans
        Ok(DataType::Boolean)
    }

    fn nullable(&self, input_schema: &Schema) -> Result<bool> {
        Ok(self.left.nullable(input_schema)? || self.right.nullable(input_schema)?)
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ColumnarValue> {
        let num_rows = batch.num_rows();
        let lhs = self.left.evaluate(batch)?.into_array(num_rows)?;
        let rhs = self.right.evaluate(batch)?.into_array(num_rows)?;

        let result = match self.op {
            Operator::Eq => eq(&lhs, &rhs)?,
            Operator::NotEq => neq(&lhs, &rhs)?,
            Operator::Lt => lt(&lhs, &rhs)?,
            Operator::LtEq => lt_eq(&lhs, &rhs)?,
            Operator::Gt => gt(&lhs, &rhs)?,
            Operator::GtEq => gt_eq(&lhs, &rhs)?,
            Operator::And => and_kleene(as_boolean_array(&lhs)?, as_boolean_array(&rhs)?)?,
            Operator::Or => or_kleene(as_boolean_array(&lhs)?, as_boolean_array(&rhs)?)?,
        };
        Ok(ColumnarValue::Array(Arc::new(result)))
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, Int32Array};
    use arrow::datatypes::Field;
    use grace_common::ScalarValue;

    use super::*;
    use crate::expressions::{col, lit};

    fn test_batch() -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int32, true),
        ]));
        Ok(RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), Some(2), None])),
                Arc::new(Int32Array::from(vec![Some(1), Some(5), Some(3)])),
            ],
        )?)
    }

    #[test]
    fn comparisons() -> Result<()> {
        let batch = test_batch()?;
        let schema = batch.schema();

        let expr = BinaryExpr::new(col("a", &schema)?, Operator::Eq, col("b", &schema)?);
        let result = expr.evaluate(&batch)?.into_array(3)?;
        let result = as_boolean_array(&result)?;
        assert!(result.value(0));
        assert!(!result.value(1));
        // null compared to anything is null
        assert!(result.is_null(2));
        Ok(())
    }

    #[test]
    fn comparison_against_literal() -> Result<()> {
        let batch = test_batch()?;
        let schema = batch.schema();

        let expr = BinaryExpr::new(
            col("b", &schema)?,
            Operator::Gt,
            lit(ScalarValue::Int32(Some(2))),
        );
        let result = expr.evaluate(&batch)?.into_array(3)?;
        let result = as_boolean_array(&result)?;
        assert_eq!(
            result.iter().collect::<Vec<_>>(),
            vec![Some(false), Some(true), Some(true)]
        );
        Ok(())
    }

    #[test]
    fn and_uses_kleene_logic() -> Result<()> {
        let batch = test_batch()?;
        let schema = batch.schema();

        // (a = b) AND (b > 2): row 2 is (NULL AND true) => NULL
        let expr = BinaryExpr::new(
            Arc::new(BinaryExpr::new(
                col("a", &schema)?,
                Operator::Eq,
                col("b", &schema)?,
            )),
            Operator::And,
            Arc::new(BinaryExpr::new(
                col("b", &schema)?,
                Operator::Gt,
                lit(ScalarValue::Int32(Some(2))),
            )),
        );
        let result = expr.evaluate(&batch)?.into_array(3)?;
        let result = as_boolean_array(&result)?;
        assert_eq!(
            result.iter().collect::<Vec<_>>(),
            vec![Some(false), Some(false), None]
        );
        Ok(())
    }

    #[test]
    fn display() -> Result<()> {
        let batch = test_batch()?;
        let schema = batch.schema();
        let expr = BinaryExpr::new(col("a", &schema)?, Operator::NotEq, col("b", &schema)?);
        assert_eq!(expr.to_string(), "a@0 != b@1");
        Ok(())
    }
}
