//! User supplied functions attached to planner nodes.
//!
//! Callbacks return a boxed error on failure. The execution engine wraps
//! these errors as operator failures and cancels the materialization.
use std::fmt;
use std::sync::Arc;

use framestore_error::{BoxError, FrameStoreError, Result};

use crate::value::{Value, ValueType};

type TransformFn = dyn Fn(&Value) -> Result<Value, BoxError> + Send + Sync;
type PredicateFn = dyn Fn(&Value) -> Result<bool, BoxError> + Send + Sync;
type RowTransformFn = dyn Fn(&[Value]) -> Result<Vec<Value>, BoxError> + Send + Sync;

/// Maps a single value to a new value.
#[derive(Clone)]
pub struct ValueTransform {
    func: Arc<TransformFn>,
}

impl ValueTransform {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        ValueTransform {
            func: Arc::new(func),
        }
    }

    /// Wrap an infallible function.
    pub fn infallible<F>(func: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::new(move |v| Ok(func(v)))
    }

    pub fn call(&self, value: &Value) -> Result<Value, BoxError> {
        (self.func)(value)
    }

    /// Compose with `next`, applying self first.
    ///
    /// The intermediate value is coerced to `intermediate` exactly as it
    /// would be if it were written to an array between the two transforms.
    pub fn then(&self, intermediate: ValueType, next: &ValueTransform) -> ValueTransform {
        let first = self.func.clone();
        let second = next.func.clone();
        ValueTransform::new(move |v| {
            let mid = first(v)?.coerce_to(intermediate)?;
            second(&mid)
        })
    }
}

impl fmt::Debug for ValueTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueTransform")
    }
}

/// Decides if a value passes a filter.
#[derive(Clone)]
pub struct ValuePredicate {
    func: Arc<PredicateFn>,
}

impl ValuePredicate {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Value) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        ValuePredicate {
            func: Arc::new(func),
        }
    }

    pub fn infallible<F>(func: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::new(move |v| Ok(func(v)))
    }

    pub fn call(&self, value: &Value) -> Result<bool, BoxError> {
        (self.func)(value)
    }
}

impl fmt::Debug for ValuePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValuePredicate")
    }
}

/// Maps an entire row to a new row.
#[derive(Clone)]
pub struct RowTransform {
    func: Arc<RowTransformFn>,
}

impl RowTransform {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, BoxError> + Send + Sync + 'static,
    {
        RowTransform {
            func: Arc::new(func),
        }
    }

    pub fn call(&self, row: &[Value]) -> Result<Vec<Value>, BoxError> {
        (self.func)(row)
    }
}

impl fmt::Debug for RowTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RowTransform")
    }
}

/// Reduces a column to a single value.
///
/// Partial states are computed independently per partition, then combined in
/// partition order.
pub trait Aggregator: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Type of the final value given the type of the input column.
    fn output_type(&self, input: ValueType) -> Result<ValueType>;

    /// Initial state.
    fn init(&self) -> Value {
        Value::Undefined
    }

    fn update(&self, state: &mut Value, value: &Value) -> Result<(), BoxError>;

    /// Merge the partial state `other` into `state`.
    fn combine(&self, state: &mut Value, other: Value) -> Result<(), BoxError>;

    fn finalize(&self, state: Value) -> Value {
        state
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Sum {
    fn add(a: &Value, b: &Value) -> Result<Value, BoxError> {
        Ok(match (a, b) {
            (Value::Undefined, v) | (v, Value::Undefined) => v.clone(),
            (Value::Integer(a), Value::Integer(b)) => Value::Integer(
                a.checked_add(*b)
                    .ok_or_else(|| format!("integer overflow adding {a} and {b}"))?,
            ),
            (a, b) => Value::Float(a.try_as_f64()? + b.try_as_f64()?),
        })
    }
}

impl Aggregator for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn output_type(&self, input: ValueType) -> Result<ValueType> {
        match input {
            ValueType::Integer | ValueType::Undefined => Ok(ValueType::Integer),
            ValueType::Float => Ok(ValueType::Float),
            other => Err(FrameStoreError::type_mismatch(format!(
                "cannot sum {other} column"
            ))),
        }
    }

    fn update(&self, state: &mut Value, value: &Value) -> Result<(), BoxError> {
        *state = Self::add(state, value)?;
        Ok(())
    }

    fn combine(&self, state: &mut Value, other: Value) -> Result<(), BoxError> {
        self.update(state, &other)
    }

    fn finalize(&self, state: Value) -> Value {
        match state {
            Value::Undefined => Value::Integer(0),
            v => v,
        }
    }
}

/// Counts defined values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl Aggregator for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn output_type(&self, _input: ValueType) -> Result<ValueType> {
        Ok(ValueType::Integer)
    }

    fn init(&self) -> Value {
        Value::Integer(0)
    }

    fn update(&self, state: &mut Value, value: &Value) -> Result<(), BoxError> {
        if !value.is_undefined() {
            *state = Value::Integer(state.try_as_i64()? + 1);
        }
        Ok(())
    }

    fn combine(&self, state: &mut Value, other: Value) -> Result<(), BoxError> {
        *state = Value::Integer(state.try_as_i64()? + other.try_as_i64()?);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl Aggregator for Min {
    fn name(&self) -> &'static str {
        "min"
    }

    fn output_type(&self, input: ValueType) -> Result<ValueType> {
        Ok(input)
    }

    fn update(&self, state: &mut Value, value: &Value) -> Result<(), BoxError> {
        if !value.is_undefined() && (state.is_undefined() || *value < *state) {
            *state = value.clone();
        }
        Ok(())
    }

    fn combine(&self, state: &mut Value, other: Value) -> Result<(), BoxError> {
        self.update(state, &other)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl Aggregator for Max {
    fn name(&self) -> &'static str {
        "max"
    }

    fn output_type(&self, input: ValueType) -> Result<ValueType> {
        Ok(input)
    }

    fn update(&self, state: &mut Value, value: &Value) -> Result<(), BoxError> {
        if !value.is_undefined() && (state.is_undefined() || *value > *state) {
            *state = value.clone();
        }
        Ok(())
    }

    fn combine(&self, state: &mut Value, other: Value) -> Result<(), BoxError> {
        self.update(state, &other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(agg: &dyn Aggregator, partitions: &[&[Value]]) -> Value {
        let mut state = agg.init();
        for part in partitions {
            let mut partial = agg.init();
            for v in *part {
                agg.update(&mut partial, v).unwrap();
            }
            agg.combine(&mut state, partial).unwrap();
        }
        agg.finalize(state)
    }

    #[test]
    fn builtin_aggregates() {
        let a = [Value::Integer(3), Value::Undefined, Value::Integer(-1)];
        let b = [Value::Integer(7)];
        assert_eq!(Value::Integer(9), run(&Sum, &[&a, &b]));
        assert_eq!(Value::Integer(3), run(&Count, &[&a, &b]));
        assert_eq!(Value::Integer(-1), run(&Min, &[&a, &b]));
        assert_eq!(Value::Integer(7), run(&Max, &[&a, &b]));
    }

    #[test]
    fn empty_input() {
        assert_eq!(Value::Integer(0), run(&Sum, &[]));
        assert_eq!(Value::Integer(0), run(&Count, &[&[]]));
        assert_eq!(Value::Undefined, run(&Min, &[&[]]));
    }

    #[test]
    fn sum_rejects_strings() {
        assert!(Sum.output_type(ValueType::String).is_err());
        assert_eq!(ValueType::Float, Sum.output_type(ValueType::Float).unwrap());
    }

    #[test]
    fn sum_overflow_is_error() {
        let mut state = Value::Integer(i64::MAX);
        assert!(Sum.update(&mut state, &Value::Integer(1)).is_err());
    }

    #[test]
    fn compose_coerces_intermediate() {
        let double = ValueTransform::infallible(|v| Value::Integer(v.try_as_i64().unwrap_or(0) * 2));
        let describe = ValueTransform::infallible(|v| Value::from(v.value_type().to_string()));
        let composed = double.then(ValueType::Float, &describe);
        assert_eq!(Value::from("float"), composed.call(&Value::Integer(2)).unwrap());

        let failing = ValueTransform::new(|_| Err("nope".into()));
        let composed = double.then(ValueType::Integer, &failing);
        assert_eq!("nope", composed.call(&Value::Integer(1)).unwrap_err().to_string());
    }
}
