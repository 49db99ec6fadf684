//! Running aggregate state for buckets.
//!
//! A [`BucketAccumulator`] holds the incremental state of every aggregate
//! function for one (group key, window) pair. The same structure serves the
//! whole ladder: the base executor feeds it raw events, coarser executors
//! merge the base columns of completed finer buckets into it, and recovery
//! rebuilds it from persisted rows.
//!
//! Persisted rows carry *base* state, not finalized values: AVG is stored as
//! its sum and count columns so that buckets can be merged losslessly at any
//! level. The output projection computes the user-facing value at read time.

use crate::tempostream::sql::error::SqlError;
use crate::tempostream::sql::execution::expression::EventShape;
use crate::tempostream::sql::execution::types::{FieldType, FieldValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Aggregate functions supported by the incremental executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    First,
    Last,
}

/// One aggregate output of the aggregation definition: output attribute
/// name, function, and the source field it reads (None for `COUNT(*)`).
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub output_name: String,
    pub function: AggregateFunction,
    pub source_field: Option<String>,
}

impl AggregateSpec {
    /// `COUNT(*)`
    pub fn count(output_name: impl Into<String>) -> Self {
        AggregateSpec {
            output_name: output_name.into(),
            function: AggregateFunction::Count,
            source_field: None,
        }
    }

    /// `COUNT(field)` counting non-NULL values
    pub fn count_field(output_name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregateSpec {
            output_name: output_name.into(),
            function: AggregateFunction::Count,
            source_field: Some(field.into()),
        }
    }

    /// `SUM(field)`
    pub fn sum(output_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(output_name, AggregateFunction::Sum, field)
    }

    /// `MIN(field)`
    pub fn min(output_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(output_name, AggregateFunction::Min, field)
    }

    /// `MAX(field)`
    pub fn max(output_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(output_name, AggregateFunction::Max, field)
    }

    /// `AVG(field)`
    pub fn avg(output_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(output_name, AggregateFunction::Avg, field)
    }

    /// `FIRST(field)`
    pub fn first(output_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(output_name, AggregateFunction::First, field)
    }

    /// `LAST(field)`
    pub fn last(output_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_field(output_name, AggregateFunction::Last, field)
    }

    fn with_field(
        output_name: impl Into<String>,
        function: AggregateFunction,
        field: impl Into<String>,
    ) -> Self {
        AggregateSpec {
            output_name: output_name.into(),
            function,
            source_field: Some(field.into()),
        }
    }

    /// Base column holding the running sum of an AVG spec
    pub fn avg_sum_column(&self) -> String {
        format!("{}_SUM", self.output_name)
    }

    /// Base column holding the contributing count of an AVG spec
    pub fn avg_count_column(&self) -> String {
        format!("{}_COUNT", self.output_name)
    }

    /// Base columns this spec persists, with their types, derived from the
    /// input stream shape. Fails when the source field is missing from the
    /// shape or its type cannot feed the function.
    pub fn base_columns(&self, input: &EventShape) -> Result<Vec<(String, FieldType)>, SqlError> {
        match self.function {
            AggregateFunction::Count => Ok(vec![(self.output_name.clone(), FieldType::Integer)]),
            AggregateFunction::Sum => {
                let source = self.numeric_source_type(input)?;
                Ok(vec![(self.output_name.clone(), source)])
            }
            AggregateFunction::Avg => {
                self.numeric_source_type(input)?;
                Ok(vec![
                    (self.avg_sum_column(), FieldType::Float),
                    (self.avg_count_column(), FieldType::Integer),
                ])
            }
            AggregateFunction::Min
            | AggregateFunction::Max
            | AggregateFunction::First
            | AggregateFunction::Last => {
                let source = self.source_type(input)?;
                Ok(vec![(self.output_name.clone(), source)])
            }
        }
    }

    /// Output attribute produced by the projection for this spec
    pub fn output_attribute(&self, input: &EventShape) -> Result<(String, FieldType), SqlError> {
        let field_type = match self.function {
            AggregateFunction::Count => FieldType::Integer,
            AggregateFunction::Avg => FieldType::Float,
            AggregateFunction::Sum => self.numeric_source_type(input)?,
            AggregateFunction::Min
            | AggregateFunction::Max
            | AggregateFunction::First
            | AggregateFunction::Last => self.source_type(input)?,
        };
        Ok((self.output_name.clone(), field_type))
    }

    fn source_type(&self, input: &EventShape) -> Result<FieldType, SqlError> {
        let field = self.source_field.as_deref().ok_or_else(|| {
            SqlError::schema_error(
                format!("aggregate '{}' requires a source field", self.output_name),
                None,
            )
        })?;
        input.attribute_type(field).ok_or_else(|| {
            SqlError::schema_error(
                "aggregate source field not found in input shape",
                Some(field.to_string()),
            )
        })
    }

    fn numeric_source_type(&self, input: &EventShape) -> Result<FieldType, SqlError> {
        let source = self.source_type(input)?;
        if !source.is_numeric() {
            return Err(SqlError::type_error(
                "numeric type",
                source.name(),
                self.source_field.clone(),
            ));
        }
        Ok(source)
    }
}

/// Incremental aggregate state for one bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketAccumulator {
    /// Records contributed to this bucket, feeding `COUNT(*)`
    pub count: u64,
    /// Non-NULL value counts for `COUNT(field)` (output name -> count)
    pub non_null_counts: HashMap<String, u64>,
    /// Running sums (output name -> (total, still all-integer))
    pub sums: HashMap<String, (f64, bool)>,
    /// Running minimums
    pub mins: HashMap<String, FieldValue>,
    /// Running maximums
    pub maxs: HashMap<String, FieldValue>,
    /// AVG state (output name -> (sum, contributing count))
    pub avg_states: HashMap<String, (f64, u64)>,
    /// First observed values
    pub first_values: HashMap<String, FieldValue>,
    /// Latest observed values
    pub last_values: HashMap<String, FieldValue>,
}

impl BucketAccumulator {
    /// Empty accumulator
    pub fn new() -> Self {
        BucketAccumulator::default()
    }

    /// Fold one raw record into the running state.
    ///
    /// A failing evaluation leaves the accumulator unchanged for the specs
    /// already applied is acceptable only because the caller drops the whole
    /// record on error before the bucket is observed; see the executor's
    /// staging of `apply` on a scratch clone.
    pub fn apply(
        &mut self,
        fields: &HashMap<String, FieldValue>,
        specs: &[AggregateSpec],
    ) -> Result<(), SqlError> {
        self.count += 1;
        for spec in specs {
            self.apply_spec(fields, spec)?;
        }
        Ok(())
    }

    fn apply_spec(
        &mut self,
        fields: &HashMap<String, FieldValue>,
        spec: &AggregateSpec,
    ) -> Result<(), SqlError> {
        let value = match &spec.source_field {
            Some(field) => fields.get(field).cloned().ok_or_else(|| {
                SqlError::execution_error(
                    format!("aggregate source field '{}' not present in record", field),
                    None,
                )
            })?,
            // COUNT(*) rides on the global record count
            None => return Ok(()),
        };

        match spec.function {
            AggregateFunction::Count => {
                if !matches!(value, FieldValue::Null) {
                    *self
                        .non_null_counts
                        .entry(spec.output_name.clone())
                        .or_insert(0) += 1;
                }
            }
            AggregateFunction::Sum => match value {
                FieldValue::Integer(i) => self.add_sum(&spec.output_name, i as f64, true),
                FieldValue::Float(f) => self.add_sum(&spec.output_name, f, false),
                FieldValue::Null => {}
                other => {
                    return Err(SqlError::execution_error(
                        format!("cannot sum non-numeric value: {:?}", other),
                        None,
                    ));
                }
            },
            AggregateFunction::Min => {
                if !matches!(value, FieldValue::Null) {
                    self.update_extreme(&spec.output_name, value, Ordering::Less)?;
                }
            }
            AggregateFunction::Max => {
                if !matches!(value, FieldValue::Null) {
                    self.update_extreme(&spec.output_name, value, Ordering::Greater)?;
                }
            }
            AggregateFunction::Avg => match value.as_f64() {
                Some(f) => {
                    let state = self
                        .avg_states
                        .entry(spec.output_name.clone())
                        .or_insert((0.0, 0));
                    state.0 += f;
                    state.1 += 1;
                }
                None if matches!(value, FieldValue::Null) => {}
                None => {
                    return Err(SqlError::execution_error(
                        format!("cannot average non-numeric value: {:?}", value),
                        None,
                    ));
                }
            },
            AggregateFunction::First => {
                self.first_values
                    .entry(spec.output_name.clone())
                    .or_insert(value);
            }
            AggregateFunction::Last => {
                self.last_values.insert(spec.output_name.clone(), value);
            }
        }
        Ok(())
    }

    fn add_sum(&mut self, output_name: &str, value: f64, is_integer: bool) {
        let state = self
            .sums
            .entry(output_name.to_string())
            .or_insert((0.0, true));
        state.0 += value;
        state.1 = state.1 && is_integer;
    }

    fn update_extreme(
        &mut self,
        output_name: &str,
        value: FieldValue,
        keep_when: Ordering,
    ) -> Result<(), SqlError> {
        let slot = if keep_when == Ordering::Less {
            &mut self.mins
        } else {
            &mut self.maxs
        };
        match slot.get(output_name) {
            None => {
                slot.insert(output_name.to_string(), value);
                Ok(())
            }
            Some(current) => match value.compare(current) {
                Some(ordering) => {
                    if ordering == keep_when {
                        slot.insert(output_name.to_string(), value);
                    }
                    Ok(())
                }
                None => Err(SqlError::execution_error(
                    format!(
                        "cannot compare {} with {} for MIN/MAX",
                        value.type_name(),
                        current.type_name()
                    ),
                    None,
                )),
            },
        }
    }

    /// Merge another accumulator into this one, per-function merge rules:
    /// counts add, sums add, min of mins, max of maxs, AVG states add,
    /// FIRST keeps the existing value, LAST takes the incoming one.
    ///
    /// Callers merge in ascending window order so FIRST/LAST stay correct.
    pub fn merge(&mut self, other: &BucketAccumulator) {
        self.count += other.count;
        for (name, count) in &other.non_null_counts {
            *self.non_null_counts.entry(name.clone()).or_insert(0) += count;
        }
        for (name, (total, all_int)) in &other.sums {
            let state = self.sums.entry(name.clone()).or_insert((0.0, true));
            state.0 += total;
            state.1 = state.1 && *all_int;
        }
        for (name, value) in &other.mins {
            match self.mins.get(name) {
                Some(current) if value.compare(current) != Some(Ordering::Less) => {}
                _ => {
                    self.mins.insert(name.clone(), value.clone());
                }
            }
        }
        for (name, value) in &other.maxs {
            match self.maxs.get(name) {
                Some(current) if value.compare(current) != Some(Ordering::Greater) => {}
                _ => {
                    self.maxs.insert(name.clone(), value.clone());
                }
            }
        }
        for (name, (sum, count)) in &other.avg_states {
            let state = self.avg_states.entry(name.clone()).or_insert((0.0, 0));
            state.0 += sum;
            state.1 += count;
        }
        for (name, value) in &other.first_values {
            self.first_values
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        for (name, value) in &other.last_values {
            self.last_values.insert(name.clone(), value.clone());
        }
    }

    /// Reconstruct running state from the base columns of a persisted row.
    /// Inverse of [`to_row_values`](Self::to_row_values); used when coarser
    /// executors absorb completed finer buckets and during recovery.
    pub fn from_row(
        values: &HashMap<String, FieldValue>,
        specs: &[AggregateSpec],
    ) -> Result<Self, SqlError> {
        let mut acc = BucketAccumulator::new();
        for spec in specs {
            match spec.function {
                AggregateFunction::Count => {
                    let count = read_integer(values, &spec.output_name)?.unwrap_or(0);
                    if spec.source_field.is_none() {
                        acc.count = count as u64;
                    } else {
                        acc.non_null_counts
                            .insert(spec.output_name.clone(), count as u64);
                    }
                }
                AggregateFunction::Sum => match values.get(&spec.output_name) {
                    Some(FieldValue::Integer(i)) => {
                        acc.sums.insert(spec.output_name.clone(), (*i as f64, true));
                    }
                    Some(FieldValue::Float(f)) => {
                        acc.sums.insert(spec.output_name.clone(), (*f, false));
                    }
                    Some(FieldValue::Null) | None => {}
                    Some(other) => {
                        return Err(SqlError::execution_error(
                            format!("malformed SUM column '{}': {:?}", spec.output_name, other),
                            None,
                        ));
                    }
                },
                AggregateFunction::Avg => {
                    let sum = match values.get(&spec.avg_sum_column()) {
                        Some(value) => value.as_f64(),
                        None => None,
                    };
                    let count = read_integer(values, &spec.avg_count_column())?.unwrap_or(0);
                    if let (Some(sum), true) = (sum, count > 0) {
                        acc.avg_states
                            .insert(spec.output_name.clone(), (sum, count as u64));
                    }
                }
                AggregateFunction::Min => {
                    copy_non_null(values, &spec.output_name, &mut acc.mins);
                }
                AggregateFunction::Max => {
                    copy_non_null(values, &spec.output_name, &mut acc.maxs);
                }
                AggregateFunction::First => {
                    copy_non_null(values, &spec.output_name, &mut acc.first_values);
                }
                AggregateFunction::Last => {
                    copy_non_null(values, &spec.output_name, &mut acc.last_values);
                }
            }
        }
        Ok(acc)
    }

    /// Base column values persisted for this bucket
    pub fn to_row_values(&self, specs: &[AggregateSpec]) -> HashMap<String, FieldValue> {
        let mut values = HashMap::new();
        for spec in specs {
            match spec.function {
                AggregateFunction::Count => {
                    let count = match spec.source_field {
                        None => self.count,
                        Some(_) => self
                            .non_null_counts
                            .get(&spec.output_name)
                            .copied()
                            .unwrap_or(0),
                    };
                    values.insert(spec.output_name.clone(), FieldValue::Integer(count as i64));
                }
                AggregateFunction::Sum => {
                    values.insert(spec.output_name.clone(), self.sum_value(&spec.output_name));
                }
                AggregateFunction::Avg => {
                    match self.avg_states.get(&spec.output_name) {
                        Some((sum, count)) => {
                            values.insert(spec.avg_sum_column(), FieldValue::Float(*sum));
                            values
                                .insert(spec.avg_count_column(), FieldValue::Integer(*count as i64));
                        }
                        None => {
                            values.insert(spec.avg_sum_column(), FieldValue::Null);
                            values.insert(spec.avg_count_column(), FieldValue::Integer(0));
                        }
                    };
                }
                AggregateFunction::Min => {
                    values.insert(
                        spec.output_name.clone(),
                        self.mins
                            .get(&spec.output_name)
                            .cloned()
                            .unwrap_or(FieldValue::Null),
                    );
                }
                AggregateFunction::Max => {
                    values.insert(
                        spec.output_name.clone(),
                        self.maxs
                            .get(&spec.output_name)
                            .cloned()
                            .unwrap_or(FieldValue::Null),
                    );
                }
                AggregateFunction::First => {
                    values.insert(
                        spec.output_name.clone(),
                        self.first_values
                            .get(&spec.output_name)
                            .cloned()
                            .unwrap_or(FieldValue::Null),
                    );
                }
                AggregateFunction::Last => {
                    values.insert(
                        spec.output_name.clone(),
                        self.last_values
                            .get(&spec.output_name)
                            .cloned()
                            .unwrap_or(FieldValue::Null),
                    );
                }
            }
        }
        values
    }

    /// Finalized, user-facing values: AVG computed from its state, all other
    /// functions as persisted.
    pub fn finalize(&self, specs: &[AggregateSpec]) -> HashMap<String, FieldValue> {
        let mut values = self.to_row_values(specs);
        for spec in specs {
            if spec.function == AggregateFunction::Avg {
                values.remove(&spec.avg_sum_column());
                values.remove(&spec.avg_count_column());
                let finalized = match self.avg_states.get(&spec.output_name) {
                    Some((sum, count)) if *count > 0 => FieldValue::Float(sum / *count as f64),
                    _ => FieldValue::Null,
                };
                values.insert(spec.output_name.clone(), finalized);
            }
        }
        values
    }

    fn sum_value(&self, output_name: &str) -> FieldValue {
        match self.sums.get(output_name) {
            Some((total, true)) => FieldValue::Integer(*total as i64),
            Some((total, false)) => FieldValue::Float(*total),
            None => FieldValue::Null,
        }
    }
}

fn read_integer(
    values: &HashMap<String, FieldValue>,
    column: &str,
) -> Result<Option<i64>, SqlError> {
    match values.get(column) {
        Some(FieldValue::Integer(i)) => Ok(Some(*i)),
        Some(FieldValue::Null) | None => Ok(None),
        Some(other) => Err(SqlError::execution_error(
            format!("malformed integer column '{}': {:?}", column, other),
            None,
        )),
    }
}

fn copy_non_null(
    values: &HashMap<String, FieldValue>,
    column: &str,
    target: &mut HashMap<String, FieldValue>,
) {
    if let Some(value) = values.get(column) {
        if !matches!(value, FieldValue::Null) {
            target.insert(column.to_string(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<AggregateSpec> {
        vec![
            AggregateSpec::count("trades"),
            AggregateSpec::sum("volume_total", "volume"),
            AggregateSpec::min("low", "price"),
            AggregateSpec::max("high", "price"),
            AggregateSpec::avg("vwap", "price"),
        ]
    }

    fn event(price: f64, volume: i64) -> HashMap<String, FieldValue> {
        let mut fields = HashMap::new();
        fields.insert("price".to_string(), FieldValue::Float(price));
        fields.insert("volume".to_string(), FieldValue::Integer(volume));
        fields
    }

    #[test]
    fn apply_accumulates_running_state() {
        let specs = specs();
        let mut acc = BucketAccumulator::new();
        acc.apply(&event(10.0, 5), &specs).unwrap();
        acc.apply(&event(12.0, 3), &specs).unwrap();
        acc.apply(&event(8.0, 2), &specs).unwrap();

        let out = acc.finalize(&specs);
        assert_eq!(out["trades"], FieldValue::Integer(3));
        assert_eq!(out["volume_total"], FieldValue::Integer(10));
        assert_eq!(out["low"], FieldValue::Float(8.0));
        assert_eq!(out["high"], FieldValue::Float(12.0));
        assert_eq!(out["vwap"], FieldValue::Float(10.0));
    }

    #[test]
    fn merge_combines_per_function() {
        let specs = specs();
        let mut left = BucketAccumulator::new();
        left.apply(&event(10.0, 5), &specs).unwrap();
        let mut right = BucketAccumulator::new();
        right.apply(&event(20.0, 7), &specs).unwrap();
        right.apply(&event(5.0, 1), &specs).unwrap();

        left.merge(&right);
        let out = left.finalize(&specs);
        assert_eq!(out["trades"], FieldValue::Integer(3));
        assert_eq!(out["volume_total"], FieldValue::Integer(13));
        assert_eq!(out["low"], FieldValue::Float(5.0));
        assert_eq!(out["high"], FieldValue::Float(20.0));
        assert_eq!(out["vwap"], FieldValue::Float(35.0 / 3.0));
    }

    #[test]
    fn row_round_trip_preserves_merge_state() {
        let specs = specs();
        let mut acc = BucketAccumulator::new();
        acc.apply(&event(10.0, 5), &specs).unwrap();
        acc.apply(&event(30.0, 5), &specs).unwrap();

        let restored = BucketAccumulator::from_row(&acc.to_row_values(&specs), &specs).unwrap();
        // AVG must survive as sum+count, not as the finalized quotient
        assert_eq!(restored.avg_states["vwap"], (40.0, 2));
        assert_eq!(restored.finalize(&specs), acc.finalize(&specs));
    }

    #[test]
    fn null_values_do_not_contribute() {
        let specs = vec![
            AggregateSpec::count_field("priced", "price"),
            AggregateSpec::sum("total", "price"),
        ];
        let mut fields = HashMap::new();
        fields.insert("price".to_string(), FieldValue::Null);
        let mut acc = BucketAccumulator::new();
        acc.apply(&fields, &specs).unwrap();

        let out = acc.finalize(&specs);
        assert_eq!(out["priced"], FieldValue::Integer(0));
        assert_eq!(out["total"], FieldValue::Null);
    }

    #[test]
    fn non_numeric_sum_fails_the_record() {
        let specs = vec![AggregateSpec::sum("total", "price")];
        let mut fields = HashMap::new();
        fields.insert("price".to_string(), FieldValue::String("oops".into()));
        let mut acc = BucketAccumulator::new();
        assert!(acc.apply(&fields, &specs).is_err());
    }

    #[test]
    fn integer_sums_stay_integers_until_a_float_contributes() {
        let specs = vec![AggregateSpec::sum("total", "volume")];
        let mut acc = BucketAccumulator::new();
        acc.apply(&event(0.0, 2), &specs).unwrap();
        acc.apply(&event(0.0, 3), &specs).unwrap();
        assert_eq!(
            acc.finalize(&specs)["total"],
            FieldValue::Integer(5)
        );

        let mut float_acc = BucketAccumulator::new();
        let mut fields = HashMap::new();
        fields.insert("volume".to_string(), FieldValue::Float(1.5));
        float_acc.apply(&fields, &specs).unwrap();
        acc.merge(&float_acc);
        assert_eq!(acc.finalize(&specs)["total"], FieldValue::Float(6.5));
    }

    #[test]
    fn base_columns_split_avg_state() {
        let shape = EventShape::new().with_attribute("price", FieldType::Float);
        let spec = AggregateSpec::avg("vwap", "price");
        let columns = spec.base_columns(&shape).unwrap();
        assert_eq!(
            columns,
            vec![
                ("vwap_SUM".to_string(), FieldType::Float),
                ("vwap_COUNT".to_string(), FieldType::Integer),
            ]
        );
    }

    #[test]
    fn sum_of_non_numeric_shape_is_rejected() {
        let shape = EventShape::new().with_attribute("symbol", FieldType::String);
        let spec = AggregateSpec::sum("total", "symbol");
        assert!(matches!(
            spec.base_columns(&shape),
            Err(SqlError::TypeError { .. })
        ));
    }
}
