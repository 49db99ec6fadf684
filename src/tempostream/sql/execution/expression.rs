//! Shape-checked expression compilation and evaluation.
//!
//! This is the engine's seam to the general expression compiler: conditions
//! arriving from the query engine are compiled once against a known event
//! shape, producing an [`ExecutableExpression`] with a statically inferred
//! return type. The static type is what lets `compile_expression` reject a
//! non-string `per` value at query-compile time rather than on first use.

use crate::tempostream::sql::ast::{BinaryOperator, Expr, LiteralValue, UnaryOperator};
use crate::tempostream::sql::error::SqlError;
use crate::tempostream::sql::execution::types::{FieldType, FieldValue};
use std::collections::{HashMap, HashSet};

/// Ordered attribute name/type listing describing the shape of an event or
/// table row an expression is compiled against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventShape {
    attributes: Vec<(String, FieldType)>,
}

impl EventShape {
    /// Empty shape
    pub fn new() -> Self {
        EventShape::default()
    }

    /// Add an attribute, replacing any previous definition of the same name
    pub fn with_attribute(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.set_attribute(name, field_type);
        self
    }

    /// Add or replace an attribute in place
    pub fn set_attribute(&mut self, name: impl Into<String>, field_type: FieldType) {
        let name = name.into();
        if let Some(entry) = self.attributes.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = field_type;
        } else {
            self.attributes.push((name, field_type));
        }
    }

    /// Merge another shape into this one; the other shape's types win on
    /// name collisions.
    pub fn extend(&mut self, other: &EventShape) {
        for (name, field_type) in &other.attributes {
            self.set_attribute(name.clone(), *field_type);
        }
    }

    /// Type of an attribute, if present
    pub fn attribute_type(&self, name: &str) -> Option<FieldType> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }

    /// Whether the shape defines an attribute with this name
    pub fn contains(&self, name: &str) -> bool {
        self.attribute_type(name).is_some()
    }

    /// Attribute names in declaration order
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|(n, _)| n.as_str())
    }

    /// Attributes in declaration order
    pub fn attributes(&self) -> &[(String, FieldType)] {
        &self.attributes
    }
}

/// A compiled, type-checked expression evaluable against a field map.
#[derive(Debug, Clone)]
pub struct ExecutableExpression {
    expr: Expr,
    return_type: FieldType,
}

impl ExecutableExpression {
    /// Statically inferred return type
    pub fn return_type(&self) -> FieldType {
        self.return_type
    }

    /// The literal value, when this expression is a constant
    pub fn as_constant(&self) -> Option<&LiteralValue> {
        match &self.expr {
            Expr::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Evaluate against a field map.
    ///
    /// A referenced field missing from the map is an execution error; callers
    /// compile expressions against the shape of the rows they evaluate.
    pub fn evaluate(&self, fields: &HashMap<String, FieldValue>) -> Result<FieldValue, SqlError> {
        evaluate_expr(&self.expr, fields)
    }

    /// Evaluate as a filter predicate. NULL results are treated as
    /// non-matching.
    pub fn evaluate_bool(&self, fields: &HashMap<String, FieldValue>) -> Result<bool, SqlError> {
        match self.evaluate(fields)? {
            FieldValue::Boolean(b) => Ok(b),
            FieldValue::Null => Ok(false),
            other => Err(SqlError::type_error(
                FieldType::Boolean.name(),
                other.type_name(),
                Some(other.to_string()),
            )),
        }
    }
}

/// Compile an expression against an event shape, inferring and checking its
/// static type. Reports a schema error for unknown columns and a type error
/// for incompatible operand types.
pub fn parse_expression(expr: &Expr, shape: &EventShape) -> Result<ExecutableExpression, SqlError> {
    let return_type = infer_type(expr, shape)?;
    Ok(ExecutableExpression {
        expr: expr.clone(),
        return_type,
    })
}

fn infer_type(expr: &Expr, shape: &EventShape) -> Result<FieldType, SqlError> {
    match expr {
        Expr::Column(name) => shape.attribute_type(name).ok_or_else(|| {
            SqlError::schema_error("column not found in event shape", Some(name.clone()))
        }),
        Expr::Literal(value) => Ok(literal_type(value)),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => {
            let inner = infer_type(expr, shape)?;
            if inner != FieldType::Boolean && inner != FieldType::Null {
                return Err(SqlError::type_error(
                    FieldType::Boolean.name(),
                    inner.name(),
                    None,
                ));
            }
            Ok(FieldType::Boolean)
        }
        Expr::BinaryOp { left, op, right } => {
            let lt = infer_type(left, shape)?;
            let rt = infer_type(right, shape)?;
            match op {
                BinaryOperator::And | BinaryOperator::Or => {
                    for side in [lt, rt] {
                        if side != FieldType::Boolean && side != FieldType::Null {
                            return Err(SqlError::type_error(
                                FieldType::Boolean.name(),
                                side.name(),
                                None,
                            ));
                        }
                    }
                    Ok(FieldType::Boolean)
                }
                _ => {
                    if !types_comparable(lt, rt) {
                        return Err(SqlError::type_error(lt.name(), rt.name(), None));
                    }
                    Ok(FieldType::Boolean)
                }
            }
        }
    }
}

fn literal_type(value: &LiteralValue) -> FieldType {
    match value {
        LiteralValue::Integer(_) => FieldType::Integer,
        LiteralValue::Float(_) => FieldType::Float,
        LiteralValue::String(_) => FieldType::String,
        LiteralValue::Boolean(_) => FieldType::Boolean,
        LiteralValue::Null => FieldType::Null,
    }
}

fn types_comparable(left: FieldType, right: FieldType) -> bool {
    if left == FieldType::Null || right == FieldType::Null {
        return true;
    }
    if left.is_numeric() && right.is_numeric() {
        return true;
    }
    left == right
}

fn evaluate_expr(
    expr: &Expr,
    fields: &HashMap<String, FieldValue>,
) -> Result<FieldValue, SqlError> {
    match expr {
        Expr::Column(name) => fields.get(name).cloned().ok_or_else(|| {
            SqlError::execution_error(format!("field '{}' not present in record", name), None)
        }),
        Expr::Literal(value) => Ok(literal_value(value)),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => match evaluate_expr(expr, fields)? {
            FieldValue::Boolean(b) => Ok(FieldValue::Boolean(!b)),
            FieldValue::Null => Ok(FieldValue::Null),
            other => Err(SqlError::type_error(
                FieldType::Boolean.name(),
                other.type_name(),
                Some(other.to_string()),
            )),
        },
        Expr::BinaryOp { left, op, right } => {
            let lv = evaluate_expr(left, fields)?;
            let rv = evaluate_expr(right, fields)?;
            match op {
                BinaryOperator::And => evaluate_and(lv, rv),
                BinaryOperator::Or => evaluate_or(lv, rv),
                _ => evaluate_comparison(&lv, *op, &rv),
            }
        }
    }
}

fn literal_value(value: &LiteralValue) -> FieldValue {
    match value {
        LiteralValue::Integer(i) => FieldValue::Integer(*i),
        LiteralValue::Float(f) => FieldValue::Float(*f),
        LiteralValue::String(s) => FieldValue::String(s.clone()),
        LiteralValue::Boolean(b) => FieldValue::Boolean(*b),
        LiteralValue::Null => FieldValue::Null,
    }
}

// Three-valued logic: a definite false/true short-circuits past NULL.
fn evaluate_and(left: FieldValue, right: FieldValue) -> Result<FieldValue, SqlError> {
    match (bool_or_null(&left)?, bool_or_null(&right)?) {
        (Some(false), _) | (_, Some(false)) => Ok(FieldValue::Boolean(false)),
        (Some(true), Some(true)) => Ok(FieldValue::Boolean(true)),
        _ => Ok(FieldValue::Null),
    }
}

fn evaluate_or(left: FieldValue, right: FieldValue) -> Result<FieldValue, SqlError> {
    match (bool_or_null(&left)?, bool_or_null(&right)?) {
        (Some(true), _) | (_, Some(true)) => Ok(FieldValue::Boolean(true)),
        (Some(false), Some(false)) => Ok(FieldValue::Boolean(false)),
        _ => Ok(FieldValue::Null),
    }
}

fn bool_or_null(value: &FieldValue) -> Result<Option<bool>, SqlError> {
    match value {
        FieldValue::Boolean(b) => Ok(Some(*b)),
        FieldValue::Null => Ok(None),
        other => Err(SqlError::type_error(
            FieldType::Boolean.name(),
            other.type_name(),
            Some(other.to_string()),
        )),
    }
}

fn evaluate_comparison(
    left: &FieldValue,
    op: BinaryOperator,
    right: &FieldValue,
) -> Result<FieldValue, SqlError> {
    let ordering = match left.compare(right) {
        Some(ord) => ord,
        None => return Ok(FieldValue::Null),
    };
    let result = match op {
        BinaryOperator::Equal => ordering.is_eq(),
        BinaryOperator::NotEqual => ordering.is_ne(),
        BinaryOperator::LessThan => ordering.is_lt(),
        BinaryOperator::LessThanOrEqual => ordering.is_le(),
        BinaryOperator::GreaterThan => ordering.is_gt(),
        BinaryOperator::GreaterThanOrEqual => ordering.is_ge(),
        BinaryOperator::And | BinaryOperator::Or => {
            return Err(SqlError::execution_error(
                "logical operator applied as comparison",
                None,
            ));
        }
    };
    Ok(FieldValue::Boolean(result))
}

/// Reduce a join condition to the part expressible over a given attribute
/// set.
///
/// Used to push the `on` predicate down into table scans: conjuncts whose
/// columns all exist in the persisted schema are kept, everything else is
/// dropped (made vacuously true). `None` means nothing of the condition
/// survives the reduction. Disjunctions are kept only when both sides
/// survive, since dropping one side of an OR would narrow the scan
/// incorrectly.
pub fn reduce_expression_for_attributes(expr: &Expr, available: &HashSet<String>) -> Option<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let lr = reduce_expression_for_attributes(left, available);
            let rr = reduce_expression_for_attributes(right, available);
            match (lr, rr) {
                (Some(l), Some(r)) => Some(Expr::and(l, r)),
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (None, None) => None,
            }
        }
        _ => {
            if expr
                .referenced_columns()
                .iter()
                .all(|column| available.contains(column))
            {
                Some(expr.clone())
            } else {
                None
            }
        }
    }
}
