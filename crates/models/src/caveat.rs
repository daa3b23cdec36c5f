use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use validator::Validate;

/// Request-supplied variables a caveat is evaluated against.
pub type CaveatContext = HashMap<String, Value>;

#[derive(Debug, Error)]
pub enum CaveatError {
    #[error("missing context field: {0}")]
    MissingField(String),

    #[error("field is not comparable as a number: {0}")]
    NotComparable(String),
}

/// A named, context-free condition attached to a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Caveat {
    #[validate(length(min = 1))]
    pub name: String,
    pub expression: CaveatExpr,
}

impl Caveat {
    pub fn new(name: impl Into<String>, expression: CaveatExpr) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }

    pub fn evaluate(&self, context: &CaveatContext) -> Result<bool, CaveatError> {
        self.expression.evaluate(context)
    }
}

/// Side-effect-free predicate over the request context.
///
/// Comparisons other than equality only apply to JSON numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaveatExpr {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: f64 },
    Lt { field: String, value: f64 },
    In { field: String, values: Vec<Value> },
    And(Vec<CaveatExpr>),
    Or(Vec<CaveatExpr>),
    Not(Box<CaveatExpr>),
}

impl CaveatExpr {
    pub fn evaluate(&self, context: &CaveatContext) -> Result<bool, CaveatError> {
        match self {
            CaveatExpr::Eq { field, value } => Ok(lookup(context, field)? == value),
            CaveatExpr::Ne { field, value } => Ok(lookup(context, field)? != value),
            CaveatExpr::Gt { field, value } => Ok(as_number(context, field)? > *value),
            CaveatExpr::Lt { field, value } => Ok(as_number(context, field)? < *value),
            CaveatExpr::In { field, values } => {
                let actual = lookup(context, field)?;
                Ok(values.iter().any(|v| v == actual))
            }
            CaveatExpr::And(children) => {
                for child in children {
                    if !child.evaluate(context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CaveatExpr::Or(children) => {
                for child in children {
                    if child.evaluate(context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CaveatExpr::Not(child) => Ok(!child.evaluate(context)?),
        }
    }
}

fn lookup<'a>(context: &'a CaveatContext, field: &str) -> Result<&'a Value, CaveatError> {
    context
        .get(field)
        .ok_or_else(|| CaveatError::MissingField(field.to_string()))
}

fn as_number(context: &CaveatContext, field: &str) -> Result<f64, CaveatError> {
    lookup(context, field)?
        .as_f64()
        .ok_or_else(|| CaveatError::NotComparable(field.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> CaveatContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_and_membership() {
        let expr = CaveatExpr::Eq {
            field: "ip_range".to_string(),
            value: json!("internal"),
        };
        assert!(expr.evaluate(&ctx(&[("ip_range", json!("internal"))])).unwrap());
        assert!(!expr.evaluate(&ctx(&[("ip_range", json!("external"))])).unwrap());

        let member = CaveatExpr::In {
            field: "region".to_string(),
            values: vec![json!("eu"), json!("us")],
        };
        assert!(member.evaluate(&ctx(&[("region", json!("eu"))])).unwrap());
        assert!(!member.evaluate(&ctx(&[("region", json!("ap"))])).unwrap());
    }

    #[test]
    fn numeric_comparison() {
        let expr = CaveatExpr::Gt {
            field: "clearance".to_string(),
            value: 2.0,
        };
        assert!(expr.evaluate(&ctx(&[("clearance", json!(3))])).unwrap());
        assert!(!expr.evaluate(&ctx(&[("clearance", json!(1))])).unwrap());
        assert!(matches!(
            expr.evaluate(&ctx(&[("clearance", json!("high"))])),
            Err(CaveatError::NotComparable(_))
        ));
    }

    #[test]
    fn missing_field_is_an_error() {
        let expr = CaveatExpr::Eq {
            field: "device".to_string(),
            value: json!("managed"),
        };
        assert!(matches!(
            expr.evaluate(&CaveatContext::new()),
            Err(CaveatError::MissingField(_))
        ));
    }

    #[test]
    fn boolean_combinators() {
        let expr = CaveatExpr::And(vec![
            CaveatExpr::Eq {
                field: "device".to_string(),
                value: json!("managed"),
            },
            CaveatExpr::Not(Box::new(CaveatExpr::Eq {
                field: "region".to_string(),
                value: json!("ap"),
            })),
        ]);
        let context = ctx(&[("device", json!("managed")), ("region", json!("eu"))]);
        assert!(expr.evaluate(&context).unwrap());
    }

    #[test]
    fn serde_roundtrip() {
        let caveat = Caveat::new(
            "office_hours",
            CaveatExpr::Or(vec![
                CaveatExpr::Lt {
                    field: "hour".to_string(),
                    value: 18.0,
                },
                CaveatExpr::Eq {
                    field: "on_call".to_string(),
                    value: json!(true),
                },
            ]),
        );
        let encoded = serde_json::to_string(&caveat).unwrap();
        let decoded: Caveat = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, caveat);
    }
}
