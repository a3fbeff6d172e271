use std::sync::Arc;

use chrono::Timelike;

use cadence_core::context::RunContext;
use cadence_core::traits::Clock;

/// Evaluates branch-condition expressions against a run context.
///
/// Two expression forms are supported. The structured form is
/// `field <op> value` with dot-notation field paths; everything else falls
/// through to a small set of named predicates and finally to bare-key
/// truthiness. Unparseable expressions evaluate to false, never error.
///
/// The clock is injected so `timeOfDay:` predicates are deterministic in
/// tests; every other branch is a pure function of (expression, context).
pub struct ConditionEvaluator {
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Contains,
    Equals,
    GreaterThan,
    LessThan,
    StartsWith,
    EndsWith,
}

impl Op {
    fn parse(word: &str) -> Option<Self> {
        match word.to_lowercase().as_str() {
            "contains" | "includes" => Some(Self::Contains),
            "equals" | "==" | "=" => Some(Self::Equals),
            "greaterthan" | ">" => Some(Self::GreaterThan),
            "lessthan" | "<" => Some(Self::LessThan),
            "startswith" => Some(Self::StartsWith),
            "endswith" => Some(Self::EndsWith),
            _ => None,
        }
    }
}

impl ConditionEvaluator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn evaluate(&self, expression: &str, context: &RunContext) -> bool {
        let expr = expression.trim();
        if expr.is_empty() {
            return false;
        }

        if let Some(verdict) = self.eval_structured(expr, context) {
            return verdict;
        }

        self.eval_simple(expr, context)
    }

    /// `field <op> value` — returns None when the expression doesn't match
    /// the structured shape.
    fn eval_structured(&self, expr: &str, context: &RunContext) -> Option<bool> {
        let words: Vec<&str> = expr.split_whitespace().collect();
        if words.len() < 3 {
            return None;
        }
        let op = Op::parse(words[1])?;
        let field = words[0];
        let expected = words[2..].join(" ");
        let expected = expected.trim_matches('"').trim_matches('\'');

        let actual = context.lookup(field);

        match op {
            Op::GreaterThan | Op::LessThan => {
                // Numeric coercion; a failed parse is NaN and NaN compares
                // false against everything.
                let lhs = actual.map(as_number).unwrap_or(f64::NAN);
                let rhs = expected.parse::<f64>().unwrap_or(f64::NAN);
                Some(match op {
                    Op::GreaterThan => lhs > rhs,
                    _ => lhs < rhs,
                })
            }
            _ => {
                // String comparisons lower-case both sides. A missing field
                // never matches.
                let lhs = match actual {
                    Some(v) => as_string(v).to_lowercase(),
                    None => return Some(false),
                };
                let rhs = expected.to_lowercase();
                Some(match op {
                    Op::Contains => lhs.contains(&rhs),
                    Op::Equals => lhs == rhs,
                    Op::StartsWith => lhs.starts_with(&rhs),
                    Op::EndsWith => lhs.ends_with(&rhs),
                    _ => unreachable!(),
                })
            }
        }
    }

    fn eval_simple(&self, expr: &str, context: &RunContext) -> bool {
        let lower = expr.to_lowercase();

        match lower.as_str() {
            "true" | "1" => return true,
            "false" | "0" => return false,
            "windowopen" => return context.truthy("windowOpen"),
            "windowclosed" => return !context.truthy("windowOpen"),
            _ => {}
        }

        if let Some(tag) = lower.strip_prefix("hastag:") {
            let tag = tag.trim();
            return context
                .get("tags")
                .and_then(|v| v.as_array())
                .is_some_and(|tags| {
                    tags.iter()
                        .filter_map(|t| t.as_str())
                        .any(|t| t.eq_ignore_ascii_case(tag))
                });
        }

        if let Some(channel) = lower.strip_prefix("channel:") {
            return context
                .get_str("channel")
                .is_some_and(|c| c.eq_ignore_ascii_case(channel.trim()));
        }

        if let Some(sentiment) = lower.strip_prefix("sentiment:") {
            return context
                .get_str("sentiment")
                .is_some_and(|s| s.eq_ignore_ascii_case(sentiment.trim()));
        }

        if let Some(period) = lower.strip_prefix("timeofday:") {
            let hour = self.clock.now().hour();
            return match period.trim() {
                "morning" => (6..12).contains(&hour),
                "afternoon" => (12..17).contains(&hour),
                "evening" => (17..22).contains(&hour),
                "night" => hour >= 22 || hour < 6,
                _ => false,
            };
        }

        // Fallback: the raw expression as a context key.
        context.truthy(expr)
    }
}

fn as_number(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        serde_json::Value::Bool(true) => 1.0,
        serde_json::Value::Bool(false) => 0.0,
        _ => f64::NAN,
    }
}

fn as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
