//! Trigger predicate evaluation.
//!
//! Predicates are JSON documents stored alongside each trigger entry. The
//! engine parses each one once through a [`PredicateCache`]:
//!
//! ```text
//! {"and": [..]} | {"or": [..]} | {"not": {..}}
//! {"key": "event_name", "scope": ["properties"], "value": <matcher>}
//! matcher: {"equals": v} | {"at_least": n, "at_most": n} | {"is_present": b}
//!          | {"contains": s} | {"array_contains": <matcher>, "index": i}
//! ```

use serde_json::Value;
use std::collections::HashMap;

use crate::automation::types::{TriggerEntry, TriggerType};
use crate::error::{AutomationError, AutomationResult};
use crate::events::AutomationEvent;

/// Outcome of evaluating one event against one trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Whether the event satisfied the trigger
    pub matches: bool,
    /// Increment to apply to the trigger's progress
    pub value: f64,
}

impl MatchResult {
    /// The event did not match.
    pub const NO_MATCH: MatchResult = MatchResult {
        matches: false,
        value: 0.0,
    };

    fn matched(value: f64) -> Self {
        Self {
            matches: true,
            value,
        }
    }
}

/// Evaluate an event against a persisted trigger entry.
pub fn evaluate(event: &AutomationEvent, entry: &TriggerEntry) -> MatchResult {
    evaluate_trigger(event, entry.trigger_type, entry.predicate.as_ref())
}

/// Evaluate an event against a trigger type and optional predicate.
///
/// Malformed predicates never match.
pub fn evaluate_trigger(
    event: &AutomationEvent,
    trigger_type: TriggerType,
    predicate: Option<&Value>,
) -> MatchResult {
    if !event.trigger_types().contains(&trigger_type) {
        return MatchResult::NO_MATCH;
    }
    match predicate {
        None => increment(event, trigger_type, None),
        Some(raw) => match parse_or_warn(raw, trigger_type) {
            Some(parsed) => increment(event, trigger_type, Some(&parsed)),
            None => MatchResult::NO_MATCH,
        },
    }
}

fn parse_or_warn(raw: &Value, trigger_type: TriggerType) -> Option<Predicate> {
    match Predicate::parse(raw) {
        Ok(predicate) => Some(predicate),
        Err(e) => {
            tracing::warn!(
                trigger_type = %trigger_type,
                error = %e,
                "Ignoring trigger with malformed predicate"
            );
            None
        }
    }
}

fn increment(
    event: &AutomationEvent,
    trigger_type: TriggerType,
    predicate: Option<&Predicate>,
) -> MatchResult {
    if let Some(predicate) = predicate {
        if !predicate.apply(&event.payload()) {
            return MatchResult::NO_MATCH;
        }
    }

    match trigger_type {
        TriggerType::CustomEventValue => MatchResult::matched(event.value().unwrap_or(1.0)),
        _ => MatchResult::matched(1.0),
    }
}

#[derive(Debug)]
struct CachedPredicate {
    schedule_id: String,
    /// `None` when the stored predicate is malformed
    predicate: Option<Predicate>,
}

/// Parsed predicates keyed by trigger entry id.
///
/// Trigger ids are never reused, so an entry stays valid until its schedule
/// is deleted and [`PredicateCache::forget_schedules`] drops it.
#[derive(Debug, Default)]
pub struct PredicateCache {
    parsed: HashMap<i64, CachedPredicate>,
}

impl PredicateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`evaluate`], parsing each entry's predicate at most once.
    pub fn evaluate(&mut self, event: &AutomationEvent, entry: &TriggerEntry) -> MatchResult {
        if !event.trigger_types().contains(&entry.trigger_type) {
            return MatchResult::NO_MATCH;
        }
        let Some(raw) = entry.predicate.as_ref() else {
            return increment(event, entry.trigger_type, None);
        };

        let cached = self
            .parsed
            .entry(entry.id)
            .or_insert_with(|| CachedPredicate {
                schedule_id: entry.schedule_id.clone(),
                predicate: parse_or_warn(raw, entry.trigger_type),
            });
        match &cached.predicate {
            Some(predicate) => increment(event, entry.trigger_type, Some(predicate)),
            None => MatchResult::NO_MATCH,
        }
    }

    /// Drop the predicates of deleted schedules.
    pub fn forget_schedules(&mut self, schedule_ids: &[String]) {
        if schedule_ids.is_empty() {
            return;
        }
        self.parsed
            .retain(|_, cached| !schedule_ids.contains(&cached.schedule_id));
    }

    /// Number of parsed predicates held.
    pub fn len(&self) -> usize {
        self.parsed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty()
    }
}

/// Parsed predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Field {
        /// Key to look up; `None` applies the matcher to the scoped value itself
        key: Option<String>,
        /// Object path walked before the key lookup
        scope: Vec<String>,
        matcher: Matcher,
    },
}

/// Comparison applied to a single JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    Equals(Value),
    Range {
        at_least: Option<f64>,
        at_most: Option<f64>,
    },
    IsPresent(bool),
    Contains(String),
    ArrayContains {
        matcher: Box<Matcher>,
        index: Option<usize>,
    },
}

impl Predicate {
    /// Parse a predicate from its JSON form.
    pub fn parse(value: &Value) -> AutomationResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| AutomationError::predicate("predicate must be an object"))?;

        if let Some(children) = obj.get("and") {
            return Ok(Predicate::And(parse_children("and", children)?));
        }
        if let Some(children) = obj.get("or") {
            return Ok(Predicate::Or(parse_children("or", children)?));
        }
        if let Some(child) = obj.get("not") {
            return Ok(Predicate::Not(Box::new(Predicate::parse(child)?)));
        }

        let matcher = obj
            .get("value")
            .ok_or_else(|| AutomationError::predicate("predicate requires a value matcher"))?;
        let key = match obj.get("key") {
            None | Some(Value::Null) => None,
            Some(Value::String(key)) => Some(key.clone()),
            Some(_) => return Err(AutomationError::predicate("predicate key must be a string")),
        };
        let scope = match obj.get("scope") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| AutomationError::predicate("scope entries must be strings"))
                })
                .collect::<AutomationResult<Vec<_>>>()?,
            Some(_) => return Err(AutomationError::predicate("scope must be a string or array")),
        };

        Ok(Predicate::Field {
            key,
            scope,
            matcher: Matcher::parse(matcher)?,
        })
    }

    /// Apply the predicate to an event payload.
    pub fn apply(&self, payload: &Value) -> bool {
        match self {
            Predicate::And(children) => children.iter().all(|p| p.apply(payload)),
            Predicate::Or(children) => children.iter().any(|p| p.apply(payload)),
            Predicate::Not(child) => !child.apply(payload),
            Predicate::Field {
                key,
                scope,
                matcher,
            } => {
                let mut current = Some(payload);
                for segment in scope {
                    current = current.and_then(|v| v.get(segment));
                }
                if let Some(key) = key {
                    current = current.and_then(|v| v.get(key));
                }
                matcher.apply(current)
            }
        }
    }
}

fn parse_children(op: &str, value: &Value) -> AutomationResult<Vec<Predicate>> {
    let items = value
        .as_array()
        .ok_or_else(|| AutomationError::predicate(format!("'{}' requires an array", op)))?;
    items.iter().map(Predicate::parse).collect()
}

impl Matcher {
    /// Parse a value matcher from its JSON form.
    pub fn parse(value: &Value) -> AutomationResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| AutomationError::predicate("value matcher must be an object"))?;

        if let Some(expected) = obj.get("equals") {
            return Ok(Matcher::Equals(expected.clone()));
        }
        if obj.contains_key("at_least") || obj.contains_key("at_most") {
            let bound = |name: &str| -> AutomationResult<Option<f64>> {
                match obj.get(name) {
                    None | Some(Value::Null) => Ok(None),
                    Some(v) => v.as_f64().map(Some).ok_or_else(|| {
                        AutomationError::predicate(format!("'{}' must be a number", name))
                    }),
                }
            };
            return Ok(Matcher::Range {
                at_least: bound("at_least")?,
                at_most: bound("at_most")?,
            });
        }
        if let Some(present) = obj.get("is_present") {
            let present = present
                .as_bool()
                .ok_or_else(|| AutomationError::predicate("'is_present' must be a boolean"))?;
            return Ok(Matcher::IsPresent(present));
        }
        if let Some(needle) = obj.get("contains") {
            let needle = needle
                .as_str()
                .ok_or_else(|| AutomationError::predicate("'contains' must be a string"))?;
            return Ok(Matcher::Contains(needle.to_string()));
        }
        if let Some(inner) = obj.get("array_contains") {
            let index = match obj.get("index") {
                None | Some(Value::Null) => None,
                Some(v) => Some(v.as_u64().ok_or_else(|| {
                    AutomationError::predicate("'index' must be a non-negative integer")
                })? as usize),
            };
            return Ok(Matcher::ArrayContains {
                matcher: Box::new(Matcher::parse(inner)?),
                index,
            });
        }

        Err(AutomationError::predicate(format!(
            "unknown value matcher: {}",
            value
        )))
    }

    /// Apply the matcher to a possibly missing value.
    pub fn apply(&self, value: Option<&Value>) -> bool {
        match self {
            Matcher::IsPresent(expected) => {
                let present = !matches!(value, None | Some(Value::Null));
                present == *expected
            }
            Matcher::Equals(expected) => value.is_some_and(|v| json_eq(v, expected)),
            Matcher::Range { at_least, at_most } => match value.and_then(Value::as_f64) {
                Some(n) => {
                    at_least.map_or(true, |min| n >= min) && at_most.map_or(true, |max| n <= max)
                }
                None => false,
            },
            Matcher::Contains(needle) => value
                .and_then(Value::as_str)
                .is_some_and(|s| s.contains(needle.as_str())),
            Matcher::ArrayContains { matcher, index } => {
                let Some(items) = value.and_then(Value::as_array) else {
                    return false;
                };
                match index {
                    Some(i) => items.get(*i).is_some_and(|item| matcher.apply(Some(item))),
                    None => items.iter().any(|item| matcher.apply(Some(item))),
                }
            }
        }
    }
}

/// JSON equality with numbers compared as f64.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}
