//! Predicates over entity fields.
//!
//! A [`Query`] names fields by their Rust names. Resolving it against a schema turns it
//! into a [`Filter`] over wire paths, which is evaluated directly on raw record lines so
//! that only matching records are ever fully decoded.

mod extract;

pub use extract::extract;

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{Number, Value};

use crate::engine::master::SLAVE_FIELD;
use crate::schema::Describe;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum Comparator {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Lt(Value),
    MemberOf(Vec<Value>),
    NotMemberOf(Vec<Value>),
    /// Matches when the expression is found anywhere in a string value.
    Pattern(Regex),
}

#[derive(Debug, Clone)]
pub struct Predicate {
    /// Dotted field path, using field names rather than wire names.
    pub field: String,
    pub comparator: Comparator,
}

/// A tree of predicates combined with AND and OR.
#[derive(Debug, Clone)]
pub enum Query {
    Where(Predicate),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
}

impl Query {
    pub fn predicate(field: impl Into<String>, comparator: Comparator) -> Self {
        Query::Where(Predicate {
            field: field.into(),
            comparator,
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::predicate(field, Comparator::Eq(value.into()))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::predicate(field, Comparator::Ne(value.into()))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::predicate(field, Comparator::Gt(value.into()))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::predicate(field, Comparator::Lt(value.into()))
    }

    pub fn member_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::predicate(field, Comparator::MemberOf(values.into_iter().map(Into::into).collect()))
    }

    pub fn not_member_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::predicate(field, Comparator::NotMemberOf(values.into_iter().map(Into::into).collect()))
    }

    pub fn pattern(field: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self::predicate(field, Comparator::Pattern(Regex::new(pattern)?)))
    }

    pub fn and(self, other: Query) -> Self {
        Query::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Query) -> Self {
        Query::Or(Box::new(self), Box::new(other))
    }

    /// AND of every query, or `None` when there are none.
    pub fn all<I: IntoIterator<Item = Query>>(queries: I) -> Option<Self> {
        queries.into_iter().reduce(Query::and)
    }

    /// OR of every query, or `None` when there are none.
    pub fn any<I: IntoIterator<Item = Query>>(queries: I) -> Option<Self> {
        queries.into_iter().reduce(Query::or)
    }

    /// Maps field names to wire paths inside a master record line.
    pub fn resolve(&self, schema: &dyn Describe) -> Result<Filter> {
        Ok(match self {
            Query::Where(predicate) => {
                let (path, datetime) = resolve_path(schema, &predicate.field)?;
                Filter::Leaf {
                    path,
                    comparator: predicate.comparator.clone(),
                    datetime,
                }
            }
            Query::And(left, right) => Filter::And(Box::new(left.resolve(schema)?), Box::new(right.resolve(schema)?)),
            Query::Or(left, right) => Filter::Or(Box::new(left.resolve(schema)?), Box::new(right.resolve(schema)?)),
        })
    }
}

fn resolve_path(schema: &dyn Describe, field: &str) -> Result<(Vec<String>, bool)> {
    let unknown = || Error::UnknownField {
        entity: schema.entity_name().to_string(),
        field: field.to_string(),
    };

    let mut path = vec![SLAVE_FIELD.to_string()];
    let mut current = schema;
    let mut segments = field.split('.').peekable();
    while let Some(segment) = segments.next() {
        let info = current.field_info(segment).ok_or_else(unknown)?;
        let last = segments.peek().is_none();
        // Virtual fields are never on disk and list elements cannot be addressed by name.
        if info.is_virtual || (info.is_list() && !last) {
            return Err(Error::NotQueryable {
                entity: current.entity_name().to_string(),
                field: segment.to_string(),
            });
        }
        path.push(info.wire_name.to_string());
        if last {
            return Ok((path, info.datetime));
        }
        current = info.nested.map(|nested| nested()).ok_or_else(unknown)?;
    }
    Err(unknown())
}

/// A resolved query, evaluated against record lines.
#[derive(Debug, Clone)]
pub enum Filter {
    Leaf {
        path: Vec<String>,
        comparator: Comparator,
        datetime: bool,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn field_equals(path: Vec<String>, value: Value) -> Self {
        Filter::Leaf {
            path,
            comparator: Comparator::Eq(value),
            datetime: false,
        }
    }

    /// Tests a raw line, parsing only the fields the filter names.
    pub fn matches_line(&self, line: &str) -> serde_json::Result<bool> {
        match self {
            Filter::Leaf {
                path,
                comparator,
                datetime,
            } => Ok(match extract(line, path)? {
                Some(actual) => comparator.test(&actual, *datetime),
                None => false,
            }),
            Filter::And(left, right) => Ok(left.matches_line(line)? && right.matches_line(line)?),
            Filter::Or(left, right) => Ok(left.matches_line(line)? || right.matches_line(line)?),
        }
    }
}

impl Comparator {
    /// Null never matches, whatever the comparator.
    pub fn test(&self, actual: &Value, datetime: bool) -> bool {
        if actual.is_null() {
            return false;
        }
        match self {
            Comparator::Eq(expected) => equals(actual, expected, datetime),
            Comparator::Ne(expected) => !equals(actual, expected, datetime),
            Comparator::Gt(expected) => ordering(actual, expected, datetime) == Some(Ordering::Greater),
            Comparator::Lt(expected) => ordering(actual, expected, datetime) == Some(Ordering::Less),
            Comparator::MemberOf(values) => values.iter().any(|v| equals(actual, v, datetime)),
            Comparator::NotMemberOf(values) => !values.iter().any(|v| equals(actual, v, datetime)),
            Comparator::Pattern(regex) => actual.as_str().map_or(false, |text| regex.is_match(text)),
        }
    }
}

fn equals(actual: &Value, expected: &Value, datetime: bool) -> bool {
    match ordering(actual, expected, datetime) {
        Some(order) => order == Ordering::Equal,
        None => actual == expected,
    }
}

fn ordering(actual: &Value, expected: &Value, datetime: bool) -> Option<Ordering> {
    if datetime {
        if let (Some(a), Some(b)) = (parse_datetime(actual), parse_datetime(expected)) {
            return Some(a.cmp(&b));
        }
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return Some(a.cmp(&b));
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// Reads RFC 3339, naive ISO-8601 timestamps and plain dates, all as UTC.
fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
