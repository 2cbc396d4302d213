//! Document filters.
//!
//! Filters are evaluated against documents after candidate retrieval. Leaf
//! filters on an indexed field may also be answered by the index; the
//! collection read path decides which.

use crate::error::Result;
use crate::index::{Geometry, TextTokenizer};
use crate::{Document, Error, Value};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;

/// Field name an [`Filter::ElemMatch`] inner filter uses to address a
/// scalar array element.
pub const ELEMENT: &str = "$";

/// A compiled regular expression. Two patterns are equal when their source
/// text is.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|e| Error::Validation(format!("invalid regex '{pattern}': {e}")))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.as_str())
    }
}

/// A filter over documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,

    // Comparisons
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Between {
        field: String,
        lower: Value,
        upper: Value,
        lower_inclusive: bool,
        upper_inclusive: bool,
    },

    /// String value matched by a regular expression.
    Regex(String, Pattern),
    /// Array with at least one element matching the inner filter. Document
    /// elements are filtered by their own fields, scalars through
    /// [`ELEMENT`].
    ElemMatch(String, Box<Filter>),

    // Full-text search
    Text(String, String),

    // Spatial
    Intersects(String, Geometry),
    Within(String, Geometry),
    /// Field geometry lies within `distance` of the point `(x, y)`.
    Near(String, f64, f64, f64),

    // Boolean logic
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

/// Start a filter on a field: `field("age").gt(30)`.
pub fn field(name: impl Into<String>) -> FieldFilter {
    FieldFilter { name: name.into() }
}

/// Filter builder for one field.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    name: String,
}

impl FieldFilter {
    pub fn eq(self, value: impl Into<Value>) -> Filter {
        Filter::Eq(self.name, value.into())
    }

    pub fn ne(self, value: impl Into<Value>) -> Filter {
        Filter::Ne(self.name, value.into())
    }

    pub fn gt(self, value: impl Into<Value>) -> Filter {
        Filter::Gt(self.name, value.into())
    }

    pub fn gte(self, value: impl Into<Value>) -> Filter {
        Filter::Gte(self.name, value.into())
    }

    pub fn lt(self, value: impl Into<Value>) -> Filter {
        Filter::Lt(self.name, value.into())
    }

    pub fn lte(self, value: impl Into<Value>) -> Filter {
        Filter::Lte(self.name, value.into())
    }

    pub fn in_values<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Filter {
        Filter::In(self.name, values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Filter {
        Filter::NotIn(self.name, values.into_iter().map(Into::into).collect())
    }

    /// Inclusive range.
    pub fn between(self, lower: impl Into<Value>, upper: impl Into<Value>) -> Filter {
        self.between_with(lower, upper, true, true)
    }

    pub fn between_with(
        self,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
        lower_inclusive: bool,
        upper_inclusive: bool,
    ) -> Filter {
        Filter::Between {
            field: self.name,
            lower: lower.into(),
            upper: upper.into(),
            lower_inclusive,
            upper_inclusive,
        }
    }

    /// Fails when `pattern` does not compile.
    pub fn regex(self, pattern: &str) -> Result<Filter> {
        Ok(Filter::Regex(self.name, Pattern::new(pattern)?))
    }

    pub fn elem_match(self, filter: Filter) -> Filter {
        Filter::ElemMatch(self.name, Box::new(filter))
    }

    pub fn text(self, query: impl Into<String>) -> Filter {
        Filter::Text(self.name, query.into())
    }

    pub fn intersects(self, geometry: Geometry) -> Filter {
        Filter::Intersects(self.name, geometry)
    }

    pub fn within(self, geometry: Geometry) -> Filter {
        Filter::Within(self.name, geometry)
    }

    pub fn near(self, x: f64, y: f64, distance: f64) -> Filter {
        Filter::Near(self.name, x, y, distance)
    }
}

/// Order two values of the same kind. Values of different kinds are not
/// comparable.
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if left.kind_rank() == right.kind_rank() {
        Some(left.cmp(right))
    } else {
        None
    }
}

/// Apply a predicate to a field value. Arrays match when any element does,
/// unless the filter value is itself an array.
fn any_element(value: &Value, operand: &Value, predicate: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) if !matches!(operand, Value::Array(_)) => items.iter().any(predicate),
        other => predicate(other),
    }
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, other) | (other, Filter::All) => other,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), other) => {
                left.push(other);
                Filter::And(left)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::Or(mut left), Filter::Or(right)) => {
                left.extend(right);
                Filter::Or(left)
            }
            (Filter::Or(mut left), other) => {
                left.push(other);
                Filter::Or(left)
            }
            (this, other) => Filter::Or(vec![this, other]),
        }
    }

    pub fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Field a leaf filter applies to. `None` for `All` and boolean filters.
    pub fn field(&self) -> Option<&str> {
        match self {
            Filter::Eq(f, _)
            | Filter::Ne(f, _)
            | Filter::Gt(f, _)
            | Filter::Gte(f, _)
            | Filter::Lt(f, _)
            | Filter::Lte(f, _)
            | Filter::In(f, _)
            | Filter::NotIn(f, _)
            | Filter::Between { field: f, .. }
            | Filter::Regex(f, _)
            | Filter::ElemMatch(f, _)
            | Filter::Text(f, _)
            | Filter::Intersects(f, _)
            | Filter::Within(f, _)
            | Filter::Near(f, ..) => Some(f),
            Filter::All | Filter::And(_) | Filter::Or(_) | Filter::Not(_) => None,
        }
    }

    /// Evaluate with the default tokenizer.
    pub fn matches(&self, doc: &Document) -> Result<bool> {
        self.matches_with(doc, &TextTokenizer::default())
    }

    /// Evaluate against a document. Text filters use `tokenizer`. Malformed
    /// text queries are an error; a field holding something that is not a
    /// geometry simply does not match a spatial filter.
    pub fn matches_with(&self, doc: &Document, tokenizer: &TextTokenizer) -> Result<bool> {
        let null = Value::Null;
        let value_of = |name: &str| doc.get(name).unwrap_or(&null);

        let matched = match self {
            Filter::All => true,

            Filter::Eq(f, v) => any_element(value_of(f), v, |x| x == v),
            Filter::Ne(f, v) => !any_element(value_of(f), v, |x| x == v),
            Filter::Gt(f, v) => any_element(value_of(f), v, |x| {
                compare_values(x, v) == Some(Ordering::Greater)
            }),
            Filter::Gte(f, v) => any_element(value_of(f), v, |x| {
                matches!(compare_values(x, v), Some(Ordering::Greater | Ordering::Equal))
            }),
            Filter::Lt(f, v) => any_element(value_of(f), v, |x| {
                compare_values(x, v) == Some(Ordering::Less)
            }),
            Filter::Lte(f, v) => any_element(value_of(f), v, |x| {
                matches!(compare_values(x, v), Some(Ordering::Less | Ordering::Equal))
            }),
            Filter::In(f, values) => values
                .iter()
                .any(|v| any_element(value_of(f), v, |x| x == v)),
            Filter::NotIn(f, values) => !values
                .iter()
                .any(|v| any_element(value_of(f), v, |x| x == v)),
            Filter::Between {
                field: f,
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
            } => any_element(value_of(f), lower, |x| {
                let above = match compare_values(x, lower) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => *lower_inclusive,
                    _ => false,
                };
                let below = match compare_values(x, upper) {
                    Some(Ordering::Less) => true,
                    Some(Ordering::Equal) => *upper_inclusive,
                    _ => false,
                };
                above && below
            }),

            Filter::Regex(f, pattern) => any_element(value_of(f), &null, |x| {
                x.as_str().is_some_and(|text| pattern.is_match(text))
            }),
            Filter::ElemMatch(f, inner) => {
                inner.check_element_filter()?;
                let Value::Array(items) = value_of(f) else {
                    return Ok(false);
                };
                for item in items {
                    let element = match item {
                        Value::Document(doc) => doc.clone(),
                        scalar => Document::new().with(ELEMENT, scalar.clone()),
                    };
                    if inner.matches_with(&element, tokenizer)? {
                        return Ok(true);
                    }
                }
                false
            }

            Filter::Text(f, query) => tokenizer.matches(f, doc.get(f), query)?,

            Filter::Intersects(f, geometry) => {
                stored_geometry(doc, f).is_some_and(|g| g.intersects(geometry))
            }
            Filter::Within(f, geometry) => {
                stored_geometry(doc, f).is_some_and(|g| g.within(geometry))
            }
            Filter::Near(f, x, y, distance) => {
                stored_geometry(doc, f).is_some_and(|g| g.is_near(*x, *y, *distance))
            }

            Filter::And(filters) => {
                for filter in filters {
                    if !filter.matches_with(doc, tokenizer)? {
                        return Ok(false);
                    }
                }
                true
            }
            Filter::Or(filters) => {
                for filter in filters {
                    if filter.matches_with(doc, tokenizer)? {
                        return Ok(true);
                    }
                }
                false
            }
            Filter::Not(filter) => !filter.matches_with(doc, tokenizer)?,
        };
        Ok(matched)
    }
}

impl Filter {
    /// Element filters cannot nest another element match or search text.
    fn check_element_filter(&self) -> Result<()> {
        match self {
            Filter::ElemMatch(..) => Err(Error::Validation(
                "nested elem_match is not supported".into(),
            )),
            Filter::Text(..) => Err(Error::Validation(
                "full-text search is not supported inside elem_match".into(),
            )),
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().try_for_each(Filter::check_element_filter)
            }
            Filter::Not(filter) => filter.check_element_filter(),
            _ => Ok(()),
        }
    }
}

fn stored_geometry(doc: &Document, field: &str) -> Option<Geometry> {
    doc.get(field).and_then(|v| Geometry::from_value(v).ok())
}
