//! Metadata filters for selecting events out of a shared stream.

use std::cmp::Ordering;

use crate::message::{Message, MetadataValue};

/// Comparison applied between an event's metadata entry and a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEquals,
    LowerThan,
    LowerThanEquals,
}

impl Operator {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Equals => ordering == Ordering::Equal,
            Self::NotEquals => ordering != Ordering::Equal,
            Self::GreaterThan => ordering == Ordering::Greater,
            Self::GreaterThanEquals => ordering != Ordering::Less,
            Self::LowerThan => ordering == Ordering::Less,
            Self::LowerThanEquals => ordering != Ordering::Greater,
        }
    }
}

/// One `field <op> value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: MetadataValue,
}

/// A conjunction of metadata conditions.
///
/// An event matches when every condition holds. A missing metadata entry
/// or a type mismatch fails the condition, except for
/// [`Operator::NotEquals`], which treats a missing entry as "not equal".
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::{Message, MetadataMatcher, Operator};
/// use serde_json::json;
///
/// let matcher = MetadataMatcher::new()
///     .with("_aggregate_id", Operator::Equals, "1")
///     .with("_aggregate_version", Operator::GreaterThanEquals, 2u64);
///
/// let event = Message::event("UserNameChanged", json!({"id": "1"}))
///     .unwrap()
///     .with_added_metadata("_aggregate_id", "1")
///     .with_added_metadata("_aggregate_version", 2u64);
/// assert!(matcher.matches(&event));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataMatcher {
    conditions: Vec<Condition>,
}

impl MetadataMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition, returning the extended matcher.
    pub fn with(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<MetadataValue>,
    ) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            operator,
            value: value.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether `message` satisfies every condition.
    pub fn matches(&self, message: &Message) -> bool {
        self.conditions.iter().all(|c| {
            match message
                .metadata_value(&c.field)
                .and_then(|actual| actual.compare(&c.value))
            {
                Some(ordering) => c.operator.accepts(ordering),
                None => c.operator == Operator::NotEquals,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stamped(id: &str, version: u64) -> Message {
        Message::event("UserNameChanged", json!({"id": id}))
            .unwrap()
            .with_added_metadata("_aggregate_id", id)
            .with_added_metadata("_aggregate_type", "user")
            .with_added_metadata("_aggregate_version", version)
    }

    #[test]
    fn empty_matcher_matches_everything() {
        assert!(MetadataMatcher::new().matches(&stamped("1", 1)));
    }

    #[test]
    fn equality_on_id_and_type() {
        let m = MetadataMatcher::new()
            .with("_aggregate_id", Operator::Equals, "1")
            .with("_aggregate_type", Operator::Equals, "user");
        assert!(m.matches(&stamped("1", 4)));
        assert!(!m.matches(&stamped("2", 4)));
    }

    #[test]
    fn version_lower_bound_is_inclusive() {
        let m = MetadataMatcher::new().with("_aggregate_version", Operator::GreaterThanEquals, 3u64);
        assert!(!m.matches(&stamped("1", 2)));
        assert!(m.matches(&stamped("1", 3)));
        assert!(m.matches(&stamped("1", 4)));
    }

    #[test]
    fn strict_and_upper_bounds() {
        let event = stamped("1", 5);
        let check = |op, v: u64| {
            MetadataMatcher::new()
                .with("_aggregate_version", op, v)
                .matches(&event)
        };
        assert!(check(Operator::GreaterThan, 4));
        assert!(!check(Operator::GreaterThan, 5));
        assert!(check(Operator::LowerThan, 6));
        assert!(check(Operator::LowerThanEquals, 5));
        assert!(!check(Operator::LowerThanEquals, 4));
        assert!(check(Operator::NotEquals, 4));
    }

    #[test]
    fn missing_field_fails_except_not_equals() {
        let bare = Message::event("UserNameChanged", json!({})).unwrap();
        assert!(
            !MetadataMatcher::new()
                .with("_aggregate_id", Operator::Equals, "1")
                .matches(&bare)
        );
        assert!(
            MetadataMatcher::new()
                .with("_aggregate_id", Operator::NotEquals, "1")
                .matches(&bare)
        );
    }

    #[test]
    fn type_mismatch_does_not_match() {
        let m = MetadataMatcher::new().with("_aggregate_version", Operator::GreaterThanEquals, "1");
        assert!(!m.matches(&stamped("1", 9)));
    }
}
