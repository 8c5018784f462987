//! Server-side event filters.
//!
//! Filters use the `field=eq.value[,field2=eq.value2]` syntax and are a pure
//! conjunction of equality constraints. Disjunctions and other operators are
//! rejected when parsed.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::{ChangeEvent, FeedError, Operation, Result};

/// Which operations a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// `*`: every operation.
    #[default]
    All,
}

impl EventKind {
    pub fn matches(&self, operation: Operation) -> bool {
        match self {
            Self::All => true,
            Self::Insert => operation == Operation::Insert,
            Self::Update => operation == Operation::Update,
            Self::Delete => operation == Operation::Delete,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::All => "*",
        })
    }
}

impl FromStr for EventKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "*" => Ok(Self::All),
            other => Err(FeedError::InvalidFilter {
                filter: other.to_string(),
                reason: "event must be one of INSERT, UPDATE, DELETE or *".to_string(),
            }),
        }
    }
}

/// One `field=eq.value` constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldCondition {
    pub field: String,
    pub value: String,
}

impl FieldCondition {
    fn matches_row(&self, row: &Value) -> bool {
        match row.get(&self.field) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            Some(Value::Bool(b)) => b.to_string() == self.value,
            Some(Value::Null) => self.value == "null",
            _ => false,
        }
    }
}

/// Conjunctive filter over one collection's rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct EventFilter {
    event: EventKind,
    conditions: Vec<FieldCondition>,
}

impl EventFilter {
    /// Every operation, no field constraints.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the given operation kind.
    pub fn on(event: EventKind) -> Self {
        Self {
            event,
            conditions: Vec::new(),
        }
    }

    /// Add an equality constraint.
    pub fn eq(mut self, field: impl Into<String>, value: impl ToString) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            value: value.to_string(),
        });
        self
    }

    /// Parse `field=eq.value[,field2=eq.value2]`. An empty string matches all rows.
    pub fn parse(event: EventKind, filter: &str) -> Result<Self> {
        let invalid = |reason: &str| FeedError::InvalidFilter {
            filter: filter.to_string(),
            reason: reason.to_string(),
        };

        let mut conditions = Vec::new();
        for clause in filter.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let (field, rest) = clause
                .split_once('=')
                .ok_or_else(|| invalid("expected field=op.value"))?;
            if field == "or" || field == "and" || field.contains('(') {
                return Err(invalid("only a conjunction of equality constraints is supported"));
            }
            if field.is_empty()
                || !field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(invalid("field names must be alphanumeric"));
            }
            let (op, value) = rest
                .split_once('.')
                .ok_or_else(|| invalid("expected op.value after '='"))?;
            if op != "eq" {
                return Err(invalid("only the 'eq' operator is supported"));
            }
            if value.is_empty() {
                return Err(invalid("value cannot be empty"));
            }
            conditions.push(FieldCondition {
                field: field.to_string(),
                value: value.to_string(),
            });
        }

        Ok(Self { event, conditions })
    }

    pub fn event(&self) -> EventKind {
        self.event
    }

    pub fn conditions(&self) -> &[FieldCondition] {
        &self.conditions
    }

    /// True if the row satisfies every constraint.
    pub fn matches_row(&self, row: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches_row(row))
    }

    /// Decide whether an event is delivered to this subscription.
    ///
    /// Inserts match on the new row, deletes on the old row. Updates match
    /// when either side matches so subscribers see records leave the filter.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.event.matches(event.operation) {
            return false;
        }
        if self.conditions.is_empty() {
            return true;
        }
        let new_matches = event.new_value.as_ref().is_some_and(|v| self.matches_row(v));
        let old_matches = event.old_value.as_ref().is_some_and(|v| self.matches_row(v));
        match event.operation {
            Operation::Insert => new_matches,
            Operation::Update => new_matches || old_matches,
            Operation::Delete => old_matches,
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.event)?;
        if self.conditions.is_empty() {
            return f.write_str("*");
        }
        let clauses: Vec<String> = self
            .conditions
            .iter()
            .map(|c| format!("{}=eq.{}", c.field, c.value))
            .collect();
        f.write_str(&clauses.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(old: Value, new: Value) -> ChangeEvent {
        ChangeEvent {
            entity: "services".to_string(),
            operation: Operation::Update,
            new_value: Some(new),
            old_value: Some(old),
        }
    }

    #[test]
    fn test_parse_conjunction() {
        let filter =
            EventFilter::parse(EventKind::All, "status=eq.available,branch_ref=eq.b-1").unwrap();
        assert_eq!(filter.conditions().len(), 2);
        assert_eq!(filter.conditions()[1].field, "branch_ref");
        assert_eq!(filter.to_string(), "*:status=eq.available,branch_ref=eq.b-1");
    }

    #[test]
    fn test_parse_empty_matches_everything() {
        let filter = EventFilter::parse(EventKind::Insert, "").unwrap();
        assert!(filter.conditions().is_empty());
        assert_eq!(filter.to_string(), "INSERT:*");
    }

    #[test]
    fn test_parse_rejects_disjunction_and_other_operators() {
        assert!(EventFilter::parse(EventKind::All, "or=(status.eq.a,status.eq.b)").is_err());
        assert!(EventFilter::parse(EventKind::All, "amount=gt.5").is_err());
        assert!(EventFilter::parse(EventKind::All, "status").is_err());
        assert!(EventFilter::parse(EventKind::All, "status=eq.").is_err());
    }

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!("*".parse::<EventKind>().unwrap(), EventKind::All);
        assert_eq!("update".parse::<EventKind>().unwrap(), EventKind::Update);
        assert!("upsert".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_row_matching_by_value_type() {
        let filter = EventFilter::all().eq("low_demand_enabled", true).eq("max", 3);
        assert!(filter.matches_row(&json!({"low_demand_enabled": true, "max": 3})));
        assert!(!filter.matches_row(&json!({"low_demand_enabled": false, "max": 3})));
        assert!(!filter.matches_row(&json!({"max": 3})));

        let null_filter = EventFilter::all().eq("assigned_courier_ref", "null");
        assert!(null_filter.matches_row(&json!({"assigned_courier_ref": null})));
    }

    #[test]
    fn test_update_matches_when_record_leaves_filter() {
        let filter = EventFilter::all().eq("status", "available");
        let leaving = update(json!({"status": "available"}), json!({"status": "assigned"}));
        let entering = update(json!({"status": "assigned"}), json!({"status": "available"}));
        let unrelated = update(json!({"status": "assigned"}), json!({"status": "en_route"}));
        assert!(filter.matches(&leaving));
        assert!(filter.matches(&entering));
        assert!(!filter.matches(&unrelated));
    }

    #[test]
    fn test_event_kind_restricts_operations() {
        let filter = EventFilter::on(EventKind::Insert);
        let event = update(json!({}), json!({}));
        assert!(!filter.matches(&event));
    }
}
