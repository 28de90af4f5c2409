//! Query predicate builder
//!
//! Queries are built as a structured [`SoqlQuery`] and rendered to text only at
//! the HTTP boundary. All literal quoting happens in [`Literal::render`], so
//! tag and username values can never break out of their string literal.

use chrono::{DateTime, NaiveDate, Utc};
use std::fmt::Write as _;

/// Which query endpoint serves the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryApi {
    /// Standard data API
    #[default]
    Data,
    /// Tooling API (e.g. `SandboxProcess`)
    Tooling,
}

/// Literal value in a predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Quoted string
    Str(String),
    /// Integer
    Int(i64),
    /// Boolean
    Bool(bool),
    /// Calendar date (unquoted `YYYY-MM-DD`)
    Date(NaiveDate),
    /// Timestamp (unquoted ISO-8601, UTC)
    DateTime(DateTime<Utc>),
    /// `null`
    Null,
}

impl Literal {
    /// Render as query text
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => format!("'{}'", escape(s)),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::DateTime(ts) => ts.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            Self::Null => "null".to_string(),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for Literal {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<NaiveDate> for Literal {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Escape a value for use inside a single-quoted literal
#[must_use]
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Predicate tree
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field op literal`
    Cmp {
        field: String,
        op: CmpOp,
        value: Literal,
    },
    /// `field IN (...)` or `field NOT IN (...)`
    In {
        field: String,
        values: Vec<Literal>,
        negated: bool,
    },
    /// Conjunction
    And(Vec<Condition>),
    /// Disjunction
    Or(Vec<Condition>),
    /// Negation
    Not(Box<Condition>),
}

impl Condition {
    fn cmp(field: &str, op: CmpOp, value: impl Into<Literal>) -> Self {
        Self::Cmp {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    /// `field = value`
    pub fn eq(field: &str, value: impl Into<Literal>) -> Self {
        Self::cmp(field, CmpOp::Eq, value)
    }

    /// `field != value`
    pub fn ne(field: &str, value: impl Into<Literal>) -> Self {
        Self::cmp(field, CmpOp::Ne, value)
    }

    /// `field < value`
    pub fn lt(field: &str, value: impl Into<Literal>) -> Self {
        Self::cmp(field, CmpOp::Lt, value)
    }

    /// `field <= value`
    pub fn le(field: &str, value: impl Into<Literal>) -> Self {
        Self::cmp(field, CmpOp::Le, value)
    }

    /// `field > value`
    pub fn gt(field: &str, value: impl Into<Literal>) -> Self {
        Self::cmp(field, CmpOp::Gt, value)
    }

    /// `field >= value`
    pub fn ge(field: &str, value: impl Into<Literal>) -> Self {
        Self::cmp(field, CmpOp::Ge, value)
    }

    /// `field IN (values)`
    pub fn is_in<L: Into<Literal>>(field: &str, values: impl IntoIterator<Item = L>) -> Self {
        Self::In {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// `field NOT IN (values)`
    pub fn not_in<L: Into<Literal>>(field: &str, values: impl IntoIterator<Item = L>) -> Self {
        Self::In {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    /// Conjunction with another condition, flattening nested `And`s
    #[must_use]
    pub fn and(self, other: Condition) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction with another condition
    #[must_use]
    pub fn or(self, other: Condition) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Render as query text
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Cmp { field, op, value } => {
                format!("{field} {} {}", op.symbol(), value.render())
            }
            Self::In {
                field,
                values,
                negated,
            } => {
                let list = values
                    .iter()
                    .map(Literal::render)
                    .collect::<Vec<_>>()
                    .join(", ");
                let kw = if *negated { "NOT IN" } else { "IN" };
                format!("{field} {kw} ({list})")
            }
            Self::And(parts) => join_group(parts, " AND "),
            Self::Or(parts) => join_group(parts, " OR "),
            Self::Not(inner) => format!("NOT ({})", inner.render()),
        }
    }
}

fn join_group(parts: &[Condition], sep: &str) -> String {
    parts
        .iter()
        .map(|p| match p {
            Condition::And(_) | Condition::Or(_) => format!("({})", p.render()),
            _ => p.render(),
        })
        .collect::<Vec<_>>()
        .join(sep)
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// A structured query over one object type
#[derive(Debug, Clone, PartialEq)]
pub struct SoqlQuery {
    /// Target API
    pub api: QueryApi,
    /// Selected fields
    pub fields: Vec<String>,
    /// Object type
    pub object: String,
    /// `WHERE` clause
    pub filter: Option<Condition>,
    /// `ORDER BY` clause
    pub order_by: Vec<(String, Direction)>,
    /// `LIMIT`
    pub limit: Option<usize>,
}

impl SoqlQuery {
    /// Start a query on `object`
    #[must_use]
    pub fn from(object: &str) -> Self {
        Self {
            api: QueryApi::Data,
            fields: vec!["Id".to_string()],
            object: object.to_string(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Select fields (replaces the default `Id`)
    #[must_use]
    pub fn select(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Add a predicate (AND-ed with any existing one)
    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// Add an ordering key
    #[must_use]
    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by.push((field.to_string(), direction));
        self
    }

    /// Limit rows
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `SELECT COUNT()`; the row count comes back as the response's total size
    #[must_use]
    pub fn count(mut self) -> Self {
        self.fields = vec!["COUNT()".to_string()];
        self.order_by.clear();
        self
    }

    /// Route through the tooling API
    #[must_use]
    pub fn tooling(mut self) -> Self {
        self.api = QueryApi::Tooling;
        self
    }

    /// Render as query text
    #[must_use]
    pub fn to_soql(&self) -> String {
        let mut out = format!("SELECT {} FROM {}", self.fields.join(", "), self.object);
        if let Some(filter) = &self.filter {
            let _ = write!(out, " WHERE {}", filter.render());
        }
        if !self.order_by.is_empty() {
            let keys = self
                .order_by
                .iter()
                .map(|(f, d)| match d {
                    Direction::Asc => format!("{f} ASC"),
                    Direction::Desc => format!("{f} DESC"),
                })
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(out, " ORDER BY {keys}");
        }
        if let Some(limit) = self.limit {
            let _ = write!(out, " LIMIT {limit}");
        }
        out
    }
}

impl std::fmt::Display for SoqlQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_soql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn render_pool_query() {
        let q = SoqlQuery::from("ScratchOrgInfo")
            .select(&["Id", "CreatedDate"])
            .filter(Condition::eq("Pooltag__c", "core"))
            .filter(Condition::eq("Status", "Active"))
            .filter(Condition::not_in("Allocation_status__c", ["Assigned", "In Progress"]))
            .order_by("CreatedDate", Direction::Asc);

        assert_eq!(
            q.to_soql(),
            "SELECT Id, CreatedDate FROM ScratchOrgInfo WHERE Pooltag__c = 'core' AND \
             Status = 'Active' AND Allocation_status__c NOT IN ('Assigned', 'In Progress') \
             ORDER BY CreatedDate ASC"
        );
    }

    #[test]
    fn nested_groups_are_parenthesised() {
        let c = Condition::eq("Pooltag__c", "core").and(
            Condition::eq("Status", "Error").or(Condition::lt(
                "ExpirationDate",
                NaiveDate::from_ymd_opt(2024, 5, 8).unwrap(),
            )),
        );
        assert_eq!(
            c.render(),
            "Pooltag__c = 'core' AND (Status = 'Error' OR ExpirationDate < 2024-05-08)"
        );
    }

    #[test]
    fn injection_is_quoted() {
        let c = Condition::eq("Pooltag__c", "x' OR Status != 'y");
        assert_eq!(c.render(), r"Pooltag__c = 'x\' OR Status != \'y'");
    }

    #[test]
    fn tooling_and_limit() {
        let q = SoqlQuery::from("SandboxProcess")
            .filter(Condition::is_in("SandboxName", ["sandboxA"]))
            .order_by("LastModifiedDate", Direction::Desc)
            .limit(1)
            .tooling();
        assert_eq!(q.api, QueryApi::Tooling);
        assert!(q.to_soql().ends_with("ORDER BY LastModifiedDate DESC LIMIT 1"));
    }

    #[test]
    fn count_query() {
        let q = SoqlQuery::from("ScratchOrgInfo")
            .order_by("CreatedDate", Direction::Asc)
            .count()
            .filter(Condition::eq("Pooltag__c", "core"));
        assert_eq!(
            q.to_soql(),
            "SELECT COUNT() FROM ScratchOrgInfo WHERE Pooltag__c = 'core'"
        );
    }

    proptest! {
        #[test]
        fn escaped_literal_never_terminates_early(raw in ".*") {
            let rendered = Literal::Str(raw).render();
            let inner = &rendered[1..rendered.len() - 1];
            // every quote inside the literal is preceded by an odd run of backslashes
            let bytes = inner.as_bytes();
            for (i, b) in bytes.iter().enumerate() {
                if *b == b'\'' {
                    let run = bytes[..i].iter().rev().take_while(|c| **c == b'\\').count();
                    prop_assert!(run % 2 == 1);
                }
            }
        }
    }
}
