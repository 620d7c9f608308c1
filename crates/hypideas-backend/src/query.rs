//! Builders for table reads and writes, rendered as PostgREST query strings.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Is,
    ILike,
    /// Array column contains every listed element.
    Contains,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Neq => "neq",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::Gt => "gt",
            Op::Gte => "gte",
            Op::Is => "is",
            Op::ILike => "ilike",
            Op::Contains => "cs",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Cmp { column: String, op: Op, value: Value },
    In { column: String, values: Vec<Value> },
    Or(Vec<Filter>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn cmp(column: &str, op: Op, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::cmp(column, Op::Eq, value)
    }

    pub fn ilike(column: &str, pattern: &str) -> Self {
        Self::cmp(column, Op::ILike, pattern)
    }

    pub fn contains(column: &str, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::cmp(column, Op::Contains, Value::Array(values))
    }

    /// Top-level query parameter for this filter.
    pub fn to_param(&self) -> (String, String) {
        match self {
            Filter::Cmp { column, op, value } => {
                (column.clone(), format!("{}.{}", op.as_str(), render(value, false)))
            }
            Filter::In { column, values } => (column.clone(), format!("in.({})", render_list(values))),
            Filter::Or(inner) => ("or".into(), format!("({})", render_group(inner))),
            Filter::And(inner) => ("and".into(), format!("({})", render_group(inner))),
        }
    }

    /// Form used inside `or=(...)` / `and=(...)` groups.
    fn to_nested(&self) -> String {
        match self {
            Filter::Cmp { column, op, value } => {
                format!("{}.{}.{}", column, op.as_str(), render(value, true))
            }
            Filter::In { column, values } => format!("{}.in.({})", column, render_list(values)),
            Filter::Or(inner) => format!("or({})", render_group(inner)),
            Filter::And(inner) => format!("and({})", render_group(inner)),
        }
    }
}

fn render_group(filters: &[Filter]) -> String {
    filters.iter().map(Filter::to_nested).collect::<Vec<_>>().join(",")
}

fn render_list(values: &[Value]) -> String {
    values.iter().map(|v| render(v, true)).collect::<Vec<_>>().join(",")
}

fn render(value: &Value, nested: bool) -> String {
    match value {
        Value::Null => "null".into(),
        Value::String(s) => {
            if nested && s.contains([',', '(', ')', '.', ':', '"']) {
                format!("\"{}\"", s.replace('"', "\\\""))
            } else {
                s.clone()
            }
        }
        Value::Array(items) => format!("{{{}}}", render_list(items)),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A read against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: "*".into(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Column list, including embedded relations such as `*, users(*)`.
    pub fn select(mut self, columns: &str) -> Self {
        self.columns = columns.split_whitespace().collect::<Vec<_>>().join("");
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::cmp(column, Op::Eq, value))
    }

    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::cmp(column, Op::Neq, value))
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::cmp(column, Op::Lt, value))
    }

    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::cmp(column, Op::Gte, value))
    }

    pub fn is_null(self, column: &str) -> Self {
        self.filter(Filter::cmp(column, Op::Is, Value::Null))
    }

    pub fn ilike(self, column: &str, pattern: &str) -> Self {
        self.filter(Filter::cmp(column, Op::ILike, pattern))
    }

    pub fn contains(self, column: &str, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        self.filter(Filter::contains(column, values))
    }

    pub fn in_list(self, column: &str, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        self.filter(Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn or(self, alternatives: Vec<Filter>) -> Self {
        self.filter(Filter::Or(alternatives))
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive row range, as used for admin pagination.
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.offset = Some(from);
        self.limit = Some(to.saturating_sub(from) + 1);
        self
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.columns.clone())];
        params.extend(self.filters.iter().map(Filter::to_param));
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".into(), order));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".into(), offset.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    Insert(Value),
    Upsert { rows: Value, on_conflict: Option<String> },
    Update(Value),
    Delete,
}

/// A write against one table. Updates and deletes apply to the rows matched
/// by `filters`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: String,
    pub kind: MutationKind,
    pub filters: Vec<Filter>,
    pub returning: bool,
}

impl Mutation {
    fn new(table: &str, kind: MutationKind) -> Self {
        Self {
            table: table.to_string(),
            kind,
            filters: Vec::new(),
            returning: false,
        }
    }

    /// `rows` is one object or an array of objects.
    pub fn insert(table: &str, rows: Value) -> Self {
        Self::new(table, MutationKind::Insert(rows))
    }

    pub fn upsert(table: &str, rows: Value, on_conflict: Option<&str>) -> Self {
        Self::new(
            table,
            MutationKind::Upsert {
                rows,
                on_conflict: on_conflict.map(str::to_string),
            },
        )
    }

    pub fn update(table: &str, changes: Value) -> Self {
        Self::new(table, MutationKind::Update(changes))
    }

    pub fn delete(table: &str) -> Self {
        Self::new(table, MutationKind::Delete)
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Ask for the affected rows back.
    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self.filters.iter().map(Filter::to_param).collect();
        if let MutationKind::Upsert {
            on_conflict: Some(cols),
            ..
        } = &self.kind
        {
            params.push(("on_conflict".into(), cols.clone()));
        }
        params
    }

    /// Value of the `Prefer` header.
    pub fn prefer(&self) -> String {
        let ret = if self.returning {
            "return=representation"
        } else {
            "return=minimal"
        };
        match self.kind {
            MutationKind::Upsert { .. } => format!("{},resolution=merge-duplicates", ret),
            _ => ret.to_string(),
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match &self.kind {
            MutationKind::Insert(rows) | MutationKind::Upsert { rows, .. } => Some(rows),
            MutationKind::Update(changes) => Some(changes),
            MutationKind::Delete => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feed_query_params() {
        let q = Query::table("posts")
            .select("*, users(id, username)")
            .eq("is_deleted", false)
            .order("is_pinned", false)
            .order("created_at", false)
            .limit(20);
        assert_eq!(
            q.to_params(),
            vec![
                ("select".to_string(), "*,users(id,username)".to_string()),
                ("is_deleted".to_string(), "eq.false".to_string()),
                ("order".to_string(), "is_pinned.desc,created_at.desc".to_string()),
                ("limit".to_string(), "20".to_string()),
            ]
        );
    }

    #[test]
    fn or_of_ands_for_either_participant_order() {
        let q = Query::table("conversations").or(vec![
            Filter::And(vec![Filter::eq("participant_1", "a"), Filter::eq("participant_2", "b")]),
            Filter::And(vec![Filter::eq("participant_1", "b"), Filter::eq("participant_2", "a")]),
        ]);
        assert_eq!(
            q.to_params()[1],
            (
                "or".to_string(),
                "(and(participant_1.eq.a,participant_2.eq.b),and(participant_1.eq.b,participant_2.eq.a))"
                    .to_string()
            )
        );
    }

    #[test]
    fn nested_values_are_quoted() {
        let f = Filter::Or(vec![Filter::cmp("created_at", Op::Lt, "2024-05-01T10:00:00+00:00")]);
        assert_eq!(f.to_param().1, "(created_at.lt.\"2024-05-01T10:00:00+00:00\")");
        let f = Filter::In { column: "id".into(), values: vec![json!("x"), json!(3)] };
        assert_eq!(f.to_param(), ("id".to_string(), "in.(x,3)".to_string()));
    }

    #[test]
    fn array_containment() {
        let q = Query::table("posts").or(vec![
            Filter::ilike("title", "*rust*"),
            Filter::contains("tags", ["rust"]),
        ]);
        assert_eq!(q.to_params()[1].1, "(title.ilike.*rust*,tags.cs.{rust})");
        let f = Filter::contains("tags", ["a,b", "c"]);
        assert_eq!(f.to_param(), ("tags".to_string(), "cs.{\"a,b\",c}".to_string()));
    }

    #[test]
    fn range_and_upsert() {
        let q = Query::table("users").range(20, 39);
        assert_eq!(q.limit, Some(20));
        assert_eq!(q.offset, Some(20));

        let m = Mutation::upsert("user_presence", json!({"user_id": "u"}), Some("user_id")).returning();
        assert_eq!(m.prefer(), "return=representation,resolution=merge-duplicates");
        assert_eq!(m.to_params(), vec![("on_conflict".to_string(), "user_id".to_string())]);
    }
}
