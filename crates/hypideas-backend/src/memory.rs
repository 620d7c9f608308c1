//! In-process stand-in for the hosted backend, used by tests.
//!
//! Tables are JSON rows. Filters, ordering and paging follow the REST
//! semantics closely enough for the services; column projection is not
//! applied, embedded relations are.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use hypideas_types::events::RawChange;

use crate::error::{Error, Result};
use crate::query::{Filter, Mutation, MutationKind, Op, Query};
use crate::Backend;

/// Rows of every table, keyed by table name.
#[derive(Debug, Default)]
pub struct Tables(BTreeMap<String, Vec<Value>>);

impl Tables {
    pub fn rows(&self, table: &str) -> &[Value] {
        self.0.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rows_mut(&mut self, table: &str) -> &mut Vec<Value> {
        self.0.entry(table.to_string()).or_default()
    }
}

type RpcHandler = Box<dyn Fn(&mut Tables, Value) -> Result<Value> + Send + Sync>;
type ChangeSink = Box<dyn Fn(RawChange) + Send + Sync>;

struct Relation {
    table: String,
    embed: String,
    foreign_table: String,
    local_column: String,
}

struct State {
    tables: Tables,
    objects: BTreeMap<String, (Bytes, String)>,
    last_stamp: DateTime<Utc>,
}

pub struct MemoryBackend {
    state: Mutex<State>,
    unique: HashMap<String, Vec<Vec<String>>>,
    relations: Vec<Relation>,
    rpcs: HashMap<String, RpcHandler>,
    defaults: HashMap<String, Value>,
    sink: Option<ChangeSink>,
    failing: Mutex<HashSet<String>>,
    public_base: String,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tables: Tables::default(),
                objects: BTreeMap::new(),
                last_stamp: DateTime::<Utc>::MIN_UTC,
            }),
            unique: HashMap::new(),
            relations: Vec::new(),
            rpcs: HashMap::new(),
            defaults: HashMap::new(),
            sink: None,
            failing: Mutex::new(HashSet::new()),
            public_base: "memory://storage".into(),
        }
    }

    /// Reject inserts that repeat `columns` of an existing row.
    pub fn with_unique(mut self, table: &str, columns: &[&str]) -> Self {
        self.unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Embed the `foreign_table` row whose `id` equals `local_column` under
    /// `embed` when a select on `table` names it, e.g. `*, users(*)`.
    pub fn with_relation(mut self, table: &str, embed: &str, foreign_table: &str, local_column: &str) -> Self {
        self.relations.push(Relation {
            table: table.to_string(),
            embed: embed.to_string(),
            foreign_table: foreign_table.to_string(),
            local_column: local_column.to_string(),
        });
        self
    }

    /// Column defaults for rows inserted into `table`, given as an object.
    pub fn with_defaults(mut self, table: &str, defaults: Value) -> Self {
        self.defaults.insert(table.to_string(), defaults);
        self
    }

    pub fn with_rpc(
        mut self,
        name: &str,
        handler: impl Fn(&mut Tables, Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.rpcs.insert(name.to_string(), Box::new(handler));
        self
    }

    /// Receive a change event for every row written through [`Backend::mutate`].
    pub fn with_change_sink(mut self, sink: impl Fn(RawChange) + Send + Sync + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert rows directly, without change events or constraint checks.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.state().tables.rows_mut(table).extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state().tables.rows(table).to_vec()
    }

    pub fn object(&self, path: &str) -> Option<(Bytes, String)> {
        self.state().objects.get(path).cloned()
    }

    /// Make every later write to `table` fail.
    pub fn fail_writes_to(&self, table: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    fn check_failing(&self, table: &str) -> Result<()> {
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(table) {
            return Err(Error::Backend {
                status: 500,
                code: "XX000".into(),
                message: format!("writes to {} are failing", table),
            });
        }
        Ok(())
    }

    fn publish(&self, changes: Vec<RawChange>) {
        if let Some(sink) = &self.sink {
            for change in changes {
                sink(change);
            }
        }
    }

    fn conflicts(&self, table: &str, rows: &[Value], candidate: &Value) -> bool {
        let Some(sets) = self.unique.get(table) else {
            return false;
        };
        sets.iter().any(|cols| rows.iter().any(|row| same_columns(row, candidate, cols)))
    }

    fn embed(&self, table: &str, columns: &str, tables: &Tables, row: &mut Value) {
        for rel in self.relations.iter().filter(|r| r.table == table) {
            if !columns.contains(&format!("{}(", rel.embed)) {
                continue;
            }
            let key = row.get(&rel.local_column).cloned().unwrap_or(Value::Null);
            let found = tables
                .rows(&rel.foreign_table)
                .iter()
                .find(|r| !key.is_null() && r.get("id").is_some_and(|id| loose_eq(id, &key)))
                .cloned()
                .unwrap_or(Value::Null);
            if let Value::Object(map) = row {
                map.insert(rel.embed.clone(), found);
            }
        }
    }
}

/// Monotonic timestamp so rows inserted back to back still sort in order.
fn next_stamp(state: &mut State) -> DateTime<Utc> {
    let now = Utc::now();
    let stamp = if now > state.last_stamp {
        now
    } else {
        state.last_stamp + Duration::microseconds(1)
    };
    state.last_stamp = stamp;
    stamp
}

fn fill_defaults(row: &mut Value, stamp: DateTime<Utc>, defaults: Option<&Value>) -> Result<()> {
    let Value::Object(map) = row else {
        return Err(Error::Backend {
            status: 400,
            code: "PGRST102".into(),
            message: "row must be an object".into(),
        });
    };
    if let Some(Value::Object(defaults)) = defaults {
        for (column, value) in defaults {
            map.entry(column.as_str()).or_insert_with(|| value.clone());
        }
    }
    map.entry("id").or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    map.entry("created_at")
        .or_insert_with(|| Value::String(stamp.to_rfc3339()));
    Ok(())
}

fn into_list(rows: &Value) -> Vec<Value> {
    match rows {
        Value::Array(rows) => rows.clone(),
        row => vec![row.clone()],
    }
}

fn merge(target: &mut Value, changes: &Value) {
    if let (Value::Object(target), Value::Object(changes)) = (target, changes) {
        for (k, v) in changes {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn same_columns(a: &Value, b: &Value, cols: &[String]) -> bool {
    cols.iter().all(|c| match (a.get(c), b.get(c)) {
        (Some(x), Some(y)) => loose_eq(x, y),
        (None, None) => true,
        _ => false,
    })
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    a == b || compare(a, b) == Some(Ordering::Equal)
}

/// Order two cells: timestamps, then numbers, then booleans, then text.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => return Some(Ordering::Equal),
        (Value::Null, _) => return Some(Ordering::Less),
        (_, Value::Null) => return Some(Ordering::Greater),
        (Value::Bool(x), Value::Bool(y)) => return Some(x.cmp(y)),
        _ => {}
    }
    let (x, y) = (text(a)?, text(b)?);
    if let (Ok(x), Ok(y)) = (
        DateTime::parse_from_rfc3339(&x),
        DateTime::parse_from_rfc3339(&y),
    ) {
        return Some(x.cmp(&y));
    }
    if let (Ok(x), Ok(y)) = (x.parse::<f64>(), y.parse::<f64>()) {
        return x.partial_cmp(&y);
    }
    Some(x.cmp(&y))
}

fn like(value: &str, pattern: &str) -> bool {
    let value = value.to_lowercase();
    let pattern = pattern.to_lowercase().replace('%', "*");
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return value == pattern;
    }
    let mut rest = value.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(tail) = rest.strip_prefix(part) else {
                return false;
            };
            rest = tail;
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(pos) = rest.find(part) else {
                return false;
            };
            rest = &rest[pos + part.len()..];
        }
    }
    true
}

fn matches(row: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Cmp { column, op, value } => {
            let cell = row.get(column).unwrap_or(&Value::Null);
            match op {
                Op::Eq => loose_eq(cell, value),
                Op::Neq => !loose_eq(cell, value),
                Op::Is => match value {
                    Value::Null => cell.is_null(),
                    other => cell == other,
                },
                Op::Lt => !cell.is_null() && compare(cell, value) == Some(Ordering::Less),
                Op::Lte => {
                    !cell.is_null() && matches!(compare(cell, value), Some(Ordering::Less | Ordering::Equal))
                }
                Op::Gt => !cell.is_null() && compare(cell, value) == Some(Ordering::Greater),
                Op::Gte => {
                    !cell.is_null()
                        && matches!(compare(cell, value), Some(Ordering::Greater | Ordering::Equal))
                }
                Op::ILike => match (text(cell), text(value)) {
                    (Some(cell), Some(pattern)) => like(&cell, &pattern),
                    _ => false,
                },
                Op::Contains => match (cell.as_array(), value.as_array()) {
                    (Some(cell), Some(wanted)) => wanted.iter().all(|w| cell.iter().any(|c| loose_eq(c, w))),
                    _ => false,
                },
            }
        }
        Filter::In { column, values } => {
            let cell = row.get(column).unwrap_or(&Value::Null);
            values.iter().any(|v| loose_eq(cell, v))
        }
        Filter::Or(inner) => inner.iter().any(|f| matches(row, f)),
        Filter::And(inner) => inner.iter().all(|f| matches(row, f)),
    }
}

fn matches_all(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| matches(row, f))
}

impl Backend for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        let state = self.state();
        let mut rows: Vec<Value> = state
            .tables
            .rows(&query.table)
            .iter()
            .filter(|row| matches_all(row, &query.filters))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            for order in &query.order {
                let x = a.get(&order.column).unwrap_or(&Value::Null);
                let y = b.get(&order.column).unwrap_or(&Value::Null);
                let ord = compare(x, y).unwrap_or(Ordering::Equal);
                let ord = if order.ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut page: Vec<Value> = rows.into_iter().skip(offset).take(limit).collect();
        for row in &mut page {
            self.embed(&query.table, &query.columns, &state.tables, row);
        }
        Ok(page)
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Vec<Value>> {
        self.check_failing(&mutation.table)?;
        let table = mutation.table.as_str();
        let mut changes = Vec::new();
        let mut affected = Vec::new();
        {
            let mut state = self.state();
            match &mutation.kind {
                MutationKind::Insert(rows) => {
                    let mut new_rows = into_list(rows);
                    for row in &mut new_rows {
                        let stamp = next_stamp(&mut state);
                        fill_defaults(row, stamp, self.defaults.get(table))?;
                        let existing = state.tables.rows(table);
                        if self.conflicts(table, existing, row) {
                            return Err(Error::Conflict(format!("duplicate row in {}", table)));
                        }
                        state.tables.rows_mut(table).push(row.clone());
                        changes.push(RawChange::insert(table, row.clone()));
                        affected.push(row.clone());
                    }
                }
                MutationKind::Upsert { rows, on_conflict } => {
                    let keys: Vec<String> = on_conflict
                        .as_deref()
                        .unwrap_or("id")
                        .split(',')
                        .map(|c| c.trim().to_string())
                        .collect();
                    for mut row in into_list(rows) {
                        let pos = state
                            .tables
                            .rows(table)
                            .iter()
                            .position(|existing| same_columns(existing, &row, &keys));
                        match pos {
                            Some(pos) => {
                                let slot = &mut state.tables.rows_mut(table)[pos];
                                let old = slot.clone();
                                merge(slot, &row);
                                changes.push(RawChange::update(table, slot.clone(), old));
                                affected.push(slot.clone());
                            }
                            None => {
                                let stamp = next_stamp(&mut state);
                                fill_defaults(&mut row, stamp, self.defaults.get(table))?;
                                state.tables.rows_mut(table).push(row.clone());
                                changes.push(RawChange::insert(table, row.clone()));
                                affected.push(row);
                            }
                        }
                    }
                }
                MutationKind::Update(patch) => {
                    for slot in state.tables.rows_mut(table).iter_mut() {
                        if matches_all(slot, &mutation.filters) {
                            let old = slot.clone();
                            merge(slot, patch);
                            changes.push(RawChange::update(table, slot.clone(), old));
                            affected.push(slot.clone());
                        }
                    }
                }
                MutationKind::Delete => {
                    let rows = state.tables.rows_mut(table);
                    let (removed, kept): (Vec<Value>, Vec<Value>) = std::mem::take(rows)
                        .into_iter()
                        .partition(|row| matches_all(row, &mutation.filters));
                    *rows = kept;
                    for row in removed {
                        changes.push(RawChange::delete(table, row.clone()));
                        affected.push(row);
                    }
                }
            }
        }
        self.publish(changes);
        Ok(if mutation.returning { affected } else { Vec::new() })
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value> {
        let Some(handler) = self.rpcs.get(function) else {
            return Err(Error::Backend {
                status: 404,
                code: "PGRST202".into(),
                message: format!("function {} not found", function),
            });
        };
        let mut state = self.state();
        handler(&mut state.tables, args)
    }

    async fn upload(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<String> {
        self.check_failing(bucket)?;
        let mut state = self.state();
        let key = format!("{}/{}", bucket, path);
        if state.objects.contains_key(&key) {
            return Err(Error::Storage(format!("{} already exists", key)));
        }
        state.objects.insert(key.clone(), (data, content_type.to_string()));
        Ok(format!("{}/{}", self.public_base, key))
    }
}
