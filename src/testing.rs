//! Test fixtures: the blog schema and an in-memory recording backend.
//!
//! `MemoryDatabase` understands the statement shapes the builders emit (simple conjunctive
//! filters, IN lists, ordering, pagination, counts, RETURNING writes, join selects). Every
//! statement is logged so tests can count queries and inspect transaction control.

use crate::db::{Connection, Database, TxControl};
use crate::error::EngineError;
use crate::schema::{parse_definitions, ResourceDefinition, SchemaRegistry};
use crate::sql::QueryBuf;
use crate::value::{Record, Value};
use async_trait::async_trait;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const BLOG: &str = r#"[
  {
    "name": "users",
    "fields": [
      { "name": "id", "type": "big_int", "required": true, "default": { "generated": "increment" } },
      { "name": "name", "type": "string", "required": true, "min_length": 1, "max_length": 80 },
      { "name": "email", "type": "string", "optional": true, "format": "email", "unique": true }
    ],
    "relationships": [
      { "name": "posts", "kind": "has_many", "target": "posts", "foreign_key": "author_id" }
    ]
  },
  {
    "name": "posts",
    "fields": [
      { "name": "id", "type": "big_int", "required": true, "default": { "generated": "increment" } },
      { "name": "title", "type": "string", "required": true, "min_length": 1, "max_length": 200 },
      { "name": "body", "type": "text", "optional": true },
      { "name": "published_at", "type": "timestamp", "optional": true },
      { "name": "author_id", "type": "big_int", "required": true }
    ],
    "relationships": [
      { "name": "author", "kind": "belongs_to", "target": "users", "foreign_key": "author_id",
        "nullable": false, "on_delete": "restrict" },
      { "name": "comments", "kind": "has_many", "target": "comments", "foreign_key": "post_id" },
      { "name": "tags", "kind": "many_to_many", "target": "tags", "join_table": "post_tags",
        "foreign_key": "post_id", "association_key": "tag_id", "order_by": { "field": "label" } }
    ],
    "indexes": [ { "fields": ["author_id"] } ],
    "scopes": [
      { "name": "by_author", "params": ["author"],
        "conditions": [ { "field": "author_id", "op": "eq", "value": { "param": "author" } } ] },
      { "name": "published", "conditions": [ { "field": "published_at", "op": "is_not_null" } ] }
    ]
  },
  {
    "name": "comments",
    "fields": [
      { "name": "id", "type": "big_int", "required": true, "default": { "generated": "increment" } },
      { "name": "post_id", "type": "big_int", "required": true },
      { "name": "author_id", "type": "big_int", "optional": true },
      { "name": "body", "type": "text", "required": true }
    ],
    "relationships": [
      { "name": "post", "kind": "belongs_to", "target": "posts", "foreign_key": "post_id",
        "nullable": false, "on_delete": "cascade" },
      { "name": "author", "kind": "belongs_to", "target": "users", "foreign_key": "author_id",
        "nullable": true, "on_delete": "set_null" }
    ]
  },
  {
    "name": "tags",
    "fields": [
      { "name": "id", "type": "big_int", "required": true, "default": { "generated": "increment" } },
      { "name": "label", "type": "string", "required": true, "unique": true }
    ]
  },
  {
    "name": "post_tags",
    "fields": [
      { "name": "id", "type": "big_int", "required": true, "default": { "generated": "increment" } },
      { "name": "post_id", "type": "big_int", "required": true },
      { "name": "tag_id", "type": "big_int", "required": true }
    ],
    "relationships": [
      { "name": "post", "kind": "belongs_to", "target": "posts", "foreign_key": "post_id",
        "nullable": false, "on_delete": "cascade" },
      { "name": "tag", "kind": "belongs_to", "target": "tags", "foreign_key": "tag_id",
        "nullable": false, "on_delete": "cascade" }
    ]
  }
]"#;

pub fn blog_definitions() -> Vec<ResourceDefinition> {
    parse_definitions(BLOG).unwrap()
}

/// Sealed registry holding users, posts, comments, tags and post_tags.
pub fn blog_registry() -> SchemaRegistry {
    let registry = SchemaRegistry::default();
    registry.register_all(blog_definitions()).unwrap();
    registry.seal().unwrap();
    registry
}

type Tables = BTreeMap<String, Vec<Record>>;

#[derive(Default)]
struct State {
    tables: Tables,
    statements: Vec<String>,
    control: Vec<String>,
    commit_conflicts: u32,
}

/// In-memory backend. Each connection works on a private copy of the tables while a
/// transaction is open; COMMIT publishes it, ROLLBACK or drop discards it.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert committed rows directly, assigning ids when absent.
    pub fn seed(&self, table: &str, rows: Vec<Record>) {
        let mut state = self.state.lock().unwrap();
        let t = state.tables.entry(table.to_string()).or_default();
        for mut row in rows {
            if !row.contains("id") {
                row.set("id", next_id(t));
            }
            t.push(row);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state.lock().unwrap().tables.get(table).cloned().unwrap_or_default()
    }

    /// Every statement run through `fetch_all`/`execute`, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    /// Transaction control statements only.
    pub fn control_log(&self) -> Vec<String> {
        self.state.lock().unwrap().control.clone()
    }

    /// Make the next `n` commits fail with a serialization conflict.
    pub fn fail_commits_with_conflict(&self, n: u32) {
        self.state.lock().unwrap().commit_conflicts = n;
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Conn = MemoryConn;

    async fn acquire(&self) -> Result<MemoryConn, EngineError> {
        Ok(MemoryConn {
            state: Arc::clone(&self.state),
            working: None,
            savepoints: Vec::new(),
        })
    }
}

pub struct MemoryConn {
    state: Arc<Mutex<State>>,
    working: Option<Tables>,
    savepoints: Vec<(String, Tables)>,
}

impl MemoryConn {
    fn run(&mut self, q: &QueryBuf) -> Result<(Vec<Record>, u64), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.statements.push(q.sql.clone());
        let tables = match self.working.as_mut() {
            Some(t) => t,
            None => &mut state.tables,
        };
        execute_sql(tables, q)
    }
}

#[async_trait]
impl Connection for MemoryConn {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, EngineError> {
        Ok(self.run(q)?.0)
    }

    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, EngineError> {
        Ok(self.run(q)?.1)
    }

    async fn control(&mut self, op: TxControl) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.control.push(op.sql());
        match op {
            TxControl::Begin(_) => {
                self.working = Some(state.tables.clone());
                self.savepoints.clear();
            }
            TxControl::Commit => {
                let working = self.working.take();
                self.savepoints.clear();
                if state.commit_conflicts > 0 {
                    state.commit_conflicts -= 1;
                    return Err(EngineError::TransactionConflict(
                        "could not serialize access due to concurrent update".into(),
                    ));
                }
                if let Some(t) = working {
                    state.tables = t;
                }
            }
            TxControl::Rollback => {
                self.working = None;
                self.savepoints.clear();
            }
            TxControl::Savepoint(name) => {
                let snapshot = self.working.clone().unwrap_or_default();
                self.savepoints.push((name, snapshot));
            }
            TxControl::ReleaseSavepoint(name) => {
                if let Some(pos) = self.savepoints.iter().rposition(|(n, _)| *n == name) {
                    self.savepoints.truncate(pos);
                }
            }
            TxControl::RollbackToSavepoint(name) => {
                if let Some(pos) = self.savepoints.iter().rposition(|(n, _)| *n == name) {
                    self.working = Some(self.savepoints[pos].1.clone());
                    self.savepoints.truncate(pos + 1);
                }
            }
        }
        Ok(())
    }
}

fn unsupported(sql: &str) -> EngineError {
    EngineError::QueryBuild(format!("memory backend cannot run: {}", sql))
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

fn next_id(rows: &[Record]) -> i64 {
    rows.iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64))
        .max()
        .unwrap_or(0)
        + 1
}

fn param(q: &QueryBuf, n: &str) -> Value {
    n.parse::<usize>()
        .ok()
        .and_then(|i| q.params.get(i - 1))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Last quoted identifier in a column expression: `main."title"` -> `title`.
fn column_name(expr: &str) -> String {
    expr.rsplit('"').nth(1).unwrap_or(expr).to_string()
}

fn column_list(list: &str) -> Vec<String> {
    list.split(", ").map(column_name).collect()
}

fn project(row: &Record, columns: &[String]) -> Record {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (x, y) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

/// Conjunction of simple predicates over one row.
fn matches(row: &Record, predicate: Option<&str>, q: &QueryBuf) -> Result<bool, EngineError> {
    let Some(predicate) = predicate else { return Ok(true) };
    let cmp = re(r#"^(?:main\.|"jt"\.)?"(\w+)" (=|<>|<=|>=|<|>) \$(\d+)::\w+$"#);
    let set = re(r#"^(?:main\.|"jt"\.)?"(\w+)" (IN|NOT IN) \((.*)\)$"#);
    let null = re(r#"^(?:main\.|"jt"\.)?"(\w+)" IS (NOT )?NULL$"#);
    let placeholder = re(r"\$(\d+)");
    for part in predicate.split(" AND ") {
        let ok = if part == "1 = 0" {
            false
        } else if part == "1 = 1" {
            true
        } else if let Some(c) = cmp.captures(part) {
            let actual = row.get(&c[1]).cloned().unwrap_or(Value::Null);
            let expected = param(q, &c[3]);
            match &c[2] {
                "=" => !actual.is_null() && actual == expected,
                "<>" => !actual.is_null() && actual != expected,
                op => match compare(&actual, &expected) {
                    Some(o) => match op {
                        "<" => o == Ordering::Less,
                        "<=" => o != Ordering::Greater,
                        ">" => o == Ordering::Greater,
                        _ => o != Ordering::Less,
                    },
                    None => false,
                },
            }
        } else if let Some(c) = set.captures(part) {
            let actual = row.get(&c[1]).cloned().unwrap_or(Value::Null);
            let found = placeholder
                .captures_iter(&c[3])
                .any(|p| param(q, &p[1]) == actual);
            !actual.is_null() && (found == (&c[2] == "IN"))
        } else if let Some(c) = null.captures(part) {
            let is_null = row.get(&c[1]).map(Value::is_null).unwrap_or(true);
            is_null != c.get(2).is_some()
        } else {
            return Err(unsupported(part));
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sort(rows: &mut [Record], order: Option<&str>) {
    let Some(order) = order else { return };
    let item = re(r#"^(?:main\.)?"(\w+)"(?: (ASC|DESC))?$"#);
    let keys: Vec<(String, bool)> = order
        .split(", ")
        .filter_map(|o| item.captures(o).map(|c| (c[1].to_string(), c.get(2).map(|d| d.as_str()) == Some("DESC"))))
        .collect();
    rows.sort_by(|a, b| {
        for (field, desc) in &keys {
            let x = a.get(field).unwrap_or(&Value::Null);
            let y = b.get(field).unwrap_or(&Value::Null);
            let o = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => compare(x, y).unwrap_or(Ordering::Equal),
            };
            let o = if *desc { o.reverse() } else { o };
            if o != Ordering::Equal {
                return o;
            }
        }
        Ordering::Equal
    });
}

fn execute_sql(tables: &mut Tables, q: &QueryBuf) -> Result<(Vec<Record>, u64), EngineError> {
    let sql = q.sql.as_str();
    if ["CREATE ", "ALTER ", "DROP ", "SET ", "COMMENT "].iter().any(|p| sql.starts_with(p)) {
        return Ok((Vec::new(), 0));
    }

    let join = re(
        r#"^SELECT (.+), "jt"\."(\w+)" AS "_parent_key" FROM "\w+"\."(\w+)" main JOIN "\w+"\."(\w+)" "jt" ON "jt"\."(\w+)" = main\."(\w+)" WHERE (.+?)(?: ORDER BY (.+))?$"#,
    );
    if let Some(c) = join.captures(sql) {
        let columns = column_list(&c[1]);
        let (fk, target, join_table, assoc, target_pk) = (&c[2], &c[3], &c[4], &c[5], &c[6]);
        let links = tables.get(join_table).cloned().unwrap_or_default();
        let targets = tables.get(target).cloned().unwrap_or_default();
        let mut out = Vec::new();
        for link in &links {
            if !matches(link, Some(&c[7]), q)? {
                continue;
            }
            let wanted = link.get(assoc).cloned().unwrap_or(Value::Null);
            for t in targets.iter().filter(|t| t.get(target_pk) == Some(&wanted)) {
                let mut row = project(t, &columns);
                row.set("_parent_key", link.get(fk).cloned().unwrap_or(Value::Null));
                out.push(row);
            }
        }
        sort(&mut out, c.get(8).map(|m| m.as_str()));
        let n = out.len() as u64;
        return Ok((out, n));
    }

    let select = re(
        r#"^SELECT (.+?) FROM "\w+"\."(\w+)" main(?: WHERE (.+?))?(?: ORDER BY (.+?))?(?: LIMIT (\d+))?(?: OFFSET (\d+))?( FOR UPDATE)?$"#,
    );
    if let Some(c) = select.captures(sql) {
        let rows = tables.get(&c[2]).cloned().unwrap_or_default();
        let mut hits = Vec::new();
        for row in rows {
            if matches(&row, c.get(3).map(|m| m.as_str()), q)? {
                hits.push(row);
            }
        }
        if &c[1] == "COUNT(*) AS \"count\"" {
            let n = hits.len() as i64;
            return Ok((vec![Record::new().with("count", n)], 1));
        }
        sort(&mut hits, c.get(4).map(|m| m.as_str()));
        let offset = c.get(6).and_then(|m| m.as_str().parse().ok()).unwrap_or(0usize);
        let limit = c.get(5).and_then(|m| m.as_str().parse().ok()).unwrap_or(usize::MAX);
        let columns = column_list(&c[1]);
        let out: Vec<Record> = hits
            .iter()
            .skip(offset)
            .take(limit)
            .map(|r| project(r, &columns))
            .collect();
        let n = out.len() as u64;
        return Ok((out, n));
    }

    let insert = re(
        r#"^INSERT INTO "\w+"\."(\w+)" (?:\((.+?)\) VALUES \((.+?)\)|DEFAULT VALUES)(?: RETURNING (.+))?$"#,
    );
    if let Some(c) = insert.captures(sql) {
        let table = tables.entry(c[1].to_string()).or_default();
        let mut row = Record::new();
        if let (Some(cols), Some(vals)) = (c.get(2), c.get(3)) {
            let placeholder = re(r"\$(\d+)");
            for (col, val) in column_list(cols.as_str()).into_iter().zip(vals.as_str().split(", ")) {
                let n = placeholder.captures(val).map(|p| p[1].to_string()).unwrap_or_default();
                row.set(col, param(q, &n));
            }
        }
        if !row.contains("id") {
            row.set("id", next_id(table));
        }
        table.push(row.clone());
        let out = match c.get(4) {
            Some(ret) => vec![project(&row, &column_list(ret.as_str()))],
            None => Vec::new(),
        };
        return Ok((out, 1));
    }

    let update = re(r#"^UPDATE "\w+"\."(\w+)" SET (.+) WHERE "(\w+)" = \$(\d+)::\w+(?: RETURNING (.+))?$"#);
    if let Some(c) = update.captures(sql) {
        let assign = re(r#"^"(\w+)" = \$(\d+)::\w+$"#);
        let sets: Vec<(String, Value)> = c[2]
            .split(", ")
            .filter_map(|s| assign.captures(s).map(|a| (a[1].to_string(), param(q, &a[2]))))
            .collect();
        let id = param(q, &c[4]);
        let mut out = Vec::new();
        let mut n = 0;
        for row in tables.entry(c[1].to_string()).or_default().iter_mut() {
            if row.get(&c[3]) != Some(&id) {
                continue;
            }
            for (field, value) in &sets {
                row.set(field.clone(), value.clone());
            }
            n += 1;
            if let Some(ret) = c.get(5) {
                out.push(project(row, &column_list(ret.as_str())));
            }
        }
        return Ok((out, n));
    }

    let delete = re(r#"^DELETE FROM "\w+"\."(\w+)" WHERE "(\w+)" = \$(\d+)::\w+(?: RETURNING (.+))?$"#);
    if let Some(c) = delete.captures(sql) {
        let id = param(q, &c[3]);
        let rows = tables.entry(c[1].to_string()).or_default();
        let (gone, kept): (Vec<Record>, Vec<Record>) = rows.drain(..).partition(|r| r.get(&c[2]) == Some(&id));
        *rows = kept;
        let n = gone.len() as u64;
        let out = match c.get(4) {
            Some(ret) => gone.iter().map(|r| project(r, &column_list(ret.as_str()))).collect(),
            None => Vec::new(),
        };
        return Ok((out, n));
    }

    Err(unsupported(sql))
}
