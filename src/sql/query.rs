//! Condition trees compiled against one resource's schema.
//!
//! Every identifier is checked against the schema and quoted; every literal becomes a
//! positional parameter with a cast. Clauses evaluate left to right with equal precedence:
//! `a AND b OR c` renders as `(a AND b) OR c`. Nest with [`Condition::Group`] for anything else.

use crate::error::EngineError;
use crate::schema::{Field, RelationshipKind, ResourceSchema, SchemaRegistry, ScopeCondition, ScopeOperand};
use crate::sql::{qualified_table, quoted, QueryBuf};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub(crate) const MAIN_ALIAS: &str = "main";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Like,
    #[serde(rename = "ilike")]
    ILike,
    IsNull,
    IsNotNull,
    Between,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

impl fmt::Display for Connective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Connective::And => "AND",
            Connective::Or => "OR",
        })
    }
}

/// A field comparison or an explicitly parenthesised group.
///
/// `field` may be a relationship path (`author.name`), which filters through a correlated
/// `EXISTS` subquery. The operand shape follows the operator: `In`/`NotIn` take a list,
/// `Between` a two-element list, the null checks ignore the value.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Compare { field: String, op: Operator, value: Value },
    Group(Vec<Clause>),
}

/// A condition plus the connective joining it to the clause before it (ignored for the first).
#[derive(Clone, Debug, PartialEq)]
pub struct Clause {
    pub connective: Connective,
    pub condition: Condition,
}

impl Clause {
    pub fn and(condition: Condition) -> Self {
        Clause {
            connective: Connective::And,
            condition,
        }
    }

    pub fn or(condition: Condition) -> Self {
        Clause {
            connective: Connective::Or,
            condition,
        }
    }
}

impl Condition {
    pub fn compare(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Condition::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq)]
struct ScopeUse {
    name: String,
    args: BTreeMap<String, Value>,
}

/// Read query for one resource: conditions, scopes, ordering, pagination and includes.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    resource: String,
    clauses: Vec<Clause>,
    scopes: Vec<ScopeUse>,
    order: Vec<OrderBy>,
    limit: Option<u32>,
    offset: Option<u32>,
    includes: Vec<String>,
    for_update: bool,
}

impl Query {
    pub fn new(resource: impl Into<String>) -> Self {
        Query {
            resource: resource.into(),
            clauses: Vec::new(),
            scopes: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            includes: Vec::new(),
            for_update: false,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn filter(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::and(Condition::compare(field, op, value)));
        self
    }

    pub fn or_filter(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::or(Condition::compare(field, op, value)));
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Operator::Eq, value)
    }

    /// AND a parenthesised group.
    pub fn group(mut self, clauses: Vec<Clause>) -> Self {
        self.clauses.push(Clause::and(Condition::Group(clauses)));
        self
    }

    /// OR a parenthesised group.
    pub fn or_group(mut self, clauses: Vec<Clause>) -> Self {
        self.clauses.push(Clause::or(Condition::Group(clauses)));
        self
    }

    /// Apply a named scope declared on the resource. Scopes AND with each other and with the
    /// caller's conditions.
    pub fn scope<K: Into<String>>(mut self, name: &str, args: impl IntoIterator<Item = (K, Value)>) -> Self {
        self.scopes.push(ScopeUse {
            name: name.to_string(),
            args: args.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u32) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn get_limit(&self) -> Option<u32> {
        self.limit
    }

    /// Relationship path to eager-load with the results (`"comments.author"`).
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Lock matched rows (`FOR UPDATE`) for the rest of the transaction.
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    /// SELECT with ORDER BY (primary key when none given), LIMIT capped at `max_limit`, OFFSET.
    pub fn compile(&self, registry: &SchemaRegistry, max_limit: u32) -> Result<QueryBuf, EngineError> {
        let schema = registry.resource(&self.resource)?;
        let mut q = QueryBuf::new();
        let where_clause = self.where_clause(registry, &schema, &mut q)?;

        let mut order_parts = Vec::new();
        for o in &self.order {
            let field = column(&schema, &o.field)?;
            order_parts.push(format!("{}.{} {}", MAIN_ALIAS, quoted(&field.name), o.direction.sql()));
        }
        if order_parts.is_empty() {
            order_parts.push(format!("{}.{} ASC", MAIN_ALIAS, quoted(&schema.primary_key)));
        }
        let limit_clause = self
            .limit
            .map(|n| format!(" LIMIT {}", n.min(max_limit)))
            .unwrap_or_default();
        let offset_clause = self.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
        let lock_clause = if self.for_update { " FOR UPDATE" } else { "" };

        q.sql = format!(
            "SELECT {} FROM {} {}{} ORDER BY {}{}{}{}",
            select_column_list(&schema, Some(MAIN_ALIAS)),
            qualified_table(&schema.pg_schema, &schema.table),
            MAIN_ALIAS,
            where_clause,
            order_parts.join(", "),
            limit_clause,
            offset_clause,
            lock_clause
        );
        tracing::debug!(sql = %q.sql, params = ?q.params, "compiled query");
        Ok(q)
    }

    /// Same filtered statement with the projection replaced by a row count.
    pub fn compile_count(&self, registry: &SchemaRegistry) -> Result<QueryBuf, EngineError> {
        let schema = registry.resource(&self.resource)?;
        let mut q = QueryBuf::new();
        let where_clause = self.where_clause(registry, &schema, &mut q)?;
        q.sql = format!(
            "SELECT COUNT(*) AS \"count\" FROM {} {}{}",
            qualified_table(&schema.pg_schema, &schema.table),
            MAIN_ALIAS,
            where_clause
        );
        Ok(q)
    }

    fn where_clause(
        &self,
        registry: &SchemaRegistry,
        schema: &ResourceSchema,
        q: &mut QueryBuf,
    ) -> Result<String, EngineError> {
        let mut parts: Vec<String> = Vec::new();
        for scope in &self.scopes {
            let clauses = expand_scope(schema, scope)?;
            if let Some(sql) = render_clauses(&Ctx { registry, schema }, &clauses, q)? {
                parts.push(if clauses.len() > 1 { format!("({})", sql) } else { sql });
            }
        }
        if let Some(sql) = render_clauses(&Ctx { registry, schema }, &self.clauses, q)? {
            parts.push(if !parts.is_empty() && self.clauses.len() > 1 {
                format!("({})", sql)
            } else {
                sql
            });
        }
        Ok(if parts.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", parts.join(" AND "))
        })
    }
}

/// SELECT list: every declared field, optionally qualified by a table alias.
pub fn select_column_list(schema: &ResourceSchema, alias: Option<&str>) -> String {
    schema
        .fields
        .iter()
        .map(|f| match alias {
            Some(a) => format!("{}.{}", a, quoted(&f.name)),
            None => quoted(&f.name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn column<'a>(schema: &'a ResourceSchema, name: &str) -> Result<&'a Field, EngineError> {
    schema.field(name).ok_or_else(|| EngineError::UnknownField {
        resource: schema.name.clone(),
        field: name.to_string(),
    })
}

fn expand_scope(schema: &ResourceSchema, scope: &ScopeUse) -> Result<Vec<Clause>, EngineError> {
    let def = schema.scope(&scope.name).ok_or_else(|| {
        EngineError::QueryBuild(format!("unknown scope '{}' on {}", scope.name, schema.name))
    })?;
    if let Some(extra) = scope.args.keys().find(|k| !def.params.contains(k)) {
        return Err(EngineError::QueryBuild(format!(
            "scope '{}' has no parameter '{}'",
            def.name, extra
        )));
    }
    def.conditions
        .iter()
        .map(|c: &ScopeCondition| -> Result<Clause, EngineError> {
            let value = match &c.value {
                None => Value::Null,
                Some(ScopeOperand::Literal(v)) => Value::from_json(v),
                Some(ScopeOperand::Param { param }) => scope.args.get(param).cloned().ok_or_else(|| {
                    EngineError::QueryBuild(format!("scope '{}' requires parameter '{}'", def.name, param))
                })?,
            };
            let condition = Condition::compare(c.field.clone(), c.op, value);
            Ok(if c.or { Clause::or(condition) } else { Clause::and(condition) })
        })
        .collect()
}

struct Ctx<'a> {
    registry: &'a SchemaRegistry,
    schema: &'a ResourceSchema,
}

/// Left-to-right fold; a change of connective parenthesises everything before it.
fn render_clauses(ctx: &Ctx<'_>, clauses: &[Clause], q: &mut QueryBuf) -> Result<Option<String>, EngineError> {
    let mut acc: Option<String> = None;
    let mut prev: Option<Connective> = None;
    for clause in clauses {
        let sql = render_condition(ctx, &clause.condition, q)?;
        acc = Some(match acc {
            None => sql,
            Some(left) => {
                let left = match prev {
                    Some(p) if p != clause.connective => format!("({})", left),
                    _ => left,
                };
                prev = Some(clause.connective);
                format!("{} {} {}", left, clause.connective, sql)
            }
        });
    }
    Ok(acc)
}

fn render_condition(ctx: &Ctx<'_>, condition: &Condition, q: &mut QueryBuf) -> Result<String, EngineError> {
    match condition {
        Condition::Group(clauses) => Ok(match render_clauses(ctx, clauses, q)? {
            Some(sql) => format!("({})", sql),
            None => "1 = 1".into(),
        }),
        Condition::Compare { field, op, value } => match field.split_once('.') {
            None => {
                let f = column(ctx.schema, field)?;
                compare(&format!("{}.{}", MAIN_ALIAS, quoted(&f.name)), f, *op, value, q)
            }
            Some((rel, rest)) => related_compare(ctx, rel, rest, *op, value, q),
        },
    }
}

/// `EXISTS` over the related table, correlated to the main row.
fn related_compare(
    ctx: &Ctx<'_>,
    rel_name: &str,
    field: &str,
    op: Operator,
    value: &Value,
    q: &mut QueryBuf,
) -> Result<String, EngineError> {
    let schema = ctx.schema;
    let rel = schema.relationship(rel_name).ok_or_else(|| EngineError::UnknownField {
        resource: schema.name.clone(),
        field: format!("{}.{}", rel_name, field),
    })?;
    if field.contains('.') {
        return Err(EngineError::QueryBuild(format!(
            "condition paths may cross one relationship: {}.{}",
            rel_name, field
        )));
    }
    let target = ctx.registry.resource(&rel.target)?;
    let f = column(&target, field)?;
    let alias = quoted(&format!("rel_{}", rel.name));
    let cond = compare(&format!("{}.{}", alias, quoted(&f.name)), f, op, value, q)?;
    let target_table = qualified_table(&target.pg_schema, &target.table);
    let main = |col: &str| format!("{}.{}", MAIN_ALIAS, quoted(col));
    let sub = |col: &str| format!("{}.{}", alias, quoted(col));

    Ok(match &rel.kind {
        RelationshipKind::OwningReference { foreign_key, .. } => format!(
            "EXISTS (SELECT 1 FROM {} {} WHERE {} = {} AND {})",
            target_table,
            alias,
            sub(&target.primary_key),
            main(foreign_key),
            cond
        ),
        RelationshipKind::OwnedCollection { foreign_key, .. } | RelationshipKind::OwnedSingle { foreign_key } => {
            format!(
                "EXISTS (SELECT 1 FROM {} {} WHERE {} = {} AND {})",
                target_table,
                alias,
                sub(foreign_key),
                main(&schema.primary_key),
                cond
            )
        }
        RelationshipKind::CollectionThroughJoin {
            join_table,
            foreign_key,
            association_key,
            ..
        } => {
            let join = ctx.registry.resource(join_table)?;
            format!(
                "EXISTS (SELECT 1 FROM {} \"jt\" JOIN {} {} ON {} = \"jt\".{} WHERE \"jt\".{} = {} AND {})",
                qualified_table(&join.pg_schema, &join.table),
                target_table,
                alias,
                sub(&target.primary_key),
                quoted(association_key),
                quoted(foreign_key),
                main(&schema.primary_key),
                cond
            )
        }
    })
}

fn bind(field: &Field, value: &Value, q: &mut QueryBuf) -> Result<String, EngineError> {
    let v = value.clone().conform(field.field_type).map_err(|reason| {
        EngineError::QueryBuild(format!("{}: {}", field.name, reason))
    })?;
    Ok(q.placeholder(v, field.cast()))
}

fn scalar<'v>(field: &Field, op: Operator, value: &'v Value) -> Result<&'v Value, EngineError> {
    match value {
        Value::Null | Value::List(_) | Value::Record(_) => Err(EngineError::QueryBuild(format!(
            "{:?} on {} needs a single non-null value",
            op, field.name
        ))),
        v => Ok(v),
    }
}

fn compare(col: &str, field: &Field, op: Operator, value: &Value, q: &mut QueryBuf) -> Result<String, EngineError> {
    Ok(match op {
        Operator::Eq if value.is_null() => format!("{} IS NULL", col),
        Operator::Ne if value.is_null() => format!("{} IS NOT NULL", col),
        Operator::IsNull => format!("{} IS NULL", col),
        Operator::IsNotNull => format!("{} IS NOT NULL", col),
        Operator::Eq | Operator::Ne | Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
            let sym = match op {
                Operator::Eq => "=",
                Operator::Ne => "<>",
                Operator::Lt => "<",
                Operator::Lte => "<=",
                Operator::Gt => ">",
                _ => ">=",
            };
            let ph = bind(field, scalar(field, op, value)?, q)?;
            format!("{} {} {}", col, sym, ph)
        }
        Operator::Like | Operator::ILike => {
            if !field.field_type.is_textual() {
                return Err(EngineError::QueryBuild(format!(
                    "pattern match on non-text field {}",
                    field.name
                )));
            }
            let ph = bind(field, scalar(field, op, value)?, q)?;
            let kw = if op == Operator::Like { "LIKE" } else { "ILIKE" };
            format!("{} {} {}", col, kw, ph)
        }
        Operator::In | Operator::NotIn => {
            let items = value.as_list().ok_or_else(|| {
                EngineError::QueryBuild(format!("{:?} on {} needs a list", op, field.name))
            })?;
            if items.is_empty() {
                // empty set: nothing is in it, everything is outside it
                return Ok(if op == Operator::In { "1 = 0" } else { "1 = 1" }.into());
            }
            let phs = items
                .iter()
                .map(|v| bind(field, scalar(field, op, v)?, q))
                .collect::<Result<Vec<_>, _>>()?;
            let kw = if op == Operator::In { "IN" } else { "NOT IN" };
            format!("{} {} ({})", col, kw, phs.join(", "))
        }
        Operator::Between => match value.as_list() {
            Some([lo, hi]) => {
                let lo = bind(field, scalar(field, op, lo)?, q)?;
                let hi = bind(field, scalar(field, op, hi)?, q)?;
                format!("{} BETWEEN {} AND {}", col, lo, hi)
            }
            _ => {
                return Err(EngineError::QueryBuild(format!(
                    "between on {} needs exactly two values",
                    field.name
                )))
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::blog_registry;
    use pretty_assertions::assert_eq;

    const POSTS: &str = "\"public\".\"posts\" main";

    fn cols() -> String {
        let registry = blog_registry();
        select_column_list(&registry.get("posts").unwrap(), Some(MAIN_ALIAS))
    }

    #[test]
    fn literals_become_cast_parameters() {
        let registry = blog_registry();
        let q = Query::new("posts")
            .where_eq("title", "Robert'); DROP TABLE posts;--")
            .filter("published_at", Operator::Gte, "2024-01-01T00:00:00Z")
            .compile(&registry, 1000)
            .unwrap();
        assert_eq!(
            q.sql,
            format!(
                "SELECT {} FROM {} WHERE main.\"title\" = $1::text AND main.\"published_at\" >= $2::timestamptz ORDER BY main.\"id\" ASC",
                cols(),
                POSTS
            )
        );
        assert_eq!(q.params[0], Value::from("Robert'); DROP TABLE posts;--"));
        assert!(matches!(q.params[1], Value::Timestamp(_)));
    }

    #[test]
    fn unknown_fields_are_rejected_not_emitted() {
        let registry = blog_registry();
        let err = Query::new("posts")
            .where_eq("title\" OR 1=1 --", "x")
            .compile(&registry, 1000)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownField { .. }));

        let err = Query::new("posts")
            .order_by("rating", Direction::Desc)
            .compile(&registry, 1000)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownField { ref field, .. } if field == "rating"));
    }

    #[test]
    fn mixed_connectives_fold_left_to_right() {
        let registry = blog_registry();
        let q = Query::new("posts")
            .where_eq("author_id", 1)
            .where_eq("title", "a")
            .or_filter("title", Operator::IsNull, Value::Null)
            .compile_count(&registry)
            .unwrap();
        assert_eq!(
            q.sql,
            format!(
                "SELECT COUNT(*) AS \"count\" FROM {} WHERE (main.\"author_id\" = $1::int8 AND main.\"title\" = $2::text) OR main.\"title\" IS NULL",
                POSTS
            )
        );

        let q = Query::new("posts")
            .where_eq("author_id", 1)
            .group(vec![
                Clause::and(Condition::compare("title", Operator::Eq, "a")),
                Clause::or(Condition::compare("title", Operator::Eq, "b")),
            ])
            .compile_count(&registry)
            .unwrap();
        assert!(q
            .sql
            .ends_with("WHERE main.\"author_id\" = $1::int8 AND (main.\"title\" = $2::text OR main.\"title\" = $3::text)"));
    }

    #[test]
    fn set_range_and_pattern_operators() {
        let registry = blog_registry();
        let q = Query::new("posts")
            .filter("id", Operator::In, vec![Value::Int(1), Value::Int(2)])
            .filter("author_id", Operator::Between, vec![Value::Int(3), Value::Int(9)])
            .filter("title", Operator::ILike, "%rust%")
            .filter("author_id", Operator::NotIn, Vec::<Value>::new())
            .compile_count(&registry)
            .unwrap();
        assert!(q.sql.ends_with(
            "WHERE main.\"id\" IN ($1::int8, $2::int8) AND main.\"author_id\" BETWEEN $3::int8 AND $4::int8 AND main.\"title\" ILIKE $5::text AND 1 = 1"
        ));
        assert_eq!(q.params.len(), 5);

        let q = Query::new("posts")
            .filter("id", Operator::In, Vec::<Value>::new())
            .compile_count(&registry)
            .unwrap();
        assert!(q.sql.ends_with("WHERE 1 = 0"));

        let err = Query::new("posts")
            .filter("author_id", Operator::Between, vec![Value::Int(3)])
            .compile_count(&registry)
            .unwrap_err();
        assert!(matches!(err, EngineError::QueryBuild(_)));
        let err = Query::new("posts")
            .filter("author_id", Operator::Like, "3%")
            .compile_count(&registry)
            .unwrap_err();
        assert!(matches!(err, EngineError::QueryBuild(_)));
    }

    #[test]
    fn scopes_merge_additively_with_caller_conditions() {
        let registry = blog_registry();
        let q = Query::new("posts")
            .scope("by_author", [("author", Value::Int(7))])
            .scope::<&str>("published", [])
            .where_eq("title", "a")
            .or_filter("title", Operator::Eq, "b")
            .compile_count(&registry)
            .unwrap();
        assert!(q.sql.ends_with(
            "WHERE main.\"author_id\" = $1::int8 AND main.\"published_at\" IS NOT NULL AND (main.\"title\" = $2::text OR main.\"title\" = $3::text)"
        ));
        assert_eq!(q.params, vec![Value::Int(7), Value::from("a"), Value::from("b")]);

        let err = Query::new("posts")
            .scope::<&str>("by_author", [])
            .compile_count(&registry)
            .unwrap_err();
        assert!(err.to_string().contains("requires parameter 'author'"));
    }

    #[test]
    fn relationship_paths_compile_to_exists() {
        let registry = blog_registry();
        let q = Query::new("posts")
            .where_eq("author.name", "ada")
            .filter("tags.label", Operator::Eq, "rust")
            .compile_count(&registry)
            .unwrap();
        assert_eq!(
            q.sql,
            format!(
                "SELECT COUNT(*) AS \"count\" FROM {} WHERE EXISTS (SELECT 1 FROM \"public\".\"users\" \"rel_author\" WHERE \"rel_author\".\"id\" = main.\"author_id\" AND \"rel_author\".\"name\" = $1::text) AND EXISTS (SELECT 1 FROM \"public\".\"post_tags\" \"jt\" JOIN \"public\".\"tags\" \"rel_tags\" ON \"rel_tags\".\"id\" = \"jt\".\"tag_id\" WHERE \"jt\".\"post_id\" = main.\"id\" AND \"rel_tags\".\"label\" = $2::text)",
                POSTS
            )
        );
    }

    #[test]
    fn limit_is_capped_and_lock_appended() {
        let registry = blog_registry();
        let q = Query::new("posts")
            .order_by("published_at", Direction::Desc)
            .limit(5000)
            .offset(20)
            .for_update()
            .compile(&registry, 1000)
            .unwrap();
        assert!(q
            .sql
            .ends_with("ORDER BY main.\"published_at\" DESC LIMIT 1000 OFFSET 20 FOR UPDATE"));
    }

    #[test]
    fn eq_null_means_is_null() {
        let registry = blog_registry();
        let q = Query::new("posts")
            .where_eq("published_at", Value::Null)
            .compile_count(&registry)
            .unwrap();
        assert!(q.sql.ends_with("WHERE main.\"published_at\" IS NULL"));
        assert!(q.params.is_empty());
    }
}
