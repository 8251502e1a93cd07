//! Record validation: field constraints, required references, procedural validators and
//! uniqueness, collected into one report.

use crate::db::Connection;
use crate::error::{EngineError, ValidationReport};
use crate::hooks::HookExecutor;
use crate::schema::{Field, RelationshipKind, ResourceSchema, SchemaRegistry};
use crate::sql::{Operator, Query, QueryBuf};
use crate::tracker::ChangeSet;
use crate::value::{Record, Value};
use regex::Regex;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

pub struct RecordChecks<'a> {
    pub registry: &'a SchemaRegistry,
    pub hooks: &'a HookExecutor,
}

impl RecordChecks<'_> {
    /// Everything wrong with `changes.current()`. `existing_id` is the row being updated, if any;
    /// it is excluded from uniqueness counts. Only changed values are checked against the
    /// database.
    pub async fn run<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        schema: &ResourceSchema,
        changes: &mut ChangeSet,
        existing_id: Option<&Value>,
    ) -> Result<ValidationReport, EngineError> {
        let mut report = ValidationReport::new();
        conform(schema, changes, &mut report);
        check_fields(schema, changes.current(), existing_id.is_none(), &mut report);
        check_required_references(schema, changes.current(), &mut report);
        self.hooks.validate(schema, changes.current(), &mut report);
        self.check_references_exist(conn, schema, changes, &mut report).await?;
        self.check_unique(conn, schema, changes, existing_id, &mut report).await?;
        Ok(report)
    }

    async fn check_references_exist<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        schema: &ResourceSchema,
        changes: &ChangeSet,
        report: &mut ValidationReport,
    ) -> Result<(), EngineError> {
        for rel in &schema.relationships {
            let RelationshipKind::OwningReference { foreign_key, .. } = &rel.kind else {
                continue;
            };
            if !changes.changed(foreign_key) {
                continue;
            }
            let Some(value) = changes.current().get(foreign_key).filter(|v| !v.is_null()) else {
                continue;
            };
            if report.has(foreign_key, "type") {
                continue;
            }
            let target = self.registry.resource(&rel.target)?;
            let q = Query::new(&target.name)
                .where_eq(target.primary_key.clone(), value.clone())
                .compile_count(self.registry)?;
            if count(conn, &q).await? == 0 {
                report.add(
                    foreign_key,
                    "reference",
                    format!("{} {} does not exist", rel.target, value),
                );
            }
        }
        Ok(())
    }

    async fn check_unique<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        schema: &ResourceSchema,
        changes: &ChangeSet,
        existing_id: Option<&Value>,
        report: &mut ValidationReport,
    ) -> Result<(), EngineError> {
        for field in schema.fields.iter().filter(|f| f.is_unique()) {
            if !changes.changed(&field.name) || report.has(&field.name, "type") {
                continue;
            }
            let Some(value) = changes.current().get(&field.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let mut query = Query::new(&schema.name).where_eq(field.name.clone(), value.clone());
            if let Some(id) = existing_id {
                query = query.filter(schema.primary_key.clone(), Operator::Ne, id.clone());
            }
            let q = query.compile_count(self.registry)?;
            if count(conn, &q).await? > 0 {
                report.add(&field.name, "unique", format!("{} '{}' is already taken", field.name, value));
            }
        }
        Ok(())
    }
}

async fn count<C: Connection + ?Sized>(conn: &mut C, q: &QueryBuf) -> Result<i64, EngineError> {
    let row = conn.fetch_optional(q).await?;
    Ok(row
        .as_ref()
        .and_then(|r| r.get("count"))
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

/// Reject undeclared keys before anything else sees the record.
pub fn ensure_known_fields(schema: &ResourceSchema, record: &Record) -> Result<(), EngineError> {
    match record.fields().find(|f| schema.field(f).is_none()) {
        Some(unknown) => Err(EngineError::UnknownField {
            resource: schema.name.clone(),
            field: unknown.to_string(),
        }),
        None => Ok(()),
    }
}

/// Fit every present value to its column type; mismatches become `type` violations.
fn conform(schema: &ResourceSchema, changes: &mut ChangeSet, report: &mut ValidationReport) {
    let present: Vec<(String, Value)> = changes
        .current()
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    for (name, value) in present {
        let Some(field) = schema.field(&name) else { continue };
        match value.clone().conform(field.field_type) {
            Ok(v) if v != value => changes.set(name, v),
            Ok(_) => {}
            Err(reason) => report.add(&name, "type", format!("{} {}", name, reason)),
        }
    }
}

/// Declared constraints per field. `creating` also requires fields the database cannot fill.
pub fn check_fields(schema: &ResourceSchema, record: &Record, creating: bool, report: &mut ValidationReport) {
    for field in &schema.fields {
        let value = record.get(&field.name);
        let missing = value.map(Value::is_null).unwrap_or(true);
        if field.is_required() && missing {
            let absent_on_create = creating && value.is_none() && field.has_default();
            if !absent_on_create {
                report.add(&field.name, "required", format!("{} is required", field.name));
            }
            continue;
        }
        if let Some(v) = value.filter(|v| !v.is_null()) {
            check_value(field, v, report);
        }
    }
}

fn check_value(field: &Field, v: &Value, report: &mut ValidationReport) {
    let col = field.name.as_str();
    let c = &field.constraints;
    if let Some(format) = &c.format {
        check_format(col, v, format, report);
    }
    if let Some(s) = v.as_str() {
        let len = s.chars().count();
        if let Some(max) = c.max_length {
            if len > max as usize {
                report.add(col, "max_length", format!("{} must be at most {} characters", col, max));
            }
        }
        if let Some(min) = c.min_length {
            if len < min as usize {
                report.add(col, "min_length", format!("{} must be at least {} characters", col, min));
            }
        }
        if let Some(pattern) = &c.pattern {
            match compiled_pattern(pattern) {
                Some(re) if !re.is_match(s) => {
                    report.add(col, "pattern", format!("{} does not match required pattern", col))
                }
                Some(_) => {}
                None => report.add(col, "pattern", format!("invalid pattern for {}", col)),
            }
        }
    }
    if let Some(allowed) = &c.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            report.add(
                col,
                "allowed",
                format!(
                    "{} must be one of: {:?}",
                    col,
                    allowed.iter().take(5).collect::<Vec<_>>()
                ),
            );
        }
    }
    if let Some(n) = v.as_f64() {
        if let Some(min) = c.min {
            if n < min {
                report.add(col, "minimum", format!("{} must be at least {}", col, min));
            }
        }
        if let Some(max) = c.max {
            if n > max {
                report.add(col, "maximum", format!("{} must be at most {}", col, max));
            }
        }
    }
}

/// Field patterns compiled once per distinct source. Registration already rejects patterns
/// that do not compile, so None only shows up for hand-built schemas.
fn compiled_pattern(pattern: &str) -> Option<Regex> {
    static PATTERNS: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();
    let cache = PATTERNS.get_or_init(Default::default);
    if let Some(re) = cache.read().unwrap_or_else(PoisonError::into_inner).get(pattern) {
        return Some(re.clone());
    }
    let re = Regex::new(pattern).ok()?;
    cache
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(pattern.to_string(), re.clone());
    Some(re)
}

fn value_eq(v: &Value, allowed: &Json) -> bool {
    match (v.as_f64(), allowed.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => v.to_json() == *allowed,
    }
}

fn check_format(col: &str, v: &Value, format: &str, report: &mut ValidationReport) {
    match format.to_lowercase().as_str() {
        "email" => {
            if let Some(s) = v.as_str() {
                let valid = match s.split_once('@') {
                    Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.ends_with('.'),
                    None => false,
                };
                if !valid {
                    report.add(col, "format", format!("{} must be a valid email", col));
                }
            }
        }
        "uuid" => {
            let valid = match v {
                Value::Uuid(_) => true,
                Value::Text(s) => uuid::Uuid::parse_str(s).is_ok(),
                _ => false,
            };
            if !valid {
                report.add(col, "format", format!("{} must be a valid UUID", col));
            }
        }
        _ => {}
    }
}

/// A non-nullable owning reference needs its foreign key set.
fn check_required_references(schema: &ResourceSchema, record: &Record, report: &mut ValidationReport) {
    for rel in &schema.relationships {
        if let RelationshipKind::OwningReference {
            foreign_key,
            nullable: false,
            ..
        } = &rel.kind
        {
            let set = record.get(foreign_key).map(|v| !v.is_null()).unwrap_or(false);
            if !set && !report.has(foreign_key, "required") {
                report.add(
                    foreign_key,
                    "required",
                    format!("{} must reference a {}", rel.name, rel.target),
                );
            }
        }
    }
}
