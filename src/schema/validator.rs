//! Definition validation: nullability completeness, identifier safety, referential integrity
//! and cascade legality.

use crate::error::SchemaError;
use crate::schema::resolved::{RelationshipKind, ResourceSchema};
use crate::schema::types::*;
use crate::value::Value;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

const FORMATS: &[&str] = &["email", "uuid", "url"];

/// Table, column and relationship names must be plain identifiers before they can reach SQL.
pub fn is_identifier(s: &str) -> bool {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    matches!(
        RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")),
        Ok(re) if re.is_match(s)
    )
}

fn ident(resource: &str, what: &str, s: &str) -> Result<(), SchemaError> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(SchemaError::invalid(resource, format!("{} '{}' is not a valid identifier", what, s)))
    }
}

/// Checks that need nothing but the definition itself.
pub fn validate_definition(def: &ResourceDefinition) -> Result<(), SchemaError> {
    let r = def.name.as_str();
    ident(r, "resource name", r)?;
    if let Some(t) = &def.table {
        ident(r, "table", t)?;
    }
    if let Some(s) = &def.schema {
        ident(r, "schema", s)?;
    }

    let mut names = HashSet::new();
    for f in &def.fields {
        ident(r, "field", &f.name)?;
        if !names.insert(f.name.as_str()) {
            return Err(SchemaError::invalid(r, format!("duplicate field '{}'", f.name)));
        }
        match (f.required, f.optional) {
            (None, None) => {
                return Err(SchemaError::invalid(
                    r,
                    format!("field '{}' must declare required or optional", f.name),
                ))
            }
            (Some(req), Some(opt)) if req == opt => {
                return Err(SchemaError::invalid(
                    r,
                    format!("field '{}' has ambiguous nullability (required={}, optional={})", f.name, req, opt),
                ))
            }
            _ => {}
        }
        validate_constraints(r, f)?;
    }

    if !names.contains(def.primary_key.as_str()) {
        return Err(SchemaError::invalid(
            r,
            format!("primary key '{}' is not a declared field", def.primary_key),
        ));
    }

    let mut rel_names = HashSet::new();
    for rel in &def.relationships {
        ident(r, "relationship", &rel.name)?;
        if names.contains(rel.name.as_str()) || !rel_names.insert(rel.name.as_str()) {
            return Err(SchemaError::relationship(r, &rel.name, "name collides with a field or relationship"));
        }
        for key in [&rel.foreign_key, &rel.association_key, &rel.join_table].into_iter().flatten() {
            ident(r, "relationship key", key)?;
        }
    }

    for idx in &def.indexes {
        if idx.fields.is_empty() {
            return Err(SchemaError::invalid(r, "index must name at least one field"));
        }
        if let Some(n) = &idx.name {
            ident(r, "index", n)?;
        }
        for f in &idx.fields {
            if !names.contains(f.as_str()) {
                return Err(SchemaError::invalid(r, format!("index field '{}' is not declared", f)));
            }
        }
    }

    let mut scope_names = HashSet::new();
    for scope in &def.scopes {
        if !scope_names.insert(scope.name.as_str()) {
            return Err(SchemaError::invalid(r, format!("duplicate scope '{}'", scope.name)));
        }
        for cond in &scope.conditions {
            let head = cond.field.split('.').next().unwrap_or_default();
            if !names.contains(head) && !rel_names.contains(head) {
                return Err(SchemaError::invalid(
                    r,
                    format!("scope '{}' references unknown field '{}'", scope.name, cond.field),
                ));
            }
            if let Some(ScopeOperand::Param { param }) = &cond.value {
                if !scope.params.contains(param) {
                    return Err(SchemaError::invalid(
                        r,
                        format!("scope '{}' uses undeclared parameter '{}'", scope.name, param),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_constraints(resource: &str, f: &FieldDefinition) -> Result<(), SchemaError> {
    let c = &f.constraints;
    let bad = |msg: String| Err(SchemaError::invalid(resource, format!("field '{}': {}", f.name, msg)));

    if let Some(p) = &c.pattern {
        if let Err(e) = Regex::new(p) {
            return bad(format!("pattern does not compile: {}", e));
        }
    }
    if let Some(fmt) = &c.format {
        if !FORMATS.contains(&fmt.as_str()) {
            return bad(format!("unknown format '{}'", fmt));
        }
    }
    if (c.min_length.is_some() || c.max_length.is_some()) && !f.type_.is_textual() {
        return bad("length constraints apply to string fields only".into());
    }
    if let (Some(min), Some(max)) = (c.min_length, c.max_length) {
        if min > max {
            return bad(format!("min_length {} exceeds max_length {}", min, max));
        }
    }
    if (c.min.is_some() || c.max.is_some()) && !f.type_.is_numeric() {
        return bad("min/max apply to numeric fields only".into());
    }
    if let (Some(min), Some(max)) = (c.min, c.max) {
        if min > max {
            return bad(format!("min {} exceeds max {}", min, max));
        }
    }
    match &c.default {
        Some(DefaultValue::Literal(v)) => {
            if let Err(reason) = Value::coerce(f.type_, v) {
                return bad(format!("default {}", reason));
            }
        }
        Some(DefaultValue::Generated(g)) => {
            let fits = match g {
                Generator::Uuid => f.type_ == FieldType::Uuid,
                Generator::Now => matches!(f.type_, FieldType::Timestamp | FieldType::Date),
                Generator::Increment => f.type_.is_integer(),
            };
            if !fits {
                return bad(format!("generated default {:?} does not fit type {:?}", g, f.type_));
            }
        }
        None => {}
    }
    Ok(())
}

/// Checks on the declaring side of each relationship, after resolution.
pub fn validate_local(schema: &ResourceSchema) -> Result<(), SchemaError> {
    for rel in &schema.relationships {
        let RelationshipKind::OwningReference {
            foreign_key,
            nullable,
            on_delete,
            on_update,
        } = &rel.kind
        else {
            continue;
        };
        let fk = schema.field(foreign_key).ok_or_else(|| {
            SchemaError::relationship(&schema.name, &rel.name, format!("foreign key '{}' is not a declared field", foreign_key))
        })?;
        if fk.is_optional() != *nullable {
            return Err(SchemaError::relationship(
                &schema.name,
                &rel.name,
                format!(
                    "nullable={} disagrees with foreign key '{}' being {}",
                    nullable,
                    foreign_key,
                    if fk.is_optional() { "optional" } else { "required" }
                ),
            ));
        }
        for policy in [on_delete, on_update] {
            match policy {
                CascadePolicy::SetNull if !nullable => {
                    return Err(SchemaError::relationship(
                        &schema.name,
                        &rel.name,
                        "set_null requires a nullable foreign key",
                    ))
                }
                CascadePolicy::SetDefault if !fk.has_default() => {
                    return Err(SchemaError::relationship(
                        &schema.name,
                        &rel.name,
                        "set_default requires a default on the foreign key",
                    ))
                }
                _ => {}
            }
        }
        if rel.target == schema.name && !nullable {
            return Err(SchemaError::relationship(
                &schema.name,
                &rel.name,
                "self reference must be nullable",
            ));
        }
    }
    Ok(())
}

/// Cross-resource checks. `known` holds every resource visible to the batch being registered.
pub fn validate_references(
    schema: &ResourceSchema,
    known: &BTreeMap<&str, &ResourceSchema>,
) -> Result<(), SchemaError> {
    let lookup = |rel: &str, name: &str| {
        known.get(name).copied().ok_or_else(|| {
            SchemaError::relationship(&schema.name, rel, format!("unknown resource '{}'", name))
        })
    };
    let has_field = |rel: &str, owner: &ResourceSchema, field: &str| {
        if owner.field(field).is_some() {
            Ok(())
        } else {
            Err(SchemaError::relationship(
                &schema.name,
                rel,
                format!("'{}' has no field '{}'", owner.name, field),
            ))
        }
    };

    for rel in &schema.relationships {
        let target = lookup(&rel.name, &rel.target)?;
        match &rel.kind {
            RelationshipKind::OwningReference { foreign_key, .. } => {
                let (Some(fk), Some(pk)) = (schema.field(foreign_key), target.primary_key_field()) else {
                    continue;
                };
                let compatible = fk.field_type == pk.field_type
                    || (fk.field_type.is_integer() && pk.field_type.is_integer());
                if !compatible {
                    return Err(SchemaError::relationship(
                        &schema.name,
                        &rel.name,
                        format!(
                            "foreign key type {:?} does not match {}.{} ({:?})",
                            fk.field_type, target.name, pk.name, pk.field_type
                        ),
                    ));
                }
            }
            RelationshipKind::OwnedCollection { foreign_key, order } => {
                has_field(&rel.name, target, foreign_key)?;
                if let Some(o) = order {
                    has_field(&rel.name, target, &o.field)?;
                }
            }
            RelationshipKind::OwnedSingle { foreign_key } => has_field(&rel.name, target, foreign_key)?,
            RelationshipKind::CollectionThroughJoin {
                join_table,
                foreign_key,
                association_key,
                order,
            } => {
                let join = lookup(&rel.name, join_table)?;
                has_field(&rel.name, join, foreign_key)?;
                has_field(&rel.name, join, association_key)?;
                if let Some(o) = order {
                    has_field(&rel.name, target, &o.field)?;
                }
            }
        }
    }

    for scope in &schema.scopes {
        for cond in &scope.conditions {
            let Some((rel_name, rest)) = cond.field.split_once('.') else {
                continue;
            };
            let rel = schema.relationship(rel_name).ok_or_else(|| {
                SchemaError::invalid(&schema.name, format!("scope '{}': unknown relationship '{}'", scope.name, rel_name))
            })?;
            let target = lookup(&rel.name, &rel.target)?;
            if rest.contains('.') || target.field(rest).is_none() {
                return Err(SchemaError::invalid(
                    &schema.name,
                    format!("scope '{}': '{}' does not resolve to a field", scope.name, cond.field),
                ));
            }
        }
    }
    Ok(())
}
