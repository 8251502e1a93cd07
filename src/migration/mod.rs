//! Schema snapshots, change classification and migration scripts.
//!
//! [`diff`] compares two snapshots, [`generate_migration`] turns the resulting changes into
//! forward and reverse DDL, and [`MigrationLedger`] records what has been applied.

mod ddl;
mod diff;
mod ledger;

pub use diff::diff;
pub use ledger::*;

use crate::error::{EngineError, SchemaError};
use crate::schema::{Field, Index, OwnershipGraph, Relationship, RelationshipKind, ResourceSchema};
use crate::sql::qualified_table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgreSQL schema and table a change applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn of(schema: &ResourceSchema) -> Self {
        TableRef {
            schema: schema.pg_schema.clone(),
            table: schema.table.clone(),
        }
    }

    pub fn qualified(&self) -> String {
        qualified_table(&self.schema, &self.table)
    }
}

/// Referenced table and column of a foreign-key constraint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub table: TableRef,
    pub column: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Relationships are added by separate `AddRelationship` changes once every table exists.
    AddResource { schema: ResourceSchema },
    DropResource { schema: ResourceSchema },
    AddField { field: Field },
    DropField { field: Field },
    ModifyField { from: Field, to: Field },
    AddRelationship {
        relationship: Relationship,
        references: Option<Reference>,
    },
    DropRelationship {
        relationship: Relationship,
        references: Option<Reference>,
    },
    /// Each side carries the constraint target it resolves to in its own snapshot.
    ModifyRelationship {
        from: Relationship,
        to: Relationship,
        from_references: Option<Reference>,
        to_references: Option<Reference>,
    },
    AddIndex { index: Index },
    DropIndex { index: Index },
}

/// One structural difference between two snapshots, classified on construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    resource: String,
    table: TableRef,
    kind: ChangeKind,
    breaking: bool,
    data_loss: bool,
}

impl SchemaChange {
    pub fn new(resource: &str, table: TableRef, kind: ChangeKind) -> Self {
        let (breaking, data_loss) = classify(&kind);
        SchemaChange {
            resource: resource.to_string(),
            table,
            kind,
            breaking,
            data_loss,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn kind(&self) -> &ChangeKind {
        &self.kind
    }

    /// Existing readers or writers may fail after this change.
    pub fn breaking(&self) -> bool {
        self.breaking
    }

    /// Applying this change can destroy stored values.
    pub fn data_loss(&self) -> bool {
        self.data_loss
    }

    pub fn is_safe(&self) -> bool {
        !self.breaking && !self.data_loss
    }

    /// The change that undoes this one.
    pub fn inverse(&self) -> SchemaChange {
        let kind = match &self.kind {
            ChangeKind::AddResource { schema } => ChangeKind::DropResource { schema: schema.clone() },
            ChangeKind::DropResource { schema } => ChangeKind::AddResource { schema: schema.clone() },
            ChangeKind::AddField { field } => ChangeKind::DropField { field: field.clone() },
            ChangeKind::DropField { field } => ChangeKind::AddField { field: field.clone() },
            ChangeKind::ModifyField { from, to } => ChangeKind::ModifyField {
                from: to.clone(),
                to: from.clone(),
            },
            ChangeKind::AddRelationship {
                relationship,
                references,
            } => ChangeKind::DropRelationship {
                relationship: relationship.clone(),
                references: references.clone(),
            },
            ChangeKind::DropRelationship {
                relationship,
                references,
            } => ChangeKind::AddRelationship {
                relationship: relationship.clone(),
                references: references.clone(),
            },
            ChangeKind::ModifyRelationship {
                from,
                to,
                from_references,
                to_references,
            } => ChangeKind::ModifyRelationship {
                from: to.clone(),
                to: from.clone(),
                from_references: to_references.clone(),
                to_references: from_references.clone(),
            },
            ChangeKind::AddIndex { index } => ChangeKind::DropIndex { index: index.clone() },
            ChangeKind::DropIndex { index } => ChangeKind::AddIndex { index: index.clone() },
        };
        SchemaChange::new(&self.resource, self.table.clone(), kind)
    }

    /// One-line human summary, e.g. `drop field posts.body`.
    pub fn describe(&self) -> String {
        let r = &self.resource;
        match &self.kind {
            ChangeKind::AddResource { .. } => format!("add resource {}", r),
            ChangeKind::DropResource { .. } => format!("drop resource {}", r),
            ChangeKind::AddField { field } => format!("add field {}.{}", r, field.name),
            ChangeKind::DropField { field } => format!("drop field {}.{}", r, field.name),
            ChangeKind::ModifyField { from, to } => {
                let mut what = Vec::new();
                if from.field_type != to.field_type {
                    what.push(format!("type {:?} -> {:?}", from.field_type, to.field_type));
                }
                if from.optional != to.optional {
                    what.push(if to.optional { "nullable".into() } else { "required".into() });
                }
                if from.constraints.max_length != to.constraints.max_length {
                    what.push(format!(
                        "max_length {:?} -> {:?}",
                        from.constraints.max_length, to.constraints.max_length
                    ));
                }
                if what.is_empty() {
                    what.push("constraints".into());
                }
                format!("modify field {}.{} ({})", r, to.name, what.join(", "))
            }
            ChangeKind::AddRelationship { relationship, .. } => {
                format!("add relationship {}.{}", r, relationship.name)
            }
            ChangeKind::DropRelationship { relationship, .. } => {
                format!("drop relationship {}.{}", r, relationship.name)
            }
            ChangeKind::ModifyRelationship { to, .. } => format!("modify relationship {}.{}", r, to.name),
            ChangeKind::AddIndex { index } => format!("add index {} on {}", index.name, r),
            ChangeKind::DropIndex { index } => format!("drop index {} on {}", index.name, r),
        }
    }
}

/// (breaking, data_loss) for one change.
fn classify(kind: &ChangeKind) -> (bool, bool) {
    match kind {
        ChangeKind::AddResource { .. } | ChangeKind::AddRelationship { .. } | ChangeKind::AddIndex { .. } => {
            (false, false)
        }
        ChangeKind::DropIndex { .. } => (false, false),
        ChangeKind::AddField { field } => (field.is_required() && !field.has_default(), false),
        ChangeKind::DropField { .. } | ChangeKind::DropResource { .. } => (true, true),
        ChangeKind::DropRelationship { .. } | ChangeKind::ModifyRelationship { .. } => (true, false),
        ChangeKind::ModifyField { from, to } => {
            if from.field_type != to.field_type {
                return (true, true);
            }
            let shrinks = match (from.constraints.max_length, to.constraints.max_length) {
                (Some(a), Some(b)) => b < a,
                (None, Some(_)) => true,
                _ => false,
            };
            if shrinks {
                return (true, true);
            }
            let tightened = (from.optional && !to.optional) || (!from.is_unique() && to.is_unique());
            (tightened, false)
        }
    }
}

/// Point-in-time copy of every resource's structure, keyed by resource name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub resources: BTreeMap<String, ResourceSchema>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_schemas(schemas: impl IntoIterator<Item = ResourceSchema>) -> Self {
        SchemaSnapshot {
            resources: schemas.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResourceSchema> {
        self.resources.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resource names, each after every resource it references.
    pub fn topological_order(&self) -> Result<Vec<String>, SchemaError> {
        OwnershipGraph::from_schemas(self.resources.values()).topological_order()
    }

    /// Replay `changes` onto a copy of this snapshot.
    pub fn apply(&self, changes: &[SchemaChange]) -> Result<SchemaSnapshot, EngineError> {
        let mut next = self.clone();
        for change in changes {
            next.apply_one(change)?;
        }
        Ok(next)
    }

    fn apply_one(&mut self, change: &SchemaChange) -> Result<(), EngineError> {
        let name = change.resource();
        if let ChangeKind::AddResource { schema } = change.kind() {
            if self.resources.contains_key(name) {
                return Err(EngineError::Migration(format!("resource {} already exists", name)));
            }
            self.resources.insert(name.to_string(), schema.clone());
            return Ok(());
        }
        if let ChangeKind::DropResource { .. } = change.kind() {
            return match self.resources.remove(name) {
                Some(_) => Ok(()),
                None => Err(missing("resource", name)),
            };
        }

        let schema = self
            .resources
            .get_mut(name)
            .ok_or_else(|| missing("resource", name))?;
        match change.kind() {
            ChangeKind::AddField { field } => schema.fields.push(field.clone()),
            ChangeKind::DropField { field } => {
                let before = schema.fields.len();
                schema.fields.retain(|f| f.name != field.name);
                if schema.fields.len() == before {
                    return Err(missing("field", &field.name));
                }
            }
            ChangeKind::ModifyField { to, .. } => {
                let slot = schema
                    .fields
                    .iter_mut()
                    .find(|f| f.name == to.name)
                    .ok_or_else(|| missing("field", &to.name))?;
                *slot = to.clone();
            }
            ChangeKind::AddRelationship { relationship, .. } => schema.relationships.push(relationship.clone()),
            ChangeKind::DropRelationship { relationship, .. } => {
                let before = schema.relationships.len();
                schema.relationships.retain(|r| r.name != relationship.name);
                if schema.relationships.len() == before {
                    return Err(missing("relationship", &relationship.name));
                }
            }
            ChangeKind::ModifyRelationship { to, .. } => {
                let slot = schema
                    .relationships
                    .iter_mut()
                    .find(|r| r.name == to.name)
                    .ok_or_else(|| missing("relationship", &to.name))?;
                *slot = to.clone();
            }
            ChangeKind::AddIndex { index } => schema.indexes.push(index.clone()),
            ChangeKind::DropIndex { index } => {
                let before = schema.indexes.len();
                schema.indexes.retain(|i| i.name != index.name);
                if schema.indexes.len() == before {
                    return Err(missing("index", &index.name));
                }
            }
            ChangeKind::AddResource { .. } | ChangeKind::DropResource { .. } => {}
        }
        Ok(())
    }

    /// Same storage shape: tables, fields, relationships and indexes compared by name,
    /// ignoring declaration order.
    pub fn equivalent(&self, other: &SchemaSnapshot) -> bool {
        if self.resources.len() != other.resources.len() {
            return false;
        }
        self.resources.iter().all(|(name, a)| match other.resources.get(name) {
            Some(b) => same_shape(a, b),
            None => false,
        })
    }
}

fn missing(what: &str, name: &str) -> EngineError {
    EngineError::Migration(format!("{} {} does not exist", what, name))
}

fn same_shape(a: &ResourceSchema, b: &ResourceSchema) -> bool {
    fn by_name<'a, T>(items: &'a [T], name: impl Fn(&T) -> &str) -> BTreeMap<&'a str, &'a T> {
        items.iter().map(|i| (name(i), i)).collect::<BTreeMap<_, _>>()
    }
    a.table == b.table
        && a.pg_schema == b.pg_schema
        && a.primary_key == b.primary_key
        && by_name(&a.fields, |f| &f.name) == by_name(&b.fields, |f| &f.name)
        && by_name(&a.relationships, |r| &r.name) == by_name(&b.relationships, |r| &r.name)
        && by_name(&a.indexes, |i| &i.name) == by_name(&b.indexes, |i| &i.name)
}

/// Forward and reverse DDL for an ordered change list, plus its safety flags.
#[derive(Clone, Debug, Serialize)]
pub struct Migration {
    version: i64,
    name: String,
    changes: Vec<SchemaChange>,
    up: Vec<String>,
    down: Vec<String>,
    breaking: bool,
    data_loss: bool,
    #[serde(skip)]
    target: Option<SchemaSnapshot>,
    applied_at: Option<DateTime<Utc>>,
}

/// Build a migration from `changes` in the order given. The reverse script undoes the changes
/// last to first.
pub fn generate_migration(version: i64, name: &str, changes: Vec<SchemaChange>) -> Migration {
    let up: Vec<String> = changes.iter().flat_map(ddl::statements).collect();
    let down: Vec<String> = changes
        .iter()
        .rev()
        .flat_map(|c| ddl::statements(&c.inverse()))
        .collect();
    Migration {
        version,
        name: name.to_string(),
        breaking: changes.iter().any(SchemaChange::breaking),
        data_loss: changes.iter().any(SchemaChange::data_loss),
        changes,
        up,
        down,
        target: None,
        applied_at: None,
    }
}

impl Migration {
    /// Diff `old` against `new` and remember `new` so the ledger can store it once applied.
    pub fn between(
        version: i64,
        name: &str,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
    ) -> Result<Migration, EngineError> {
        let changes = diff(old, new)?;
        let mut migration = generate_migration(version, name, changes);
        migration.target = Some(new.clone());
        Ok(migration)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn changes(&self) -> &[SchemaChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn up(&self) -> &[String] {
        &self.up
    }

    pub fn down(&self) -> &[String] {
        &self.down
    }

    pub fn breaking(&self) -> bool {
        self.breaking
    }

    pub fn data_loss(&self) -> bool {
        self.data_loss
    }

    pub fn target(&self) -> Option<&SchemaSnapshot> {
        self.target.as_ref()
    }

    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        self.applied_at
    }

    pub(crate) fn mark_applied(&mut self, at: DateTime<Utc>) {
        self.applied_at = Some(at);
    }

    /// Fails with `MigrationSafety`, naming the offending changes, unless every change is safe.
    pub fn ensure_auto_applicable(&self) -> Result<(), EngineError> {
        if !self.breaking && !self.data_loss {
            return Ok(());
        }
        Err(EngineError::MigrationSafety {
            version: self.version,
            changes: self.changes.iter().filter(|c| !c.is_safe()).cloned().collect(),
        })
    }
}

/// Owning-reference target column for a relationship, looked up in `snapshot`.
pub(crate) fn reference_for(snapshot: &SchemaSnapshot, relationship: &Relationship) -> Option<Reference> {
    match relationship.kind {
        RelationshipKind::OwningReference { .. } => snapshot.get(&relationship.target).map(|t| Reference {
            table: TableRef::of(t),
            column: t.primary_key.clone(),
        }),
        _ => None,
    }
}
