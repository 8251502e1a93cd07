//! Resolved resource model: definitions validated and flattened for runtime use.

use crate::error::SchemaError;
use crate::schema::types::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub optional: bool,
    #[serde(default)]
    pub constraints: FieldConstraints,
}

impl Field {
    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn is_required(&self) -> bool {
        !self.optional
    }

    /// Whether the column has a DB default (literal, gen_random_uuid(), NOW() or identity).
    pub fn has_default(&self) -> bool {
        self.constraints.default.is_some()
    }

    pub fn is_unique(&self) -> bool {
        self.constraints.unique
    }

    /// Column type used in DDL.
    pub fn pg_type(&self) -> String {
        match (self.field_type, self.constraints.max_length) {
            (FieldType::String, Some(n)) => format!("VARCHAR({})", n),
            (FieldType::String, None) | (FieldType::Text, _) => "TEXT".into(),
            (FieldType::Integer, _) => "INTEGER".into(),
            (FieldType::BigInt, _) => "BIGINT".into(),
            (FieldType::Float, _) => "DOUBLE PRECISION".into(),
            (FieldType::Boolean, _) => "BOOLEAN".into(),
            (FieldType::Timestamp, _) => "TIMESTAMPTZ".into(),
            (FieldType::Date, _) => "DATE".into(),
            (FieldType::Uuid, _) => "UUID".into(),
            (FieldType::Json, _) => "JSONB".into(),
        }
    }

    /// PostgreSQL type name appended to bound placeholders (`$1::timestamptz`).
    pub fn cast(&self) -> &'static str {
        match self.field_type {
            FieldType::String | FieldType::Text => "text",
            FieldType::Integer => "int4",
            FieldType::BigInt => "int8",
            FieldType::Float => "float8",
            FieldType::Boolean => "bool",
            FieldType::Timestamp => "timestamptz",
            FieldType::Date => "date",
            FieldType::Uuid => "uuid",
            FieldType::Json => "jsonb",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Declaring resource holds `foreign_key` pointing at the target's primary key.
    OwningReference {
        foreign_key: String,
        nullable: bool,
        on_delete: CascadePolicy,
        on_update: CascadePolicy,
    },
    /// Target resource holds `foreign_key` pointing back at the declaring primary key.
    OwnedCollection {
        foreign_key: String,
        order: Option<OrderDefinition>,
    },
    OwnedSingle {
        foreign_key: String,
    },
    /// `join_table` is a registered resource; `foreign_key` references the declaring
    /// resource, `association_key` the target.
    CollectionThroughJoin {
        join_table: String,
        foreign_key: String,
        association_key: String,
        order: Option<OrderDefinition>,
    },
}

impl RelationshipKind {
    pub fn name(&self) -> &'static str {
        match self {
            RelationshipKind::OwningReference { .. } => "owning_reference",
            RelationshipKind::OwnedCollection { .. } => "owned_collection",
            RelationshipKind::OwnedSingle { .. } => "owned_single",
            RelationshipKind::CollectionThroughJoin { .. } => "collection_through_join",
        }
    }

    /// Whether loading yields a list (collections) or a single record/null.
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            RelationshipKind::OwnedCollection { .. } | RelationshipKind::CollectionThroughJoin { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub target: String,
    #[serde(flatten)]
    pub kind: RelationshipKind,
}

impl Relationship {
    /// Target of an OwningReference edge, if this relationship is one.
    pub fn owning_target(&self) -> Option<&str> {
        match self.kind {
            RelationshipKind::OwningReference { .. } => Some(&self.target),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub name: String,
    pub table: String,
    pub pg_schema: String,
    pub primary_key: String,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub scopes: Vec<ScopeDefinition>,
    #[serde(default)]
    pub hooks: Vec<HookBinding>,
    #[serde(default)]
    pub validators: Vec<String>,
}

impl ResourceSchema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn scope(&self, name: &str) -> Option<&ScopeDefinition> {
        self.scopes.iter().find(|s| s.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn primary_key_field(&self) -> Option<&Field> {
        self.field(&self.primary_key)
    }

    pub fn hooks_at(&self, point: HookPoint) -> impl Iterator<Item = &str> {
        self.hooks
            .iter()
            .filter(move |h| h.point == point)
            .map(|h| h.name.as_str())
    }

    /// OwningReference targets, excluding nullable self-references.
    pub fn ordering_dependencies(&self) -> impl Iterator<Item = &str> {
        self.relationships.iter().filter_map(move |r| match &r.kind {
            RelationshipKind::OwningReference { nullable, .. } if *nullable && r.target == self.name => None,
            RelationshipKind::OwningReference { .. } => Some(r.target.as_str()),
            _ => None,
        })
    }

    /// Resolve a raw definition. Only checks that need no other resource happen here;
    /// see [`crate::schema::validator`].
    pub fn from_definition(def: &ResourceDefinition, default_schema: &str) -> Result<Self, SchemaError> {
        crate::schema::validator::validate_definition(def)?;

        let fields = def
            .fields
            .iter()
            .map(|f| {
                // Nullability was checked for presence and consistency above.
                let optional = f.optional.or(f.required.map(|r| !r)).unwrap_or(false);
                Field {
                    name: f.name.clone(),
                    field_type: f.type_,
                    optional,
                    constraints: f.constraints.clone(),
                }
            })
            .collect();

        let relationships = def
            .relationships
            .iter()
            .map(|r| resolve_relationship(&def.name, r))
            .collect::<Result<Vec<_>, _>>()?;

        let table = def.table.clone().unwrap_or_else(|| def.name.clone());
        let indexes = def
            .indexes
            .iter()
            .map(|i| Index {
                name: i
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("idx_{}_{}", table, i.fields.join("_"))),
                fields: i.fields.clone(),
                unique: i.unique,
            })
            .collect();

        let schema = ResourceSchema {
            name: def.name.clone(),
            table,
            pg_schema: def.schema.clone().unwrap_or_else(|| default_schema.to_string()),
            primary_key: def.primary_key.clone(),
            fields,
            relationships,
            indexes,
            scopes: def.scopes.clone(),
            hooks: def.hooks.clone(),
            validators: def.validators.clone(),
        };
        crate::schema::validator::validate_local(&schema)?;
        Ok(schema)
    }
}

fn resolve_relationship(resource: &str, r: &RelationshipDefinition) -> Result<Relationship, SchemaError> {
    let need = |value: &Option<String>, what: &str| {
        value
            .clone()
            .ok_or_else(|| SchemaError::relationship(resource, &r.name, format!("{} is required", what)))
    };
    let kind = match r.kind {
        RelationshipKindName::OwningReference => RelationshipKind::OwningReference {
            foreign_key: need(&r.foreign_key, "foreign_key")?,
            nullable: r.nullable.ok_or_else(|| {
                SchemaError::relationship(resource, &r.name, "owning reference must declare nullable explicitly")
            })?,
            on_delete: r.on_delete.ok_or_else(|| {
                SchemaError::relationship(resource, &r.name, "owning reference must declare on_delete explicitly")
            })?,
            on_update: r.on_update.unwrap_or(CascadePolicy::NoAction),
        },
        RelationshipKindName::OwnedCollection => RelationshipKind::OwnedCollection {
            foreign_key: need(&r.foreign_key, "foreign_key")?,
            order: r.order_by.clone(),
        },
        RelationshipKindName::OwnedSingle => RelationshipKind::OwnedSingle {
            foreign_key: need(&r.foreign_key, "foreign_key")?,
        },
        RelationshipKindName::CollectionThroughJoin => RelationshipKind::CollectionThroughJoin {
            join_table: need(&r.join_table, "join_table")?,
            foreign_key: need(&r.foreign_key, "foreign_key")?,
            association_key: need(&r.association_key, "association_key")?,
            order: r.order_by.clone(),
        },
    };
    Ok(Relationship {
        name: r.name.clone(),
        target: r.target.clone(),
        kind,
    })
}
