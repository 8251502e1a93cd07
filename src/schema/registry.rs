//! Process-wide resource registry: written during startup, read-only once sealed.

use crate::error::{EngineError, SchemaError};
use crate::migration::SchemaSnapshot;
use crate::schema::graph::OwnershipGraph;
use crate::schema::resolved::ResourceSchema;
use crate::schema::types::ResourceDefinition;
use crate::schema::validator::validate_references;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

type SchemaMap = BTreeMap<String, Arc<ResourceSchema>>;

/// Holds every validated [`ResourceSchema`]. Registration takes the write lock; after
/// [`SchemaRegistry::seal`] lookups go to a frozen map without locking.
#[derive(Debug)]
pub struct SchemaRegistry {
    default_schema: String,
    staged: RwLock<SchemaMap>,
    sealed: OnceLock<SchemaMap>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new("public")
    }
}

impl SchemaRegistry {
    /// `default_schema` is the PostgreSQL schema for resources that do not name one.
    pub fn new(default_schema: &str) -> Self {
        Self {
            default_schema: default_schema.to_string(),
            staged: RwLock::new(BTreeMap::new()),
            sealed: OnceLock::new(),
        }
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    pub fn register(&self, def: ResourceDefinition) -> Result<(), SchemaError> {
        self.register_all(vec![def])
    }

    /// Validate and insert a batch. Relationship targets may be earlier registrations or other
    /// members of the batch. Nothing from the batch is inserted unless every member is valid.
    pub fn register_all(&self, defs: Vec<ResourceDefinition>) -> Result<(), SchemaError> {
        if self.is_sealed() {
            let name = defs.first().map(|d| d.name.clone()).unwrap_or_default();
            return Err(SchemaError::Sealed(name));
        }
        let mut staged = self.staged.write().unwrap_or_else(|e| e.into_inner());

        let mut batch: Vec<ResourceSchema> = Vec::with_capacity(defs.len());
        for def in &defs {
            if staged.contains_key(&def.name) || batch.iter().any(|s| s.name == def.name) {
                return Err(SchemaError::DuplicateResource(def.name.clone()));
            }
            batch.push(ResourceSchema::from_definition(def, &self.default_schema)?);
        }

        let mut known: BTreeMap<&str, &ResourceSchema> =
            staged.iter().map(|(k, v)| (k.as_str(), v.as_ref())).collect();
        for s in &batch {
            known.insert(&s.name, s);
        }
        for s in &batch {
            validate_references(s, &known)?;
        }

        for s in batch {
            tracing::debug!(resource = %s.name, table = %s.table, "registered resource");
            staged.insert(s.name.clone(), Arc::new(s));
        }
        Ok(())
    }

    /// Validate the whole graph and freeze the registry.
    pub fn seal(&self) -> Result<(), SchemaError> {
        self.validate_all()?;
        let frozen = self.staged.read().unwrap_or_else(|e| e.into_inner()).clone();
        let count = frozen.len();
        if self.sealed.set(frozen).is_ok() {
            tracing::info!(resources = count, "schema registry sealed");
        }
        Ok(())
    }

    fn with_map<R>(&self, f: impl FnOnce(&SchemaMap) -> R) -> R {
        match self.sealed.get() {
            Some(map) => f(map),
            None => f(&self.staged.read().unwrap_or_else(|e| e.into_inner())),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceSchema>> {
        self.with_map(|m| m.get(name).cloned())
    }

    /// Like [`SchemaRegistry::get`] but failing with `UnknownResource`.
    pub fn resource(&self, name: &str) -> Result<Arc<ResourceSchema>, EngineError> {
        self.get(name)
            .ok_or_else(|| EngineError::UnknownResource(name.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<ResourceSchema>> {
        self.with_map(|m| m.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.with_map(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn graph(&self) -> OwnershipGraph {
        self.with_map(|m| OwnershipGraph::from_schemas(m.values().map(Arc::as_ref)))
    }

    /// Rebuild the OwningReference graph and fail with the full cycle path if it has one.
    pub fn validate_all(&self) -> Result<(), SchemaError> {
        let graph = self.graph();
        if let Some(path) = graph.find_cycle() {
            return Err(SchemaError::Cycle { path });
        }
        graph.topological_order().map(|_| ())
    }

    /// Resource names, each after every resource it references.
    pub fn topological_order(&self) -> Result<Vec<String>, SchemaError> {
        self.graph().topological_order()
    }

    pub fn snapshot(&self) -> SchemaSnapshot {
        self.with_map(|m| SchemaSnapshot::from_schemas(m.values().map(|s| s.as_ref().clone())))
    }

    /// Read-only metadata for introspection readers.
    pub fn describe(&self) -> Vec<ResourceSummary> {
        self.with_map(|m| m.values().map(|s| ResourceSummary::of(s)).collect())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ResourceSummary {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    pub fields: Vec<FieldSummary>,
    pub relationships: Vec<RelationshipSummary>,
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FieldSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: crate::schema::FieldType,
    pub optional: bool,
    pub unique: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RelationshipSummary {
    pub name: String,
    pub kind: &'static str,
    pub target: String,
}

impl ResourceSummary {
    fn of(s: &ResourceSchema) -> Self {
        Self {
            name: s.name.clone(),
            table: s.table.clone(),
            primary_key: s.primary_key.clone(),
            fields: s
                .fields
                .iter()
                .map(|f| FieldSummary {
                    name: f.name.clone(),
                    type_: f.field_type,
                    optional: f.optional,
                    unique: f.is_unique(),
                })
                .collect(),
            relationships: s
                .relationships
                .iter()
                .map(|r| RelationshipSummary {
                    name: r.name.clone(),
                    kind: r.kind.name(),
                    target: r.target.clone(),
                })
                .collect(),
            scopes: s.scopes.iter().map(|sc| sc.name.clone()).collect(),
        }
    }
}
