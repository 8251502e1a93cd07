//! Structural comparison of two snapshots.

use super::{reference_for, ChangeKind, SchemaChange, SchemaSnapshot, TableRef};
use crate::error::EngineError;
use crate::schema::ResourceSchema;
use std::collections::BTreeSet;

/// Every change needed to turn `old` into `new`, in an order that can be applied as-is:
///
/// 1. added resources (dependencies first), then their relationships;
/// 2. field, relationship and index changes on resources present in both;
/// 3. relationships of dropped resources, then the dropped resources (dependents first).
pub fn diff(old: &SchemaSnapshot, new: &SchemaSnapshot) -> Result<Vec<SchemaChange>, EngineError> {
    let added: BTreeSet<&str> = new
        .resources
        .keys()
        .filter(|n| !old.resources.contains_key(*n))
        .map(String::as_str)
        .collect();
    let dropped: BTreeSet<&str> = old
        .resources
        .keys()
        .filter(|n| !new.resources.contains_key(*n))
        .map(String::as_str)
        .collect();

    let mut changes = Vec::new();

    let new_order = new.topological_order()?;
    let added_in_order: Vec<&ResourceSchema> = new_order
        .iter()
        .filter(|n| added.contains(n.as_str()))
        .filter_map(|n| new.get(n))
        .collect();
    for schema in &added_in_order {
        let mut bare = (*schema).clone();
        bare.relationships.clear();
        changes.push(SchemaChange::new(
            &schema.name,
            TableRef::of(schema),
            ChangeKind::AddResource { schema: bare },
        ));
    }
    for schema in &added_in_order {
        for relationship in &schema.relationships {
            changes.push(SchemaChange::new(
                &schema.name,
                TableRef::of(schema),
                ChangeKind::AddRelationship {
                    relationship: relationship.clone(),
                    references: reference_for(new, relationship),
                },
            ));
        }
    }

    for (name, before) in &old.resources {
        if let Some(after) = new.resources.get(name) {
            diff_resource(old, new, before, after, &mut changes);
        }
    }

    let mut old_order = old.topological_order()?;
    old_order.reverse();
    let dropped_in_order: Vec<&ResourceSchema> = old_order
        .iter()
        .filter(|n| dropped.contains(n.as_str()))
        .filter_map(|n| old.get(n))
        .collect();
    for schema in &dropped_in_order {
        for relationship in &schema.relationships {
            changes.push(SchemaChange::new(
                &schema.name,
                TableRef::of(schema),
                ChangeKind::DropRelationship {
                    relationship: relationship.clone(),
                    references: reference_for(old, relationship),
                },
            ));
        }
    }
    for schema in &dropped_in_order {
        let mut bare = (*schema).clone();
        bare.relationships.clear();
        changes.push(SchemaChange::new(
            &schema.name,
            TableRef::of(schema),
            ChangeKind::DropResource { schema: bare },
        ));
    }

    Ok(changes)
}

fn diff_resource(
    old: &SchemaSnapshot,
    new: &SchemaSnapshot,
    before: &ResourceSchema,
    after: &ResourceSchema,
    changes: &mut Vec<SchemaChange>,
) {
    let table = TableRef::of(after);
    let mut push = |kind| changes.push(SchemaChange::new(&after.name, table.clone(), kind));

    // Indexes go first so a dropped column never takes a still-declared index with it.
    for index in &before.indexes {
        match after.index(&index.name) {
            Some(i) if i == index => {}
            _ => push(ChangeKind::DropIndex { index: index.clone() }),
        }
    }

    for field in &after.fields {
        match before.field(&field.name) {
            None => push(ChangeKind::AddField { field: field.clone() }),
            Some(prev) if prev != field => push(ChangeKind::ModifyField {
                from: prev.clone(),
                to: field.clone(),
            }),
            Some(_) => {}
        }
    }

    for relationship in &before.relationships {
        if after.relationship(&relationship.name).is_none() {
            push(ChangeKind::DropRelationship {
                relationship: relationship.clone(),
                references: reference_for(old, relationship),
            });
        }
    }
    for relationship in &after.relationships {
        match before.relationship(&relationship.name) {
            None => push(ChangeKind::AddRelationship {
                relationship: relationship.clone(),
                references: reference_for(new, relationship),
            }),
            Some(prev) if prev != relationship => push(ChangeKind::ModifyRelationship {
                from: prev.clone(),
                to: relationship.clone(),
                from_references: reference_for(old, prev),
                to_references: reference_for(new, relationship),
            }),
            Some(_) => {}
        }
    }

    // Dropped after relationships so foreign-key constraints on the column are gone first.
    for field in &before.fields {
        if after.field(&field.name).is_none() {
            push(ChangeKind::DropField { field: field.clone() });
        }
    }

    for index in &after.indexes {
        match before.index(&index.name) {
            Some(i) if i == index => {}
            _ => push(ChangeKind::AddIndex { index: index.clone() }),
        }
    }
}
