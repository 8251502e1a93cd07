//! PostgreSQL DDL for schema changes. Identifiers come from validated schemas and are always
//! quoted; defaults are rendered from a closed set of literal and generator forms.

use super::{ChangeKind, Reference, SchemaChange, TableRef};
use crate::schema::{DefaultValue, Field, Generator, Index, Relationship, RelationshipKind, ResourceSchema};
use crate::sql::{qualified_table, quoted};

pub(super) fn statements(change: &SchemaChange) -> Vec<String> {
    let table = change.table();
    match change.kind() {
        ChangeKind::AddResource { schema } => create_table(schema),
        ChangeKind::DropResource { .. } => vec![format!("DROP TABLE IF EXISTS {}", table.qualified())],
        ChangeKind::AddField { field } => add_column(table, field),
        ChangeKind::DropField { field } => vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            table.qualified(),
            quoted(&field.name)
        )],
        ChangeKind::ModifyField { from, to } => alter_column(table, from, to),
        ChangeKind::AddRelationship {
            relationship,
            references,
        } => add_foreign_key(table, relationship, references.as_ref()).into_iter().collect(),
        ChangeKind::DropRelationship {
            relationship,
            references,
        } => drop_foreign_key(table, relationship, references.as_ref()).into_iter().collect(),
        ChangeKind::ModifyRelationship {
            from,
            to,
            from_references,
            to_references,
        } => {
            let mut out: Vec<String> = drop_foreign_key(table, from, from_references.as_ref()).into_iter().collect();
            out.extend(add_foreign_key(table, to, to_references.as_ref()));
            out
        }
        ChangeKind::AddIndex { index } => vec![create_index(table, index)],
        ChangeKind::DropIndex { index } => vec![format!(
            "DROP INDEX IF EXISTS {}",
            qualified_table(&table.schema, &index.name)
        )],
    }
}

fn column_def(field: &Field) -> String {
    let mut def = format!("{} {}", quoted(&field.name), field.pg_type());
    if field.is_required() {
        def.push_str(" NOT NULL");
    }
    match &field.constraints.default {
        Some(DefaultValue::Generated(Generator::Increment)) => {
            def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
        }
        Some(d) => {
            def.push_str(" DEFAULT ");
            def.push_str(&default_sql(d));
        }
        None => {}
    }
    def
}

fn default_sql(d: &DefaultValue) -> String {
    match d {
        DefaultValue::Generated(Generator::Uuid) => "gen_random_uuid()".into(),
        DefaultValue::Generated(Generator::Now) => "NOW()".into(),
        // Identity columns have no DEFAULT expression.
        DefaultValue::Generated(Generator::Increment) => String::new(),
        DefaultValue::Literal(v) => literal_sql(v),
    }
}

fn literal_sql(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "NULL".into(),
        serde_json::Value::Bool(true) => "TRUE".into(),
        serde_json::Value::Bool(false) => "FALSE".into(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => string_literal(s),
        other => format!("{}::jsonb", string_literal(&other.to_string())),
    }
}

fn string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn unique_constraint(table: &str, column: &str) -> String {
    quoted(&format!("{}_{}_key", table, column))
}

fn create_table(schema: &ResourceSchema) -> Vec<String> {
    let table = TableRef::of(schema);
    let mut defs: Vec<String> = schema.fields.iter().map(column_def).collect();
    defs.push(format!("PRIMARY KEY ({})", quoted(&schema.primary_key)));
    for f in schema.fields.iter().filter(|f| f.is_unique() && f.name != schema.primary_key) {
        defs.push(format!(
            "CONSTRAINT {} UNIQUE ({})",
            unique_constraint(&schema.table, &f.name),
            quoted(&f.name)
        ));
    }
    let mut out = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        table.qualified(),
        defs.join(",\n  ")
    )];
    out.extend(schema.indexes.iter().map(|i| create_index(&table, i)));
    out
}

fn add_column(table: &TableRef, field: &Field) -> Vec<String> {
    let mut out = vec![format!("ALTER TABLE {} ADD COLUMN {}", table.qualified(), column_def(field))];
    if field.is_unique() {
        out.push(add_unique(table, &field.name));
    }
    out
}

fn add_unique(table: &TableRef, column: &str) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
        table.qualified(),
        unique_constraint(&table.table, column),
        quoted(column)
    )
}

fn alter_column(table: &TableRef, from: &Field, to: &Field) -> Vec<String> {
    let t = table.qualified();
    let col = quoted(&to.name);
    let mut out = Vec::new();

    let (old_type, new_type) = (from.pg_type(), to.pg_type());
    if old_type != new_type {
        out.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
            t, col, new_type, col, new_type
        ));
    }

    if from.constraints.default != to.constraints.default {
        match &from.constraints.default {
            Some(DefaultValue::Generated(Generator::Increment)) => {
                out.push(format!("ALTER TABLE {} ALTER COLUMN {} DROP IDENTITY IF EXISTS", t, col));
            }
            Some(_) => out.push(format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", t, col)),
            None => {}
        }
        match &to.constraints.default {
            Some(DefaultValue::Generated(Generator::Increment)) => out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} ADD GENERATED BY DEFAULT AS IDENTITY",
                t, col
            )),
            Some(d) => out.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                t,
                col,
                default_sql(d)
            )),
            None => {}
        }
    }

    if from.optional != to.optional {
        let action = if to.optional { "DROP NOT NULL" } else { "SET NOT NULL" };
        out.push(format!("ALTER TABLE {} ALTER COLUMN {} {}", t, col, action));
    }

    match (from.is_unique(), to.is_unique()) {
        (false, true) => out.push(add_unique(table, &to.name)),
        (true, false) => out.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            t,
            unique_constraint(&table.table, &to.name)
        )),
        _ => {}
    }
    out
}

fn foreign_key_name(table: &TableRef, relationship: &Relationship) -> String {
    quoted(&format!("fk_{}_{}", table.table, relationship.name))
}

/// Only owning references have a constraint; owned and join relationships live on other tables.
fn add_foreign_key(table: &TableRef, relationship: &Relationship, references: Option<&Reference>) -> Option<String> {
    let RelationshipKind::OwningReference {
        foreign_key,
        on_delete,
        on_update,
        ..
    } = &relationship.kind
    else {
        return None;
    };
    let target = references?;
    Some(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
        table.qualified(),
        foreign_key_name(table, relationship),
        quoted(foreign_key),
        target.table.qualified(),
        quoted(&target.column),
        on_update.sql(),
        on_delete.sql()
    ))
}

fn drop_foreign_key(table: &TableRef, relationship: &Relationship, references: Option<&Reference>) -> Option<String> {
    match relationship.kind {
        RelationshipKind::OwningReference { .. } if references.is_some() => Some(format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            table.qualified(),
            foreign_key_name(table, relationship)
        )),
        _ => None,
    }
}

fn create_index(table: &TableRef, index: &Index) -> String {
    let cols: Vec<String> = index.fields.iter().map(|f| quoted(f)).collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quoted(&index.name),
        table.qualified(),
        cols.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::diff;
    use crate::migration::{Migration, SchemaSnapshot};
    use crate::schema::CascadePolicy;
    use crate::testing::blog_registry;
    use pretty_assertions::assert_eq;

    #[test]
    fn create_table_renders_columns_defaults_and_constraints() {
        let users = blog_registry().get("users").unwrap();
        let sql = create_table(&users);
        assert_eq!(
            sql,
            vec![
                "CREATE TABLE IF NOT EXISTS \"public\".\"users\" (\n  \
                 \"id\" BIGINT NOT NULL GENERATED BY DEFAULT AS IDENTITY,\n  \
                 \"name\" VARCHAR(80) NOT NULL,\n  \
                 \"email\" TEXT,\n  \
                 PRIMARY KEY (\"id\"),\n  \
                 CONSTRAINT \"users_email_key\" UNIQUE (\"email\")\n)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn owning_references_become_named_foreign_keys() {
        let full = blog_registry().snapshot();
        let changes = diff(&SchemaSnapshot::new(), &full).unwrap();
        let fk: Vec<String> = changes
            .iter()
            .filter(|c| c.resource() == "comments")
            .flat_map(statements)
            .filter(|s| s.contains("FOREIGN KEY"))
            .collect();
        assert_eq!(
            fk,
            vec![
                "ALTER TABLE \"public\".\"comments\" ADD CONSTRAINT \"fk_comments_post\" FOREIGN KEY (\"post_id\") REFERENCES \"public\".\"posts\" (\"id\") ON UPDATE NO ACTION ON DELETE CASCADE",
                "ALTER TABLE \"public\".\"comments\" ADD CONSTRAINT \"fk_comments_author\" FOREIGN KEY (\"author_id\") REFERENCES \"public\".\"users\" (\"id\") ON UPDATE NO ACTION ON DELETE SET NULL",
            ]
        );
        // has_many and many_to_many emit nothing on the declaring table
        let posts_fk = changes
            .iter()
            .filter(|c| c.resource() == "posts")
            .flat_map(statements)
            .filter(|s| s.contains("FOREIGN KEY"))
            .count();
        assert_eq!(posts_fk, 1);
    }

    #[test]
    fn retargeted_reference_restores_the_original_target_on_reverse() {
        let old = blog_registry().snapshot();
        let mut new = old.clone();
        let author = new
            .resources
            .get_mut("comments")
            .unwrap()
            .relationships
            .iter_mut()
            .find(|r| r.name == "author")
            .unwrap();
        author.target = "tags".into();
        if let RelationshipKind::OwningReference { on_delete, .. } = &mut author.kind {
            *on_delete = CascadePolicy::Cascade;
        }

        let migration = Migration::between(2, "retarget_comment_author", &old, &new).unwrap();
        assert_eq!(migration.changes().len(), 1);
        assert_eq!(
            migration.up(),
            [
                "ALTER TABLE \"public\".\"comments\" DROP CONSTRAINT IF EXISTS \"fk_comments_author\"",
                "ALTER TABLE \"public\".\"comments\" ADD CONSTRAINT \"fk_comments_author\" FOREIGN KEY (\"author_id\") REFERENCES \"public\".\"tags\" (\"id\") ON UPDATE NO ACTION ON DELETE CASCADE",
            ]
        );
        assert_eq!(
            migration.down(),
            [
                "ALTER TABLE \"public\".\"comments\" DROP CONSTRAINT IF EXISTS \"fk_comments_author\"",
                "ALTER TABLE \"public\".\"comments\" ADD CONSTRAINT \"fk_comments_author\" FOREIGN KEY (\"author_id\") REFERENCES \"public\".\"users\" (\"id\") ON UPDATE NO ACTION ON DELETE SET NULL",
            ]
        );

        let forward = old.apply(migration.changes()).unwrap();
        assert!(forward.equivalent(&new));
        let inverse: Vec<SchemaChange> = migration.changes().iter().rev().map(SchemaChange::inverse).collect();
        assert!(forward.apply(&inverse).unwrap().equivalent(&old));
    }

    #[test]
    fn modify_column_emits_type_nullability_and_default_steps() {
        let posts = blog_registry().get("posts").unwrap();
        let table = TableRef::of(&posts);
        let from = posts.field("title").unwrap().clone();
        let mut to = from.clone();
        to.constraints.max_length = Some(100);
        to.optional = true;
        to.constraints.default = Some(DefaultValue::Literal("it's".into()));
        assert_eq!(
            alter_column(&table, &from, &to),
            vec![
                "ALTER TABLE \"public\".\"posts\" ALTER COLUMN \"title\" TYPE VARCHAR(100) USING \"title\"::VARCHAR(100)",
                "ALTER TABLE \"public\".\"posts\" ALTER COLUMN \"title\" SET DEFAULT 'it''s'",
                "ALTER TABLE \"public\".\"posts\" ALTER COLUMN \"title\" DROP NOT NULL",
            ]
        );
    }
}
