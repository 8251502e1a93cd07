//! Builds parameterized INSERT, UPDATE, DELETE and batch SELECTs from a resolved schema.

use crate::schema::{OrderDefinition, ResourceSchema};
use crate::sql::query::{select_column_list, MAIN_ALIAS};
use crate::sql::{qualified_table, quoted, QueryBuf};
use crate::value::{Record, Value};

/// Column carrying the parent key in join-table selects; stripped before records are attached.
pub const PARENT_KEY_ALIAS: &str = "_parent_key";

fn table_of(schema: &ResourceSchema) -> String {
    qualified_table(&schema.pg_schema, &schema.table)
}

fn pk_placeholder(schema: &ResourceSchema, id: &Value, q: &mut QueryBuf) -> String {
    let cast = schema.primary_key_field().map(|f| f.cast()).unwrap_or("text");
    q.placeholder(id.clone(), cast)
}

/// INSERT the fields present in `record`. Absent fields are omitted so the DB applies defaults.
pub fn insert(schema: &ResourceSchema, record: &Record) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for f in &schema.fields {
        let Some(v) = record.get(&f.name) else { continue };
        placeholders.push(q.placeholder(v.clone(), f.cast()));
        cols.push(quoted(&f.name));
    }
    let returning = select_column_list(schema, None);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table_of(schema), returning)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table_of(schema),
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    q
}

/// UPDATE by id, SET only the given fields. None when there is nothing to write.
pub fn update(schema: &ResourceSchema, id: &Value, changes: &Record) -> Option<QueryBuf> {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for f in &schema.fields {
        if f.name == schema.primary_key {
            continue;
        }
        let Some(v) = changes.get(&f.name) else { continue };
        let ph = q.placeholder(v.clone(), f.cast());
        sets.push(format!("{} = {}", quoted(&f.name), ph));
    }
    if sets.is_empty() {
        return None;
    }
    let id_ph = pk_placeholder(schema, id, &mut q);
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
        table_of(schema),
        sets.join(", "),
        quoted(&schema.primary_key),
        id_ph,
        select_column_list(schema, None)
    );
    Some(q)
}

/// DELETE by id.
pub fn delete(schema: &ResourceSchema, id: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let id_ph = pk_placeholder(schema, id, &mut q);
    q.sql = format!(
        "DELETE FROM {} WHERE {} = {} RETURNING {}",
        table_of(schema),
        quoted(&schema.primary_key),
        id_ph,
        select_column_list(schema, None)
    );
    q
}

fn order_clause(schema: &ResourceSchema, order: Option<&OrderDefinition>) -> String {
    let pk = format!("{}.{}", MAIN_ALIAS, quoted(&schema.primary_key));
    match order {
        Some(o) if o.field != schema.primary_key => format!(
            " ORDER BY {}.{} {}, {}",
            MAIN_ALIAS,
            quoted(&o.field),
            o.direction.sql(),
            pk
        ),
        Some(o) => format!(" ORDER BY {} {}", pk, o.direction.sql()),
        None => format!(" ORDER BY {}", pk),
    }
}

/// SELECT rows whose `column` is one of `values`. One statement for a whole batch of keys.
pub fn select_by_column_in(
    schema: &ResourceSchema,
    column: &str,
    values: &[Value],
    order: Option<&OrderDefinition>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cols = select_column_list(schema, Some(MAIN_ALIAS));
    if values.is_empty() {
        q.sql = format!("SELECT {} FROM {} {} WHERE 1 = 0", cols, table_of(schema), MAIN_ALIAS);
        return q;
    }
    let cast = schema.field(column).map(|f| f.cast()).unwrap_or("text");
    let placeholders: Vec<String> = values.iter().map(|v| q.placeholder(v.clone(), cast)).collect();
    q.sql = format!(
        "SELECT {} FROM {} {} WHERE {}.{} IN ({}){}",
        cols,
        table_of(schema),
        MAIN_ALIAS,
        MAIN_ALIAS,
        quoted(column),
        placeholders.join(", "),
        order_clause(schema, order)
    );
    q
}

/// SELECT target rows linked to any of `parent_ids` through a join resource. Each row carries
/// the parent key as [`PARENT_KEY_ALIAS`].
pub fn select_through_join(
    target: &ResourceSchema,
    join: &ResourceSchema,
    foreign_key: &str,
    association_key: &str,
    parent_ids: &[Value],
    order: Option<&OrderDefinition>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cast = join.field(foreign_key).map(|f| f.cast()).unwrap_or("text");
    let placeholders: Vec<String> = parent_ids.iter().map(|v| q.placeholder(v.clone(), cast)).collect();
    let filter = if placeholders.is_empty() {
        "1 = 0".to_string()
    } else {
        format!("\"jt\".{} IN ({})", quoted(foreign_key), placeholders.join(", "))
    };
    q.sql = format!(
        "SELECT {}, \"jt\".{} AS {} FROM {} {} JOIN {} \"jt\" ON \"jt\".{} = {}.{} WHERE {}{}",
        select_column_list(target, Some(MAIN_ALIAS)),
        quoted(foreign_key),
        quoted(PARENT_KEY_ALIAS),
        table_of(target),
        MAIN_ALIAS,
        table_of(join),
        quoted(association_key),
        MAIN_ALIAS,
        quoted(&target.primary_key),
        filter,
        order_clause(target, order)
    );
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::blog_registry;
    use pretty_assertions::assert_eq;

    #[test]
    fn insert_binds_present_fields_only() {
        let registry = blog_registry();
        let posts = registry.get("posts").unwrap();
        let record = Record::new().with("title", "Hi").with("author_id", 4);
        let q = insert(&posts, &record);
        assert_eq!(
            q.sql,
            "INSERT INTO \"public\".\"posts\" (\"title\", \"author_id\") VALUES ($1::text, $2::int8) RETURNING \"id\", \"title\", \"body\", \"published_at\", \"author_id\""
        );
        assert_eq!(q.params, vec![Value::from("Hi"), Value::Int(4)]);
    }

    #[test]
    fn update_sets_only_changes_and_skips_when_empty() {
        let registry = blog_registry();
        let posts = registry.get("posts").unwrap();
        let q = update(&posts, &Value::Int(9), &Record::new().with("title", "New").with("id", 10)).unwrap();
        assert_eq!(
            q.sql,
            "UPDATE \"public\".\"posts\" SET \"title\" = $1::text WHERE \"id\" = $2::int8 RETURNING \"id\", \"title\", \"body\", \"published_at\", \"author_id\""
        );
        assert_eq!(q.params, vec![Value::from("New"), Value::Int(9)]);
        assert!(update(&posts, &Value::Int(9), &Record::new()).is_none());
    }

    #[test]
    fn batch_selects_use_one_in_list() {
        let registry = blog_registry();
        let comments = registry.get("comments").unwrap();
        let q = select_by_column_in(&comments, "post_id", &[Value::Int(1), Value::Int(2)], None);
        assert!(q.sql.ends_with("WHERE main.\"post_id\" IN ($1::int8, $2::int8) ORDER BY main.\"id\""));

        let q = select_by_column_in(&comments, "post_id", &[], None);
        assert!(q.sql.ends_with("WHERE 1 = 0"));
        assert!(q.params.is_empty());
    }

    #[test]
    fn join_select_carries_parent_key() {
        let registry = blog_registry();
        let tags = registry.get("tags").unwrap();
        let post_tags = registry.get("post_tags").unwrap();
        let q = select_through_join(&tags, &post_tags, "post_id", "tag_id", &[Value::Int(1)], None);
        assert_eq!(
            q.sql,
            "SELECT main.\"id\", main.\"label\", \"jt\".\"post_id\" AS \"_parent_key\" FROM \"public\".\"tags\" main JOIN \"public\".\"post_tags\" \"jt\" ON \"jt\".\"tag_id\" = main.\"id\" WHERE \"jt\".\"post_id\" IN ($1::int8) ORDER BY main.\"id\""
        );
    }
}
