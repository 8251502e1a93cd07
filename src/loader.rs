//! Batched relationship loading: one query per relationship per level, never one per record.

use crate::db::{Connection, Database};
use crate::error::EngineError;
use crate::schema::{OrderDefinition, RelationshipKind, ResourceSchema, SchemaRegistry};
use crate::sql::{select_by_column_in, select_through_join, PARENT_KEY_ALIAS};
use crate::value::{Record, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Include paths folded into a tree: `["comments.author", "comments", "tags"]` becomes
/// `{comments: {author: {}}, tags: {}}`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IncludeTree(BTreeMap<String, IncludeTree>);

impl IncludeTree {
    pub fn parse<S: AsRef<str>>(paths: &[S]) -> Result<Self, EngineError> {
        let mut root = IncludeTree::default();
        for path in paths {
            let path = path.as_ref();
            let mut node = &mut root;
            for segment in path.split('.') {
                if segment.is_empty() {
                    return Err(EngineError::RelationshipResolution(format!(
                        "malformed include path '{}'",
                        path
                    )));
                }
                node = node.0.entry(segment.to_string()).or_default();
            }
        }
        Ok(root)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Longest path, in relationship hops.
    pub fn depth(&self) -> usize {
        self.0.values().map(|c| 1 + c.depth()).max().unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct RelationshipLoader {
    registry: Arc<SchemaRegistry>,
    max_depth: usize,
}

impl RelationshipLoader {
    pub fn new(registry: Arc<SchemaRegistry>, max_depth: usize) -> Self {
        Self { registry, max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Attach every included relationship to `records` in place. Collections become lists
    /// (empty when nothing matches), single relations a record or null.
    ///
    /// The whole include tree is resolved before any query runs, so unknown relationships and
    /// paths deeper than `max_depth` fail without touching the database.
    pub async fn eager_load<C, S>(
        &self,
        conn: &mut C,
        resource: &str,
        records: &mut [Record],
        includes: &[S],
    ) -> Result<(), EngineError>
    where
        C: Connection + ?Sized,
        S: AsRef<str>,
    {
        let tree = IncludeTree::parse(includes)?;
        if tree.is_empty() {
            return Ok(());
        }
        let schema = self.registry.resource(resource)?;
        let mut path = vec![schema.name.clone()];
        self.check(&schema, &tree, &mut path)?;
        if records.is_empty() {
            return Ok(());
        }
        self.load_level(conn, schema, records, &tree).await
    }

    /// Walks the tree against the schemas. `path` holds the resources on the active branch;
    /// revisiting one is fine, going deeper than `max_depth` hops is not.
    fn check(&self, schema: &ResourceSchema, tree: &IncludeTree, path: &mut Vec<String>) -> Result<(), EngineError> {
        for (name, children) in &tree.0 {
            let rel = schema.relationship(name).ok_or_else(|| {
                EngineError::RelationshipResolution(format!("{} has no relationship '{}'", schema.name, name))
            })?;
            path.push(rel.target.clone());
            if path.len() - 1 > self.max_depth {
                return Err(EngineError::DepthExceeded {
                    path: path.clone(),
                    max_depth: self.max_depth,
                });
            }
            let target = self.registry.resource(&rel.target)?;
            self.check(&target, children, path)?;
            path.pop();
        }
        Ok(())
    }

    fn load_level<'a, C>(
        &'a self,
        conn: &'a mut C,
        schema: Arc<ResourceSchema>,
        records: &'a mut [Record],
        tree: &'a IncludeTree,
    ) -> BoxFuture<'a, Result<(), EngineError>>
    where
        C: Connection + ?Sized,
    {
        async move {
            for (name, children) in &tree.0 {
                let rel = schema.relationship(name).ok_or_else(|| {
                    EngineError::RelationshipResolution(format!("{} has no relationship '{}'", schema.name, name))
                })?;
                let target = self.registry.resource(&rel.target)?;
                match &rel.kind {
                    RelationshipKind::OwningReference { foreign_key, .. } => {
                        let keys = distinct(records.iter().map(|r| r.get(foreign_key)));
                        let mut rows = self.fetch(conn, &target, &target.primary_key, &keys, None).await?;
                        self.load_nested(conn, &target, &mut rows, children).await?;
                        let by_key: HashMap<String, Record> = rows
                            .into_iter()
                            .filter_map(|r| Some((r.get(&target.primary_key)?.key()?, r)))
                            .collect();
                        for record in records.iter_mut() {
                            let found = record
                                .get(foreign_key)
                                .and_then(Value::key)
                                .and_then(|k| by_key.get(&k))
                                .cloned();
                            record.set(name.clone(), found.map(Value::Record).unwrap_or(Value::Null));
                        }
                    }
                    RelationshipKind::OwnedCollection { foreign_key, order } => {
                        let keys = distinct(records.iter().map(|r| r.get(&schema.primary_key)));
                        let mut rows = self.fetch(conn, &target, foreign_key, &keys, order.as_ref()).await?;
                        self.load_nested(conn, &target, &mut rows, children).await?;
                        attach_grouped(records, &schema.primary_key, name, group_by(rows, foreign_key, false), true);
                    }
                    RelationshipKind::OwnedSingle { foreign_key } => {
                        let keys = distinct(records.iter().map(|r| r.get(&schema.primary_key)));
                        let mut rows = self.fetch(conn, &target, foreign_key, &keys, None).await?;
                        self.load_nested(conn, &target, &mut rows, children).await?;
                        attach_grouped(records, &schema.primary_key, name, group_by(rows, foreign_key, false), false);
                    }
                    RelationshipKind::CollectionThroughJoin {
                        join_table,
                        foreign_key,
                        association_key,
                        order,
                    } => {
                        let keys = distinct(records.iter().map(|r| r.get(&schema.primary_key)));
                        let mut rows = if keys.is_empty() {
                            Vec::new()
                        } else {
                            let join = self.registry.resource(join_table)?;
                            let q = select_through_join(&target, &join, foreign_key, association_key, &keys, order.as_ref());
                            conn.fetch_all(&q).await?
                        };
                        self.load_nested(conn, &target, &mut rows, children).await?;
                        attach_grouped(records, &schema.primary_key, name, group_by(rows, PARENT_KEY_ALIAS, true), true);
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn fetch<C>(
        &self,
        conn: &mut C,
        target: &ResourceSchema,
        column: &str,
        keys: &[Value],
        order: Option<&OrderDefinition>,
    ) -> Result<Vec<Record>, EngineError>
    where
        C: Connection + ?Sized,
    {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        conn.fetch_all(&select_by_column_in(target, column, keys, order)).await
    }

    async fn load_nested<C>(
        &self,
        conn: &mut C,
        target: &Arc<ResourceSchema>,
        rows: &mut [Record],
        children: &IncludeTree,
    ) -> Result<(), EngineError>
    where
        C: Connection + ?Sized,
    {
        if children.is_empty() || rows.is_empty() {
            return Ok(());
        }
        self.load_level(conn, Arc::clone(target), rows, children).await
    }
}

/// Non-null scalar values, first occurrence order, deduplicated.
fn distinct<'a>(values: impl Iterator<Item = Option<&'a Value>>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .flatten()
        .filter(|v| v.key().map(|k| seen.insert(k)).unwrap_or(false))
        .cloned()
        .collect()
}

fn group_by(rows: Vec<Record>, column: &str, strip: bool) -> HashMap<String, Vec<Record>> {
    let mut groups: HashMap<String, Vec<Record>> = HashMap::new();
    for mut row in rows {
        let key = if strip {
            row.remove(column)
        } else {
            row.get(column).cloned()
        };
        if let Some(k) = key.as_ref().and_then(Value::key) {
            groups.entry(k).or_default().push(row);
        }
    }
    groups
}

fn attach_grouped(
    records: &mut [Record],
    key_field: &str,
    name: &str,
    groups: HashMap<String, Vec<Record>>,
    collection: bool,
) {
    for record in records.iter_mut() {
        let matched = record
            .get(key_field)
            .and_then(Value::key)
            .and_then(|k| groups.get(&k))
            .cloned()
            .unwrap_or_default();
        let value = if collection {
            Value::List(matched.into_iter().map(Value::Record).collect())
        } else {
            matched.into_iter().next().map(Value::Record).unwrap_or(Value::Null)
        };
        record.set(name, value);
    }
}

/// A record whose relationships load on first access and are cached afterwards. Each
/// relationship has its own cell, so concurrent readers of one relationship share a single
/// query while different relationships load independently.
pub struct LazyRecord<D: Database> {
    record: Record,
    schema: Arc<ResourceSchema>,
    loader: RelationshipLoader,
    db: Arc<D>,
    cells: HashMap<String, OnceCell<Value>>,
}

impl<D: Database> LazyRecord<D> {
    pub fn new(db: Arc<D>, loader: RelationshipLoader, schema: Arc<ResourceSchema>, record: Record) -> Self {
        let cells = schema
            .relationships
            .iter()
            .map(|r| (r.name.clone(), OnceCell::new()))
            .collect();
        Self {
            record,
            schema,
            loader,
            db,
            cells,
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn is_loaded(&self, relationship: &str) -> bool {
        self.cells.get(relationship).map(OnceCell::initialized).unwrap_or(false)
    }

    pub async fn related(&self, relationship: &str) -> Result<&Value, EngineError> {
        let cell = self.cells.get(relationship).ok_or_else(|| {
            EngineError::RelationshipResolution(format!(
                "{} has no relationship '{}'",
                self.schema.name, relationship
            ))
        })?;
        cell.get_or_try_init(|| async {
            let mut conn = self.db.acquire().await?;
            let mut rows = vec![self.record.clone()];
            self.loader
                .eager_load(&mut conn, &self.schema.name, &mut rows, &[relationship])
                .await?;
            Ok::<_, EngineError>(rows.pop().and_then(|mut r| r.remove(relationship)).unwrap_or(Value::Null))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Query;
    use crate::testing::{blog_registry, MemoryDatabase};
    use pretty_assertions::assert_eq;

    fn seeded() -> (Arc<SchemaRegistry>, MemoryDatabase) {
        let db = MemoryDatabase::new();
        db.seed(
            "users",
            (1..=3).map(|i| Record::new().with("id", i).with("name", format!("user{}", i))).collect(),
        );
        db.seed(
            "posts",
            (1..=50)
                .map(|i: i64| {
                    Record::new()
                        .with("id", i)
                        .with("title", format!("post {}", i))
                        .with("author_id", i % 3 + 1)
                })
                .collect(),
        );
        db.seed(
            "comments",
            vec![
                Record::new().with("id", 1).with("post_id", 1).with("author_id", 2).with("body", "a"),
                Record::new().with("id", 2).with("post_id", 1).with("author_id", 3).with("body", "b"),
                Record::new().with("id", 3).with("post_id", 7).with("body", "c"),
            ],
        );
        db.seed("tags", vec![Record::new().with("id", 1).with("label", "rust"), Record::new().with("id", 2).with("label", "db")]);
        db.seed(
            "post_tags",
            vec![
                Record::new().with("post_id", 1).with("tag_id", 1),
                Record::new().with("post_id", 1).with("tag_id", 2),
                Record::new().with("post_id", 2).with("tag_id", 1),
            ],
        );
        (Arc::new(blog_registry()), db)
    }

    #[test]
    fn include_paths_fold_into_a_tree() {
        let tree = IncludeTree::parse(&["comments.author", "comments", "tags"]).unwrap();
        assert_eq!(tree.depth(), 2);
        assert!(IncludeTree::parse(&["comments..author"]).is_err());
    }

    #[tokio::test]
    async fn fifty_posts_with_author_and_comments_take_three_queries() {
        let (registry, db) = seeded();
        let loader = RelationshipLoader::new(Arc::clone(&registry), 5);
        let mut conn = db.acquire().await.unwrap();
        let q = Query::new("posts").compile(&registry, 1000).unwrap();
        let mut posts = conn.fetch_all(&q).await.unwrap();
        assert_eq!(posts.len(), 50);

        loader
            .eager_load(&mut conn, "posts", &mut posts, &["author", "comments"])
            .await
            .unwrap();
        assert_eq!(db.statements().len(), 3);

        let first = &posts[0];
        assert_eq!(
            first.get("author").and_then(Value::as_record).and_then(|a| a.get("name")),
            Some(&Value::from("user2"))
        );
        assert_eq!(first.get("comments").and_then(Value::as_list).map(|c| c.len()), Some(2));
        let lonely = &posts[2];
        assert_eq!(lonely.get("comments"), Some(&Value::List(Vec::new())));

        // three distinct authors behind fifty posts, one IN list
        let authors_sql = &db.statements()[1];
        assert_eq!(authors_sql.matches("::int8").count(), 3);
    }

    #[tokio::test]
    async fn nested_and_join_includes_load_per_level() {
        let (registry, db) = seeded();
        let loader = RelationshipLoader::new(Arc::clone(&registry), 5);
        let mut conn = db.acquire().await.unwrap();
        let mut posts = vec![
            Record::new().with("id", 1).with("author_id", 2),
            Record::new().with("id", 2).with("author_id", 3),
        ];
        loader
            .eager_load(&mut conn, "posts", &mut posts, &["comments.author", "tags"])
            .await
            .unwrap();
        assert_eq!(db.statements().len(), 3, "comments, their authors, tags");

        let comments = posts[0].get("comments").and_then(Value::as_list).unwrap();
        let names: Vec<&Value> = comments
            .iter()
            .filter_map(|c| c.as_record()?.get("author")?.as_record()?.get("name"))
            .collect();
        assert_eq!(names, vec![&Value::from("user2"), &Value::from("user3")]);

        let tags: Vec<&Value> = posts[0]
            .get("tags")
            .and_then(Value::as_list)
            .unwrap()
            .iter()
            .filter_map(|t| t.as_record()?.get("label"))
            .collect();
        assert_eq!(tags, vec![&Value::from("db"), &Value::from("rust")]);
        let tag = posts[1].get("tags").and_then(Value::as_list).unwrap()[0].as_record().unwrap();
        assert!(!tag.contains(PARENT_KEY_ALIAS));
    }

    #[tokio::test]
    async fn depth_limit_fails_before_querying() {
        let (registry, db) = seeded();
        let loader = RelationshipLoader::new(Arc::clone(&registry), 2);
        let mut conn = db.acquire().await.unwrap();
        let mut posts = vec![Record::new().with("id", 1).with("author_id", 2)];
        let err = loader
            .eager_load(&mut conn, "posts", &mut posts, &["comments.post.author"])
            .await
            .unwrap_err();
        match err {
            EngineError::DepthExceeded { path, max_depth } => {
                assert_eq!(path, vec!["posts", "comments", "posts", "users"]);
                assert_eq!(max_depth, 2);
            }
            other => panic!("expected depth error, got {other:?}"),
        }
        assert!(db.statements().is_empty());

        // revisiting a resource within the limit is fine
        loader
            .eager_load(&mut conn, "posts", &mut posts, &["comments.post"])
            .await
            .unwrap();

        let err = loader
            .eager_load(&mut conn, "posts", &mut posts, &["editor"])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RelationshipResolution(_)));
    }

    #[tokio::test]
    async fn lazy_relationships_load_once() {
        let (registry, db) = seeded();
        let db = Arc::new(db);
        let loader = RelationshipLoader::new(Arc::clone(&registry), 5);
        let schema = registry.get("posts").unwrap();
        let post = LazyRecord::new(
            Arc::clone(&db),
            loader,
            schema,
            Record::new().with("id", 1).with("author_id", 3),
        );
        assert!(!post.is_loaded("author"));
        let (a, b) = tokio::join!(post.related("author"), post.related("author"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(post.is_loaded("author"));
        assert_eq!(db.statements().len(), 1);
        assert!(post.related("nope").await.is_err());
    }
}
