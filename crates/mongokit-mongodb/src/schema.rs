//! Schema decoration helpers
//!
//! A [`SchemaDescriptor`] collects the indexes, virtual getters and query
//! pre-hooks of a model. The helpers never mutate their input: each one
//! returns a new descriptor with the requested decoration added, so a shared
//! base schema can be specialised per model.

use bson::{doc, Bson, Document as BsonDocument};
use mongodb::options::IndexOptions;
use mongodb::{Collection, IndexModel};
use mongokit_common::{MongoKitError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::identity::ID_FIELD;

/// Query operations that pre-hooks are attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    Find,
    FindOne,
    Update,
    FindOneAndUpdate,
    Count,
}

impl QueryMethod {
    /// Every method `hook_all_methods` attaches to
    pub const ALL: [QueryMethod; 5] = [
        QueryMethod::Find,
        QueryMethod::FindOne,
        QueryMethod::Update,
        QueryMethod::FindOneAndUpdate,
        QueryMethod::Count,
    ];
}

impl fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryMethod::Find => write!(f, "find"),
            QueryMethod::FindOne => write!(f, "findOne"),
            QueryMethod::Update => write!(f, "update"),
            QueryMethod::FindOneAndUpdate => write!(f, "findOneAndUpdate"),
            QueryMethod::Count => write!(f, "count"),
        }
    }
}

/// A pre-hook receives the query filter and may rewrite it or reject the query
pub type QueryHook = Arc<dyn Fn(&mut BsonDocument) -> Result<()> + Send + Sync>;

/// Index keys in driver format, e.g. `{ "email": 1, "created_at": -1 }`
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub keys: BsonDocument,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(keys: BsonDocument) -> Self {
        Self { keys, unique: false }
    }

    pub fn unique(keys: BsonDocument) -> Self {
        Self { keys, unique: true }
    }

    fn to_model(&self) -> IndexModel {
        let options = if self.unique {
            Some(IndexOptions::builder().unique(true).build())
        } else {
            None
        };
        IndexModel::builder()
            .keys(self.keys.clone())
            .options(options)
            .build()
    }
}

/// Immutable description of a model's indexes, virtuals and hooks
#[derive(Clone, Default)]
pub struct SchemaDescriptor {
    indexes: Vec<IndexSpec>,
    virtuals: BTreeMap<String, String>,
    hooks: Vec<(QueryMethod, QueryHook)>,
    unique_validator: bool,
}

impl fmt::Debug for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDescriptor")
            .field("indexes", &self.indexes)
            .field("virtuals", &self.virtuals)
            .field("hooks", &self.hooks.len())
            .field("unique_validator", &self.unique_validator)
            .finish()
    }
}

impl SchemaDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Virtual name to dotted source path
    pub fn virtuals(&self) -> &BTreeMap<String, String> {
        &self.virtuals
    }

    /// Whether `check_unique` enforces the unique indexes before writes
    pub fn validates_uniqueness(&self) -> bool {
        self.unique_validator
    }

    /// Index models ready for `create_indexes`
    pub fn index_models(&self) -> Vec<IndexModel> {
        self.indexes.iter().map(IndexSpec::to_model).collect()
    }

    pub fn hook_count(&self, method: QueryMethod) -> usize {
        self.hooks.iter().filter(|(m, _)| *m == method).count()
    }

    /// Value of virtual `name` computed from `doc`
    pub fn virtual_value<'a>(&self, doc: &'a BsonDocument, name: &str) -> Option<&'a Bson> {
        let path = self.virtuals.get(name)?;
        get_path(doc, path)
    }

    /// Copy of `doc` with every resolvable virtual added as a field
    pub fn with_virtuals(&self, doc: &BsonDocument) -> BsonDocument {
        let mut out = doc.clone();
        for (name, path) in &self.virtuals {
            if let Some(value) = get_path(doc, path) {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }

    /// Run the pre-hooks registered for `method`, in registration order
    pub fn run_pre_hooks(&self, method: QueryMethod, filter: &mut BsonDocument) -> Result<()> {
        for (_, hook) in self.hooks.iter().filter(|(m, _)| *m == method) {
            hook(filter)?;
        }
        Ok(())
    }

    /// Create the schema's indexes on `collection`
    pub async fn ensure_indexes(&self, collection: &Collection<BsonDocument>) -> Result<()> {
        if self.indexes.is_empty() {
            return Ok(());
        }
        collection.create_indexes(self.index_models()).await?;
        debug!(
            collection = collection.name(),
            count = self.indexes.len(),
            "indexes ensured"
        );
        Ok(())
    }

    /// Reject `doc` if another document already holds its value for any unique index
    pub async fn check_unique(
        &self,
        collection: &Collection<BsonDocument>,
        doc: &BsonDocument,
    ) -> Result<()> {
        if !self.unique_validator {
            return Ok(());
        }
        for index in self.indexes.iter().filter(|i| i.unique) {
            let Some(filter) = unique_filter(&index.keys, doc) else {
                continue;
            };
            let existing = collection.count_documents(filter).await?;
            if existing > 0 {
                return Err(duplicate_error(&index.keys, doc));
            }
        }
        Ok(())
    }
}

/// Filter matching other documents with the same unique key values,
/// or `None` if `doc` lacks one of the indexed fields
fn unique_filter(keys: &BsonDocument, doc: &BsonDocument) -> Option<BsonDocument> {
    let mut filter = BsonDocument::new();
    for path in keys.keys() {
        filter.insert(path.clone(), get_path(doc, path)?.clone());
    }
    if let Some(id) = doc.get(ID_FIELD) {
        filter.insert(ID_FIELD, doc! { "$ne": id.clone() });
    }
    Some(filter)
}

fn duplicate_error(keys: &BsonDocument, doc: &BsonDocument) -> MongoKitError {
    let path = keys.keys().cloned().collect::<Vec<_>>().join(", ");
    let value = keys
        .keys()
        .filter_map(|p| get_path(doc, p))
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    MongoKitError::Validation(format!(
        "Error, expected `{}` to be unique. Value: `{}`",
        path, value
    ))
}

/// Resolve a dotted path (`raw.user.id`) inside `doc`
pub fn get_path<'a>(doc: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Add plain indexes
pub fn add_indexes<I>(schema: &SchemaDescriptor, indexes: I) -> SchemaDescriptor
where
    I: IntoIterator<Item = BsonDocument>,
{
    let mut next = schema.clone();
    next.indexes.extend(indexes.into_iter().map(IndexSpec::new));
    next
}

/// Add unique indexes and enable the uniqueness check
pub fn add_unique_indexes<I>(schema: &SchemaDescriptor, indexes: I) -> SchemaDescriptor
where
    I: IntoIterator<Item = BsonDocument>,
{
    let mut next = schema.clone();
    next.indexes.extend(indexes.into_iter().map(IndexSpec::unique));
    next.unique_validator = true;
    next
}

/// Add read-only virtuals, each mapping a name to a dotted path in the stored document
pub fn add_virtual_getters<I, K, V>(schema: &SchemaDescriptor, virtuals: I) -> SchemaDescriptor
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut next = schema.clone();
    next.virtuals
        .extend(virtuals.into_iter().map(|(k, v)| (k.into(), v.into())));
    next
}

/// Register `hook` as a pre-hook of every query method
pub fn hook_all_methods(schema: &SchemaDescriptor, hook: QueryHook) -> SchemaDescriptor {
    let mut next = schema.clone();
    for method in QueryMethod::ALL {
        next.hooks.push((method, Arc::clone(&hook)));
    }
    next
}

/// `hook_all_methods` for each hook, in order
pub fn apply_all_hooks<I>(schema: &SchemaDescriptor, hooks: I) -> SchemaDescriptor
where
    I: IntoIterator<Item = QueryHook>,
{
    hooks
        .into_iter()
        .fold(schema.clone(), |acc, hook| hook_all_methods(&acc, hook))
}

/// A named schema registered with a [`ModelRegistry`]
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    schema: SchemaDescriptor,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }
}

/// Models by name; registering an existing name returns the existing model
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<Model>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a registered model
    pub fn model(&self, name: &str) -> Result<Arc<Model>> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MongoKitError::Validation(format!("no such model as {}", name)))
    }

    /// Return the model called `name`, registering it with `schema` if it does not exist yet.
    ///
    /// `schema` is only consulted for new models.
    pub fn upsert_model(&self, name: &str, schema: Option<SchemaDescriptor>) -> Result<Arc<Model>> {
        if name.is_empty() {
            return Err(MongoKitError::Validation("Model name not given".to_string()));
        }
        let mut models = self.models.write();
        if let Some(existing) = models.get(name) {
            return Ok(Arc::clone(existing));
        }
        let schema = schema.ok_or_else(|| {
            MongoKitError::Validation(format!("Model schema not given for {}", name))
        })?;
        let model = Arc::new(Model {
            name: name.to_string(),
            schema,
        });
        models.insert(name.to_string(), Arc::clone(&model));
        debug!(model = name, "model registered");
        Ok(model)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }
}
