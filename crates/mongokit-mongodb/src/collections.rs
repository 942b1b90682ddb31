//! Enumeration of user collections and the bulk mutations a reset needs

use async_trait::async_trait;
use bson::{doc, Document as BsonDocument};
use mongodb::options::{Acknowledgment, WriteConcern};
use mongodb::Collection;
use mongokit_common::Result;
use tracing::debug;

use crate::connection::Connection;

/// Collections whose names start with this prefix belong to the server
pub const SYSTEM_COLLECTION_PREFIX: &str = "system.";

/// A named collection and the driver handle used to mutate it
#[derive(Debug, Clone)]
pub struct ResourceDescriptor<H> {
    pub name: String,
    pub handle: H,
}

impl<H> ResourceDescriptor<H> {
    pub fn new(name: impl Into<String>, handle: H) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }
}

/// A database whose collections can be emptied and stripped of indexes
#[async_trait]
pub trait ResettableStore: Send + Sync {
    type Handle: Send + Sync;

    /// Every collection currently known to the server, system collections included
    async fn resources(&self) -> Result<Vec<ResourceDescriptor<Self::Handle>>>;

    /// Delete every document, returning how many were removed
    async fn delete_all_documents(&self, handle: &Self::Handle) -> Result<u64>;

    /// Drop every index except the mandatory `_id` index
    async fn drop_all_indexes(&self, handle: &Self::Handle) -> Result<()>;
}

pub fn is_system_collection(name: &str) -> bool {
    name.starts_with(SYSTEM_COLLECTION_PREFIX)
}

/// User collections of `store`, read live on every call, in store order
pub async fn list_resettable_resources<S>(store: &S) -> Result<Vec<ResourceDescriptor<S::Handle>>>
where
    S: ResettableStore + ?Sized,
{
    let resources = store.resources().await?;
    let total = resources.len();
    let resettable: Vec<_> = resources
        .into_iter()
        .filter(|r| !is_system_collection(&r.name))
        .collect();
    debug!(
        total,
        resettable = resettable.len(),
        "enumerated collections"
    );
    Ok(resettable)
}

#[async_trait]
impl ResettableStore for Connection {
    type Handle = Collection<BsonDocument>;

    async fn resources(&self) -> Result<Vec<ResourceDescriptor<Self::Handle>>> {
        let names = self.list_collection_names().await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let collection = self.collection(&name);
                ResourceDescriptor::new(name, collection)
            })
            .collect())
    }

    async fn delete_all_documents(&self, handle: &Self::Handle) -> Result<u64> {
        let write_concern = WriteConcern::builder()
            .w(Acknowledgment::Nodes(1))
            .build();
        let result = handle
            .delete_many(doc! {})
            .write_concern(write_concern)
            .await?;
        Ok(result.deleted_count)
    }

    async fn drop_all_indexes(&self, handle: &Self::Handle) -> Result<()> {
        handle.drop_indexes().await?;
        Ok(())
    }
}
