use super::{Resource, ResourceId, Status};
use crate::storage::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// Persistence of resources.
///
/// Saves are whole-record and last write wins. Steps for one resource never
/// run concurrently; promotions out of a deferred status, which several
/// workers may attempt at once, go through [`ResourceStore::save_if_status`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn load(&self, id: &ResourceId) -> Result<Option<Resource>>;

    async fn save(&self, resource: &Resource) -> Result<()>;

    /// Saves `resource` only if the stored record still has status
    /// `expected`. Returns false, writing nothing, if the record is missing
    /// or another writer changed its status first.
    async fn save_if_status(&self, expected: Status, resource: &Resource) -> Result<bool>;

    /// Removes the record. Deleting a missing record is not an error.
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Returns every resource whose parent is `parent`, oldest first.
    async fn children(&self, parent: &ResourceId) -> Result<Vec<Resource>>;
}

/// Resource store kept in process memory.
#[derive(Default)]
pub struct InMemoryResourceStore {
    resources: DashMap<ResourceId, Resource>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn load(&self, id: &ResourceId) -> Result<Option<Resource>> {
        Ok(self.resources.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, resource: &Resource) -> Result<()> {
        self.resources.insert(resource.id.clone(), resource.clone());
        Ok(())
    }

    async fn save_if_status(&self, expected: Status, resource: &Resource) -> Result<bool> {
        // The entry guard holds the shard lock across the compare and the write.
        match self.resources.get_mut(&resource.id) {
            Some(mut current) if current.status == expected => {
                *current = resource.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.resources.remove(id);
        Ok(())
    }

    async fn children(&self, parent: &ResourceId) -> Result<Vec<Resource>> {
        let mut children: Vec<Resource> = self
            .resources
            .iter()
            .filter(|entry| entry.value().parent_id.as_ref() == Some(parent))
            .map(|entry| entry.value().clone())
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = InMemoryResourceStore::new();
        let id = ResourceId::new("i-1");
        assert!(store.load(&id).await.unwrap().is_none());

        let mut instance = Resource::instance("i-1", "vm", "small");
        store.save(&instance).await.unwrap();
        instance.transition(Status::Provisioned, None).unwrap();
        store.save(&instance).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap().unwrap().status, Status::Provisioned);

        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_if_status_has_one_winner() {
        let store = InMemoryResourceStore::new();
        let mut deferred = Resource::instance("i-1", "vm", "small");
        deferred.status = Status::ProvisioningDeferred;
        store.save(&deferred).await.unwrap();

        let mut promoted = deferred.clone();
        promoted.transition(Status::Provisioning, None).unwrap();
        let mut failed = deferred.clone();
        failed
            .transition(Status::ProvisioningFailed, Some("parent failed".into()))
            .unwrap();

        assert!(store
            .save_if_status(Status::ProvisioningDeferred, &promoted)
            .await
            .unwrap());
        assert!(!store
            .save_if_status(Status::ProvisioningDeferred, &failed)
            .await
            .unwrap());
        assert_eq!(store.load(&deferred.id).await.unwrap().unwrap().status, Status::Provisioning);

        let missing = Resource::instance("i-2", "vm", "small");
        assert!(!store
            .save_if_status(Status::Provisioning, &missing)
            .await
            .unwrap());
        assert!(store.load(&missing.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_children() {
        let store = InMemoryResourceStore::new();
        store.save(&Resource::instance("parent", "vm", "small")).await.unwrap();
        store
            .save(&Resource::binding("b-1", "parent", "vm", "small"))
            .await
            .unwrap();
        store
            .save(&Resource::instance("child", "vm", "small").with_parent("parent"))
            .await
            .unwrap();
        store
            .save(&Resource::instance("other", "vm", "small").with_parent("elsewhere"))
            .await
            .unwrap();

        let children = store.children(&ResourceId::new("parent")).await.unwrap();
        let mut ids: Vec<&str> = children.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["b-1", "child"]);
    }
}
