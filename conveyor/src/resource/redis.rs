//! Resource records in Redis.
//!
//! - `{prefix}:resource:{id}` (STRING): the resource as JSON
//! - `{prefix}:children:{parent}` (SET): ids of the resource's children

use super::{Resource, ResourceId, ResourceStore, Status};
use crate::core::{deserialize_value, serialize_value};
use crate::storage::{Result, StorageError, DEFAULT_KEY_PREFIX};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;

/// Replaces the record only if its stored status is ARGV[1]; returns 1 if it
/// did. KEYS[2], when given, is the parent's children set.
const SAVE_IF_STATUS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if cjson.decode(current)['status'] ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if KEYS[2] then
    redis.call('SADD', KEYS[2], ARGV[3])
end
return 1
"#;

pub struct RedisResourceStore {
    pool: Pool,
    prefix: String,
    save_if_status_script: redis::Script,
}

impl RedisResourceStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, DEFAULT_KEY_PREFIX).await
    }

    pub async fn with_prefix(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self {
            pool,
            prefix: prefix.into(),
            save_if_status_script: redis::Script::new(SAVE_IF_STATUS_SCRIPT),
        })
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn resource_key(&self, id: &ResourceId) -> String {
        format!("{}:resource:{}", self.prefix, id)
    }

    fn children_key(&self, parent: &ResourceId) -> String {
        format!("{}:children:{}", self.prefix, parent)
    }
}

#[async_trait]
impl ResourceStore for RedisResourceStore {
    async fn load(&self, id: &ResourceId) -> Result<Option<Resource>> {
        let mut conn = self.get_connection().await?;
        let data: Option<Vec<u8>> = conn.get(self.resource_key(id)).await?;
        match data {
            Some(data) => Ok(Some(deserialize_value(&data)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, resource: &Resource) -> Result<()> {
        let data = serialize_value(resource)?;
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().set(self.resource_key(&resource.id), data).ignore();
        if let Some(parent) = &resource.parent_id {
            pipe.sadd(self.children_key(parent), resource.id.as_str()).ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn save_if_status(&self, expected: Status, resource: &Resource) -> Result<bool> {
        let data = serialize_value(resource)?;
        let mut invocation = self.save_if_status_script.key(self.resource_key(&resource.id));
        if let Some(parent) = &resource.parent_id {
            invocation.key(self.children_key(parent));
        }
        invocation
            .arg(expected.as_str())
            .arg(data)
            .arg(resource.id.as_str());
        let mut conn = self.get_connection().await?;
        let saved: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(saved == 1)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let parent = self.load(id).await?.and_then(|resource| resource.parent_id);
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(self.resource_key(id)).ignore();
        if let Some(parent) = parent {
            pipe.srem(self.children_key(&parent), id.as_str()).ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn children(&self, parent: &ResourceId) -> Result<Vec<Resource>> {
        let ids: Vec<String> = {
            let mut conn = self.get_connection().await?;
            conn.smembers(self.children_key(parent)).await?
        };

        let mut children = Vec::with_capacity(ids.len());
        for id in ids {
            // A child deleted between SMEMBERS and GET is simply gone.
            if let Some(child) = self.load(&ResourceId::new(id)).await? {
                children.push(child);
            }
        }
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(children)
    }
}
