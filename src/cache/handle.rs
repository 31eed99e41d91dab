//! User-facing handle of one cache on one node.

use super::manager::{CacheHandleManager, HandleState};
use super::router::RequestRouter;
use crate::error::{Error, Result};
use crate::query::{FieldValue, QueryProperty};
use crate::registry::CacheDescriptor;
use crate::types::PeekMode;
use bytes::Bytes;
use std::sync::Arc;

/// A cache opened on this node by create or get.
///
/// Every operation first checks the local handle state: a closed handle
/// fails with `CacheClosed`, a handle whose cache was destroyed with
/// `CacheNotFound`.
#[derive(Clone)]
pub struct CacheHandle {
    descriptor: CacheDescriptor,
    router: Arc<RequestRouter>,
    manager: Arc<CacheHandleManager>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("name", &self.descriptor.name)
            .field("group", &self.descriptor.group_name)
            .field("state", &self.state())
            .finish()
    }
}

impl CacheHandle {
    pub(crate) fn new(
        descriptor: CacheDescriptor,
        router: Arc<RequestRouter>,
        manager: Arc<CacheHandleManager>,
    ) -> Self {
        Self {
            descriptor,
            router,
            manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn group_name(&self) -> &str {
        &self.descriptor.group_name
    }

    pub fn descriptor(&self) -> &CacheDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> HandleState {
        self.manager.state(&self.descriptor.name)
    }

    fn check(&self) -> Result<()> {
        match self.state() {
            HandleState::Open => Ok(()),
            HandleState::Closed => Err(Error::CacheClosed(self.descriptor.name.clone())),
            HandleState::NotPresent => Err(Error::CacheNotFound(self.descriptor.name.clone())),
        }
    }

    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.check()?;
        self.router
            .put(&self.descriptor.name, key.into(), value.into())
            .await
    }

    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.check()?;
        self.router.get(&self.descriptor.name, key.into()).await
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn remove(&self, key: impl Into<Bytes>) -> Result<bool> {
        self.check()?;
        self.router.remove(&self.descriptor.name, key.into()).await
    }

    /// Number of entries cluster-wide.
    pub async fn size(&self) -> Result<u64> {
        self.check()?;
        self.router.size(&self.descriptor.name).await
    }

    pub fn local_size(&self, mode: PeekMode) -> Result<u64> {
        self.check()?;
        self.router.local_size(&self.descriptor.name, mode)
    }

    pub fn local_peek(&self, key: impl Into<Bytes>, mode: PeekMode) -> Result<Option<Bytes>> {
        self.check()?;
        self.router
            .local_peek(&self.descriptor.name, &key.into(), mode)
    }

    /// Accessors for every query field configured on the cache.
    pub fn query_properties(&self) -> Vec<QueryProperty> {
        self.descriptor
            .config
            .query_fields
            .iter()
            .map(QueryProperty::new)
            .collect()
    }

    pub fn query_property(&self, name: &str) -> Option<QueryProperty> {
        self.descriptor
            .config
            .query_fields
            .iter()
            .find(|f| f.name == name)
            .map(QueryProperty::new)
    }

    fn property(&self, name: &str) -> Result<QueryProperty> {
        self.query_property(name).ok_or_else(|| {
            Error::InvalidRecord(format!(
                "{} is not a query field of {}",
                name, self.descriptor.name
            ))
        })
    }

    /// Read a query field of a stored entry. Absent if the entry or the
    /// field is missing.
    pub async fn field(&self, key: impl Into<Bytes>, name: &str) -> Result<Option<FieldValue>> {
        let property = self.property(name)?;
        let key = key.into();
        match self.get(key.clone()).await? {
            Some(value) => property.value(&key, &value),
            None => Ok(None),
        }
    }

    /// Set a value field of a stored entry. Returns false if the entry is
    /// missing.
    pub async fn set_field(
        &self,
        key: impl Into<Bytes>,
        name: &str,
        new: FieldValue,
    ) -> Result<bool> {
        let property = self.property(name)?;
        if property.is_key() {
            return Err(Error::InvalidRecord(format!(
                "{} is a key field and cannot be updated in place",
                name
            )));
        }
        let key = key.into();
        let Some(value) = self.get(key.clone()).await? else {
            return Ok(false);
        };
        let (key, value) = property.set_value(&key, &value, new)?;
        self.put(key, value).await?;
        Ok(true)
    }
}
