//! Routing of data operations to partition owners.
//!
//! Every operation is routed with the current registry snapshot: the key's
//! partition and its primary come from the published assignment, and the
//! primary only executes it if it has applied the same version and owns the
//! partition completely. Anything else is retried with a linear backoff.

use crate::config::RouterConfig;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::GridMetrics;
use crate::network::{DataOp, DataReply, DataRequest, DataResponse, Message, PendingRequests, Transport};
use crate::registry::{CacheDescriptor, CacheGroup, CacheGroupRegistry, RegistryState};
use crate::storage::{HeapCaches, LocalPartition, PartitionState, PartitionStore};
use crate::types::{partition_for_key, NodeId, PartitionId, PeekMode, TopologyVersion};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RequestRouter {
    node_id: NodeId,
    registry: Arc<CacheGroupRegistry>,
    store: Arc<PartitionStore>,
    heap: Arc<HeapCaches>,
    transport: Arc<dyn Transport>,
    pending: PendingRequests<DataResponse>,
    config: RouterConfig,
    metrics: Arc<GridMetrics>,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<CacheGroupRegistry>,
        store: Arc<PartitionStore>,
        heap: Arc<HeapCaches>,
        transport: Arc<dyn Transport>,
        config: RouterConfig,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        Self {
            node_id: registry.node_id(),
            registry,
            store,
            heap,
            transport,
            pending: PendingRequests::new(),
            config,
            metrics,
        }
    }

    pub async fn put(&self, cache: &str, key: Bytes, value: Bytes) -> Result<()> {
        let routing_key = key.clone();
        match self.route(cache, &routing_key, DataOp::Put { key, value }).await? {
            DataReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&self, cache: &str, key: Bytes) -> Result<Option<Bytes>> {
        match self.route(cache, &key, DataOp::Get { key: key.clone() }).await? {
            DataReply::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn remove(&self, cache: &str, key: Bytes) -> Result<bool> {
        match self.route(cache, &key, DataOp::Remove { key: key.clone() }).await? {
            DataReply::Removed(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    /// Entries of a cache cluster-wide, counted at the primaries.
    pub async fn size(&self, cache: &str) -> Result<u64> {
        self.metrics.data_requests.inc();
        self.with_retries(cache, move || async move {
            let state = self.registry.snapshot();
            if state.cache(cache).is_none() {
                return Err(Error::CacheNotFound(cache.to_string()));
            }

            let mut total = 0;
            for &server in &state.servers {
                let reply = if server == self.node_id {
                    self.execute(state.version, cache, DataOp::Size).await?
                } else {
                    self.remote(server, state.version, cache, DataOp::Size).await?
                };
                match reply {
                    DataReply::Size(n) => total += n,
                    other => return Err(unexpected(other)),
                }
            }
            Ok(total)
        })
        .await
    }

    /// Entries held on this node in partitions selected by `mode`.
    pub fn local_size(&self, cache: &str, mode: PeekMode) -> Result<u64> {
        let state = self.registry.snapshot();
        let (descriptor, group) = Self::resolve(&state, cache)?;
        let Some(assignment) = group.assignment() else {
            return Ok(0);
        };

        let partitions: Vec<PartitionId> = match mode {
            PeekMode::Primary => assignment.primary_partitions_of(self.node_id),
            PeekMode::Backup => assignment
                .partitions_of(self.node_id)
                .into_iter()
                .filter(|&p| !assignment.is_primary(self.node_id, p))
                .collect(),
            PeekMode::All => assignment.partitions_of(self.node_id),
        };
        Ok(self.store.size(&group.name, descriptor.cache_id, partitions))
    }

    /// Value held on this node, if its partition matches `mode`.
    pub fn local_peek(&self, cache: &str, key: &Bytes, mode: PeekMode) -> Result<Option<Bytes>> {
        let state = self.registry.snapshot();
        let (descriptor, group) = Self::resolve(&state, cache)?;
        let Some(assignment) = group.assignment() else {
            return Ok(None);
        };

        let partition = partition_for_key(key, group.partitions);
        let selected = match mode {
            PeekMode::Primary => assignment.is_primary(self.node_id, partition),
            PeekMode::Backup => {
                assignment.is_owner(self.node_id, partition)
                    && !assignment.is_primary(self.node_id, partition)
            }
            PeekMode::All => assignment.is_owner(self.node_id, partition),
        };
        if !selected {
            return Ok(None);
        }
        Ok(self
            .store
            .partition(&group.name, partition)
            .and_then(|local| local.get(descriptor.cache_id, key)))
    }

    async fn route(&self, cache: &str, key: &Bytes, op: DataOp) -> Result<DataReply> {
        self.metrics.data_requests.inc();
        let op = &op;
        self.with_retries(cache, move || async move {
            let state = self.registry.snapshot();
            let (_, group) = Self::resolve(&state, cache)?;
            let partition = partition_for_key(key, group.partitions);
            let primary = group
                .assignment()
                .and_then(|a| a.primary(partition))
                .ok_or_else(|| Error::PartitionUnavailable {
                    group: group.name.clone(),
                    partition,
                })?;

            if primary == self.node_id {
                self.execute(state.version, cache, op.clone()).await
            } else {
                self.remote(primary, state.version, cache, op.clone()).await
            }
        })
        .await
    }

    async fn with_retries<T, F, Fut>(&self, cache: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for n in 1..=self.config.max_attempts {
            match attempt().await {
                Err(e) if should_retry(&e) => {
                    self.metrics.data_retries.inc();
                    debug!(
                        node_id = self.node_id,
                        cache,
                        attempt = n,
                        error = %e,
                        "Retrying data operation"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(self.config.retry_backoff * n).await;
                }
                other => return other,
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        warn!(node_id = self.node_id, cache, %reason, "Data operation gave up");
        Err(Error::ClusterTopology(format!(
            "cache {} unavailable after {} attempts: {}",
            cache, self.config.max_attempts, reason
        )))
    }

    fn resolve<'a>(
        state: &'a RegistryState,
        cache: &str,
    ) -> Result<(&'a CacheDescriptor, &'a CacheGroup)> {
        let descriptor = state
            .cache(cache)
            .ok_or_else(|| Error::CacheNotFound(cache.to_string()))?;
        let group = state
            .group(&descriptor.group_name)
            .ok_or_else(|| Error::CacheNotFound(cache.to_string()))?;
        Ok((descriptor, group))
    }

    async fn remote(
        &self,
        to: NodeId,
        version: TopologyVersion,
        cache: &str,
        op: DataOp,
    ) -> Result<DataReply> {
        let (request_id, rx) = self.pending.register();
        let msg = Message::Request(DataRequest {
            request_id,
            version,
            cache: cache.to_string(),
            op,
        });
        if let Err(e) = self.transport.send(to, &msg) {
            self.pending.cancel(request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => response.result.map_err(Error::from),
            Ok(Err(_)) => Err(NetworkError::ChannelClosed.into()),
            Err(_) => {
                self.pending.cancel(request_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Execute an operation routed to this node at `version`.
    pub async fn execute(
        &self,
        version: TopologyVersion,
        cache: &str,
        op: DataOp,
    ) -> Result<DataReply> {
        let state = self.registry.snapshot();
        let backup_op = matches!(op, DataOp::BackupPut { .. } | DataOp::BackupRemove { .. });
        // Backups also take updates routed at an older version, never one
        // they have not applied yet.
        let stale = if backup_op {
            state.version < version
        } else {
            state.version != version
        };
        if stale {
            return Err(Error::RetryableTopology {
                version,
                superseded_by: state.version,
            });
        }

        let (descriptor, group) = Self::resolve(&state, cache)?;
        let cache_id = descriptor.cache_id;
        let on_heap = descriptor.on_heap_cache;

        match op {
            DataOp::Size => {
                let assignment = group.assignment().ok_or_else(|| Error::PartitionUnavailable {
                    group: group.name.clone(),
                    partition: 0,
                })?;
                let primaries = assignment.primary_partitions_of(self.node_id);
                for &p in &primaries {
                    self.owning(group, p)?;
                }
                Ok(DataReply::Size(self.store.size(&group.name, cache_id, primaries)))
            }
            DataOp::Put { key, value } => {
                let (partition, local) = self.primary(group, &key)?;
                local.put(cache_id, key.clone(), value.clone());
                if on_heap {
                    self.heap.insert(cache_id, key.clone(), value.clone()).await;
                }
                self.replicate(group, partition, version, cache, DataOp::BackupPut {
                    partition,
                    key,
                    value,
                })
                .await;
                Ok(DataReply::Done)
            }
            DataOp::Get { key } => {
                let (_, local) = self.primary(group, &key)?;
                if on_heap {
                    if let Some(value) = self.heap.get(cache_id, &key).await {
                        return Ok(DataReply::Value(Some(value)));
                    }
                }
                let value = local.get(cache_id, &key);
                if let (true, Some(v)) = (on_heap, &value) {
                    self.heap.insert(cache_id, key.clone(), v.clone()).await;
                    // A write between the read and the insert leaves the
                    // store ahead of the heap.
                    if local.get(cache_id, &key).as_ref() != Some(v) {
                        self.heap.invalidate(cache_id, &key).await;
                    }
                }
                Ok(DataReply::Value(value))
            }
            DataOp::Remove { key } => {
                let (partition, local) = self.primary(group, &key)?;
                let existed = local.remove(cache_id, &key).is_some();
                if on_heap {
                    self.heap.invalidate(cache_id, &key).await;
                }
                self.replicate(group, partition, version, cache, DataOp::BackupRemove {
                    partition,
                    key,
                })
                .await;
                Ok(DataReply::Removed(existed))
            }
            DataOp::BackupPut {
                partition,
                key,
                value,
            } => {
                self.backup(group, partition)?.put(cache_id, key, value);
                Ok(DataReply::Done)
            }
            DataOp::BackupRemove { partition, key } => {
                self.backup(group, partition)?.remove(cache_id, &key);
                Ok(DataReply::Done)
            }
        }
    }

    fn unavailable(group: &CacheGroup, partition: PartitionId) -> Error {
        Error::PartitionUnavailable {
            group: group.name.clone(),
            partition,
        }
    }

    fn owning(&self, group: &CacheGroup, partition: PartitionId) -> Result<Arc<LocalPartition>> {
        self.store
            .partition(&group.name, partition)
            .filter(|l| l.state() == PartitionState::Owning)
            .ok_or_else(|| Self::unavailable(group, partition))
    }

    /// Local partition of a key this node is the primary for.
    fn primary(&self, group: &CacheGroup, key: &Bytes) -> Result<(PartitionId, Arc<LocalPartition>)> {
        let partition = partition_for_key(key, group.partitions);
        let is_primary = group
            .assignment()
            .map(|a| a.is_primary(self.node_id, partition))
            .unwrap_or(false);
        if !is_primary {
            return Err(Self::unavailable(group, partition));
        }
        Ok((partition, self.owning(group, partition)?))
    }

    /// Backups accept writes while still preloading.
    fn backup(&self, group: &CacheGroup, partition: PartitionId) -> Result<Arc<LocalPartition>> {
        self.store
            .partition(&group.name, partition)
            .filter(|l| matches!(l.state(), PartitionState::Owning | PartitionState::Moving))
            .ok_or_else(|| Self::unavailable(group, partition))
    }

    /// Send a primary's update to every backup owner of the partition.
    ///
    /// The operation already succeeded on the primary. A backup that keeps
    /// rejecting the update after the retry budget is counted in
    /// `backup_failures` and left to the next preload.
    async fn replicate(
        &self,
        group: &CacheGroup,
        partition: PartitionId,
        version: TopologyVersion,
        cache: &str,
        op: DataOp,
    ) {
        let Some(assignment) = group.assignment() else {
            return;
        };
        for &backup in assignment.backups(partition) {
            let mut attempt = 1;
            loop {
                match self.remote(backup, version, cache, op.clone()).await {
                    Ok(_) => break,
                    Err(e) if should_retry(&e) && attempt < self.config.max_attempts => {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        self.metrics.backup_failures.inc();
                        warn!(
                            node_id = self.node_id,
                            backup,
                            partition,
                            attempts = attempt,
                            error = %e,
                            "Backup update failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Serve a data request from another node.
    pub async fn handle_request(&self, request: DataRequest) -> DataResponse {
        let result = self
            .execute(request.version, &request.cache, request.op)
            .await;
        DataResponse::new(request.request_id, result)
    }

    pub fn handle_response(&self, response: DataResponse) {
        let request_id = response.request_id;
        if !self.pending.complete(request_id, response) {
            debug!(node_id = self.node_id, request_id, "Response for unknown request dropped");
        }
    }
}

fn should_retry(e: &Error) -> bool {
    e.is_retryable() || matches!(e, Error::Network(_) | Error::Timeout)
}

fn unexpected(reply: DataReply) -> Error {
    Error::Internal(format!("unexpected reply: {:?}", reply))
}
