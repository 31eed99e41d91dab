//! A grid node: one member of the cluster with its own registry, exchange
//! pipeline, partition store and cache handles.

use crate::cache::{CacheHandle, CacheHandleManager, HandleState, RequestRouter};
use crate::cluster::{CustomEvent, Discovery, LocalDiscovery};
use crate::config::{CacheConfiguration, NodeConfig};
use crate::error::{Error, Result};
use crate::exchange::{
    CacheChangeRequest, ExchangeFutures, ExchangeInput, ExchangeRecord, ExchangeState,
    ExchangeWorker,
};
use crate::metrics::GridMetrics;
use crate::network::{decode_message, Envelope, LocalNetwork, Message, Transport};
use crate::registry::{CacheDescriptor, CacheGroup, CacheGroupRegistry, ConsistencyValidator};
use crate::storage::{HeapCaches, PartitionState, PartitionStore, Preloader};
use crate::types::{NodeId, NodeRole, TopologyVersion};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Components shared by the tasks of one node.
#[derive(Clone)]
pub(crate) struct NodeContext {
    pub node_id: NodeId,
    pub config: NodeConfig,
    pub validator: ConsistencyValidator,
    pub discovery: Arc<dyn Discovery>,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<CacheGroupRegistry>,
    pub store: Arc<PartitionStore>,
    pub heap: Arc<HeapCaches>,
    pub preloader: Arc<Preloader>,
    pub router: Arc<RequestRouter>,
    pub handles: Arc<CacheHandleManager>,
    pub futures: Arc<ExchangeFutures>,
    pub metrics: Arc<GridMetrics>,
}

/// A running cluster member.
///
/// Cache creation and destruction go through discovery and complete when
/// the exchange that carries them is applied on this node. Getting and
/// closing a cache are local.
pub struct GridNode {
    ctx: NodeContext,
    network: Arc<LocalNetwork>,
    /// Exchange worker shutdown signal sender.
    shutdown_tx: mpsc::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl GridNode {
    /// Start a node and join the cluster.
    ///
    /// This will:
    /// 1. Register the node on the network and start its message dispatcher
    /// 2. Join discovery and start the exchange worker
    /// 3. Wait until the exchange of the join is applied
    pub async fn start(
        config: NodeConfig,
        discovery: &Arc<LocalDiscovery>,
        network: &Arc<LocalNetwork>,
    ) -> Result<Self> {
        let node_id = config.node_id;
        info!(node_id, role = ?config.role, "Starting grid node");

        let (endpoint, inbox) = network.register(node_id);
        let transport: Arc<dyn Transport> = endpoint;

        let join = match discovery.join(node_id, config.role) {
            Ok(join) => join,
            Err(e) => {
                network.unregister(node_id);
                return Err(e);
            }
        };
        let join_version = join.version;

        let registry = Arc::new(CacheGroupRegistry::new(node_id, config.role));
        let store = Arc::new(PartitionStore::new());
        let heap = Arc::new(HeapCaches::new(config.on_heap_capacity));
        let metrics = Arc::new(GridMetrics::new());
        let preloader = Arc::new(Preloader::new(
            node_id,
            store.clone(),
            transport.clone(),
            config.exchange.preload_retry_interval,
            config.router.request_timeout,
        ));
        let router = Arc::new(RequestRouter::new(
            registry.clone(),
            store.clone(),
            heap.clone(),
            transport.clone(),
            config.router.clone(),
            metrics.clone(),
        ));

        let ctx = NodeContext {
            node_id,
            validator: ConsistencyValidator::new(config.validation),
            discovery: join.endpoint,
            transport,
            registry,
            store,
            heap,
            preloader,
            router,
            handles: Arc::new(CacheHandleManager::new(node_id)),
            futures: Arc::new(ExchangeFutures::new(config.exchange.history_size)),
            metrics,
            config,
        };

        let (exchange_tx, exchange_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let worker = ExchangeWorker::new(ctx.clone());
        let worker_task = tokio::spawn(worker.run(join.events, exchange_rx, shutdown_rx));
        let dispatcher_task = tokio::spawn(Self::run_dispatcher(ctx.clone(), inbox, exchange_tx));

        let node = Self {
            ctx,
            network: network.clone(),
            shutdown_tx,
            tasks: Mutex::new(vec![worker_task, dispatcher_task]),
            stopped: AtomicBool::new(false),
        };

        let timeout = node.ctx.config.exchange.await_timeout;
        if let Err(e) = node.ctx.futures.wait_ready(join_version, timeout).await {
            warn!(node_id, version = join_version, error = %e, "Join exchange did not complete");
            node.stop();
            return Err(e);
        }

        info!(
            node_id,
            version = node.topology_version(),
            "Grid node started"
        );
        Ok(node)
    }

    /// Route inbound messages to the exchange worker, the router and the
    /// preloader.
    async fn run_dispatcher(
        ctx: NodeContext,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        exchange: mpsc::UnboundedSender<ExchangeInput>,
    ) {
        while let Some(envelope) = inbox.recv().await {
            let from = envelope.from;
            let msg = match decode_message(&envelope.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(node_id = ctx.node_id, from, error = %e, "Failed to decode message");
                    continue;
                }
            };

            match msg {
                Message::Single(single) => {
                    if exchange.send(ExchangeInput::Single(single)).is_err() {
                        debug!(node_id = ctx.node_id, from, "Exchange worker gone, report dropped");
                    }
                }
                Message::Full(full) => {
                    if exchange.send(ExchangeInput::Full(full)).is_err() {
                        debug!(node_id = ctx.node_id, from, "Exchange worker gone, full map dropped");
                    }
                }
                Message::Request(request) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let response = ctx.router.handle_request(request).await;
                        if let Err(e) = ctx.transport.send(from, &Message::Response(response)) {
                            debug!(node_id = ctx.node_id, to = from, error = %e, "Response not delivered");
                        }
                    });
                }
                Message::Response(response) => ctx.router.handle_response(response),
                Message::Demand(demand) => {
                    let supply = ctx.preloader.handle_demand(ctx.registry.version(), demand);
                    if let Err(e) = ctx.transport.send(from, &Message::Supply(supply)) {
                        debug!(node_id = ctx.node_id, to = from, error = %e, "Supply not delivered");
                    }
                }
                Message::Supply(supply) => ctx.preloader.handle_supply(supply),
            }
        }
        debug!(node_id = ctx.node_id, "Message dispatcher stopped");
    }

    // ==================== Cache Operations ====================

    /// Create a cache cluster-wide and open it on this node.
    ///
    /// The configuration is checked against this node's registry first, so
    /// a conflict is reported without an exchange. Otherwise the request is
    /// sent through discovery and its outcome is the one computed when its
    /// exchange is applied here.
    pub async fn create_cache(&self, config: CacheConfiguration) -> Result<CacheHandle> {
        self.check_running()?;
        let name = config.name.clone();

        if let Err(e) = self
            .ctx
            .registry
            .snapshot()
            .check_register(&config, &self.ctx.validator)
        {
            if matches!(e, Error::ConfigurationConflict(_)) {
                self.ctx.metrics.cache_conflicts.inc();
            }
            debug!(node_id = self.node_id(), cache = %name, error = %e, "Cache rejected locally");
            return Err(e);
        }

        self.request(CacheChangeRequest::start(self.node_id(), config))
            .await?;

        let descriptor = self
            .ctx
            .registry
            .cache_descriptor(&name)
            .ok_or(Error::CacheNotFound(name))?;
        Ok(self.open(descriptor))
    }

    /// Destroy a cache cluster-wide. Destroying an unknown cache is a no-op.
    pub async fn destroy_cache(&self, name: &str) -> Result<()> {
        self.check_running()?;
        if self.ctx.registry.cache_descriptor(name).is_none() {
            debug!(node_id = self.node_id(), cache = name, "Destroy of unknown cache ignored");
            return Ok(());
        }
        self.request(CacheChangeRequest::stop(self.node_id(), name))
            .await
    }

    /// Open an existing cache on this node without an exchange.
    pub fn get_cache(&self, name: &str) -> Result<CacheHandle> {
        self.check_running()?;
        let descriptor = self
            .ctx
            .registry
            .cache_descriptor(name)
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))?;
        Ok(self.open(descriptor))
    }

    /// Close this node's handle of a cache. The cache stays registered.
    pub fn close_cache(&self, handle: &CacheHandle) -> Result<()> {
        let name = handle.name();
        if !self.ctx.handles.close(name) {
            return match self.ctx.handles.state(name) {
                HandleState::Closed => Ok(()),
                _ => Err(Error::CacheNotFound(name.to_string())),
            };
        }
        self.ctx.registry.stop_local(name);
        info!(node_id = self.node_id(), cache = name, "Cache closed");
        Ok(())
    }

    fn open(&self, descriptor: CacheDescriptor) -> CacheHandle {
        self.ctx.registry.start_local(&descriptor);
        self.ctx.handles.open(&descriptor);
        CacheHandle::new(
            descriptor,
            self.ctx.router.clone(),
            self.ctx.handles.clone(),
        )
    }

    /// Send a cache change and wait for its outcome.
    async fn request(&self, request: CacheChangeRequest) -> Result<()> {
        let id = request.id;
        let cache = request.cache_name().to_string();
        let rx = self.ctx.futures.register_request(id);

        let version = match self
            .ctx
            .discovery
            .send_custom(CustomEvent::CacheChange(request))
        {
            Ok(version) => version,
            Err(e) => {
                self.ctx.futures.cancel_request(id);
                return Err(e);
            }
        };
        debug!(node_id = self.node_id(), cache = %cache, version, "Cache change sent");

        self.wait_request(id, rx).await
    }

    async fn wait_request(
        &self,
        id: uuid::Uuid,
        rx: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        match tokio::time::timeout(self.ctx.config.exchange.await_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::NodeStopped),
            Err(_) => {
                self.ctx.futures.cancel_request(id);
                Err(Error::Timeout)
            }
        }
    }

    // ==================== Registry Queries ====================

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.ctx.config.role
    }

    /// Group visible on this node, if any.
    pub fn cache_group(&self, name: &str) -> Option<CacheGroup> {
        self.ctx.registry.cache_group(name)
    }

    pub fn groups_snapshot(&self) -> Vec<CacheGroup> {
        self.ctx.registry.groups_snapshot()
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.ctx.registry.snapshot().caches.keys().cloned().collect()
    }

    pub fn handle_state(&self, cache: &str) -> HandleState {
        self.ctx.handles.state(cache)
    }

    /// Version of the last exchange applied on this node.
    pub fn topology_version(&self) -> TopologyVersion {
        self.ctx.registry.version()
    }

    pub fn registry(&self) -> &Arc<CacheGroupRegistry> {
        &self.ctx.registry
    }

    /// Locally held partitions still waiting for their preload.
    pub fn moving_partitions(&self) -> usize {
        self.ctx
            .store
            .groups()
            .iter()
            .flat_map(|g| self.ctx.store.partitions(g))
            .filter(|p| p.state() == PartitionState::Moving)
            .count()
    }

    // ==================== Exchange ====================

    /// Wait for the exchange of a version to complete on this node.
    pub async fn await_exchange(&self, version: TopologyVersion) -> Result<()> {
        self.ctx
            .futures
            .wait(version, self.ctx.config.exchange.await_timeout)
            .await
    }

    pub fn exchange_state(&self, version: TopologyVersion) -> Option<ExchangeState> {
        self.ctx.futures.state(version)
    }

    pub fn exchange_history(&self) -> Vec<ExchangeRecord> {
        self.ctx.futures.history()
    }

    pub fn metrics(&self) -> &GridMetrics {
        &self.ctx.metrics
    }

    // ==================== Lifecycle ====================

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::NodeStopped);
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Leave the cluster gracefully.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = self.node_id(), "Stopping grid node");
        self.ctx.discovery.leave();
        self.shutdown();
    }

    /// Stop without leaving, as a crashed node would. Discovery is expected
    /// to report the failure.
    pub fn halt(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(node_id = self.node_id(), "Halting grid node");
        self.shutdown();
    }

    fn shutdown(&self) {
        self.network.unregister(self.node_id());
        self.ctx.preloader.stop();
        let _ = self.shutdown_tx.try_send(());
        self.ctx.futures.close();
    }
}

impl Drop for GridNode {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
