use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::errors::{ErrorKind, Result};
use crate::get_peers::GetPeersCoordinator;
use crate::heuristic;
use crate::observer::InfoHashObserver;
use chrono::{DateTime, Utc};
use krpc_encoding::{Envelope, MessageType, NodeInfo, Query, Response, U160};
use log::{debug, info, warn};
use routing_table::{AddOutcome, RoutingTable, K};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use throttler::Throttler;
use tokio::sync::mpsc;
use tokio_krpc::{ActiveTransactions, Inbound, KrpcSocket, RequestTransport};

/// Outcome of a query sent outside the main receive loop (`throttled_get_peers`,
/// the refresh-nodes ping), reported back so the single-threaded engine can
/// fold it into its own state without sharing it across tasks.
enum EngineOutcome {
    GetPeersResponded {
        info_hash: U160,
        addr: SocketAddrV4,
        response: Response,
    },
    PingResponded {
        id: U160,
        addr: SocketAddrV4,
    },
}

/// Placeholder token this node hands back from `get_peers` responses. It
/// participates in the wire protocol without actually tracking who holds
/// a token for `announce_peer` (spec.md §4.5 explicitly allows this).
const GET_PEERS_TOKEN: &[u8] = b"tok";

const SAMPLE_INFOHASHES_INTERVAL_SECS: u16 = 300;

/// How many not-yet-traversed `get_peers` candidates to query per tick,
/// per lookup (the "amplification check" from spec.md §4.6 step 4).
const GET_PEERS_AMPLIFICATION: usize = 3;

/// The DHT protocol engine: owns the UDP socket, the main routing table,
/// any auxiliary tables used for `sample_infohashes` walks, a throttler
/// for outgoing `get_peers` expansion, and the periodic timers that keep
/// the table fresh and lookups moving (spec.md §4.5).
pub struct DhtEngine {
    self_id: U160,
    request_transport: Arc<RequestTransport>,
    routing_table: RoutingTable,
    aux_routing_tables: Vec<RoutingTable>,
    blacklist: Blacklist,
    get_peers: GetPeersCoordinator,
    throttler: Throttler,
    observer: Arc<dyn InfoHashObserver>,
    config: Config,
    outcomes_tx: mpsc::UnboundedSender<EngineOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<EngineOutcome>,
}

impl DhtEngine {
    pub async fn bind(config: Config, observer: Arc<dyn InfoHashObserver>) -> Result<DhtEngine> {
        let self_id = match &config.self_node_id {
            Some(hex) => U160::from_hex(hex)?,
            None => U160::random(),
        };

        let bind_addr = SocketAddr::new(config.bind_ip.into(), config.bind_port);
        let udp_socket = tokio::net::UdpSocket::bind(bind_addr)
            .await
            .map_err(|_| ErrorKind::SystemError {
                message: format!("failed to bind dht udp socket on {}", bind_addr),
            })?;
        let transactions = ActiveTransactions::with_expiration(config.transaction_expiration_seconds);
        let socket = KrpcSocket::from_parts(udp_socket, transactions);
        let request_transport = Arc::new(RequestTransport::new(self_id, socket));

        let throttler = Throttler::spawn(throttler::Config {
            enabled: config.throttler_enabled,
            max_rps: config.throttler_max_rps,
            leak_probability: config.throttler_leak_probability,
            max_queue_size: config.throttler_max_queue_size,
            ..throttler::Config::default()
        });

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        Ok(DhtEngine {
            self_id,
            request_transport,
            routing_table: RoutingTable::with_policy(
                self_id,
                config.fat_routing_table,
                config.delete_good_nodes,
                config.max_routing_table_known_nodes,
            ),
            aux_routing_tables: Vec::new(),
            blacklist: Blacklist::new(config.max_routing_table_known_nodes, chrono::Duration::hours(1)),
            get_peers: GetPeersCoordinator::with_expiration(config.get_peers_request_expiration_seconds),
            throttler,
            observer,
            config,
            outcomes_tx,
            outcomes_rx,
        })
    }

    pub fn self_id(&self) -> U160 {
        self.self_id
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.request_transport.socket().local_addr()
    }

    /// Resolves every configured bootstrap host and seeds the routing
    /// table with a single `find_node(self_id)` round against each.
    pub async fn bootstrap(&mut self) {
        let hosts = self.config.bootstrap_nodes.clone();
        for host in hosts {
            let addr = match tokio::net::lookup_host(&host).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => continue,
                },
                Err(e) => {
                    warn!("could not resolve bootstrap host {}: {}", host, e);
                    continue;
                }
            };
            self.discover_via(addr).await;
        }
    }

    async fn discover_via(&mut self, addr: SocketAddr) {
        let target = self.self_id;
        let sender_id = self.effective_sender_id(&target);
        let response = match self
            .request_transport
            .find_node_as(addr, sender_id, target)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("bootstrap find_node to {} failed: {}", addr, e);
                return;
            }
        };
        let now = KrpcSocket::now();
        self.on_query_response(response, addr, now);
    }

    /// Registers a callback for the iterative `get_peers` lookup of
    /// `info_hash`, seeding it from the main routing table when new.
    pub fn get_peers(&mut self, info_hash: U160, callback: impl FnMut(SocketAddrV4) + Send + 'static) {
        let now = KrpcSocket::now();
        let seed = self.routing_table.k_nearest_good_nodes(&info_hash, K, now);
        let to_query = self.get_peers.get_peers(info_hash, callback, seed, now);
        for node in to_query {
            self.throttled_get_peers(info_hash, node.addr);
        }
    }

    fn throttled_get_peers(&self, info_hash: U160, addr: SocketAddrV4) {
        let request_transport = self.request_transport.clone();
        let sender_id = self.effective_sender_id(&info_hash);
        let outcomes = self.outcomes_tx.clone();
        self.throttler.submit(move || {
            tokio::spawn(async move {
                if let Ok(response) = request_transport
                    .get_peers_as(SocketAddr::V4(addr), sender_id, info_hash)
                    .await
                {
                    let _ = outcomes.send(EngineOutcome::GetPeersResponded {
                        info_hash,
                        addr,
                        response,
                    });
                }
            });
        });
    }

    /// Runs the engine forever: the receive loop, the four periodic
    /// timers from spec.md §4.5's table, and the internal channel
    /// `throttled_get_peers` reports its results back through.
    pub async fn run(&mut self) -> Result<()> {
        let mut expand_route = tokio::time::interval(std::time::Duration::from_secs(
            self.config.discovery_interval_seconds,
        ));
        let mut report_stat = tokio::time::interval(std::time::Duration::from_secs(
            self.config.report_interval_seconds,
        ));
        let mut refresh_nodes = tokio::time::interval(std::time::Duration::from_secs(
            self.config.refresh_nodes_check_interval_seconds,
        ));
        let mut get_peers_tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.get_peers_refresh_interval_seconds,
        ));

        loop {
            tokio::select! {
                inbound = self.request_transport.socket().recv() => {
                    match inbound {
                        Ok(Some(Inbound::Query { envelope, from })) => self.handle_query(envelope, from).await,
                        Ok(Some(Inbound::Unrecognized { bytes, from })) => self.handle_unrecognized(&bytes, from).await,
                        Ok(None) => {}
                        Err(e) => debug!("recv error: {}", e),
                    }
                }
                _ = expand_route.tick() => self.on_expand_route().await,
                _ = report_stat.tick() => self.on_report_stat(),
                _ = refresh_nodes.tick() => self.on_refresh_nodes().await,
                _ = get_peers_tick.tick() => self.on_get_peers_tick(),
                outcome = self.outcomes_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.on_engine_outcome(outcome);
                    }
                }
            }
        }
    }

    /// Per spec.md §4.5's expand-route timer: for a sampling of sparse
    /// buckets, asks a contact in that bucket for nodes near both our
    /// own id and a random id inside the bucket's range, so sparse
    /// buckets fill in even when nothing nearby has queried us lately.
    async fn on_expand_route(&mut self) {
        let now = KrpcSocket::now();
        let self_id = self.self_id;
        let expand_targets = self.routing_table.select_expand_route_targets(now);
        let request_transport = self.request_transport.clone();

        for expand_target in expand_targets {
            let via = match expand_target.via {
                Some(via) => via,
                None => continue,
            };
            for target in [self_id, expand_target.target] {
                let request_transport = request_transport.clone();
                let sender_id = self.effective_sender_id(&target);
                tokio::spawn(async move {
                    let _ = request_transport
                        .find_node_as(SocketAddr::V4(via.addr), sender_id, target)
                        .await;
                });
            }
        }
    }

    fn on_report_stat(&self) {
        info!(
            "routing table: {} nodes; get_peers lookups: {} active; throttler queue: {}",
            self.routing_table.len(),
            self.get_peers.active_count(),
            self.throttler.metrics().queue_len,
        );
    }

    async fn on_refresh_nodes(&mut self) {
        let now = KrpcSocket::now();
        self.blacklist.gc(now);

        let mut to_blacklist = Vec::new();
        self.routing_table.gc(now, |addr| to_blacklist.push(addr));
        for addr in to_blacklist {
            self.blacklist.add(addr, now);
        }

        self.request_transport.transactions().gc(now);

        for node in self.routing_table.questionable_nodes(now) {
            self.routing_table.mark_response_required(&node.id, now);
            self.ping_questionable(node.addr);
        }

        if self.routing_table.is_empty() {
            info!("main routing table empty, re-bootstrapping");
            self.bootstrap().await;
        }
    }

    /// Pings a questionable node in a detached task, reporting the result
    /// back through the outcome channel so liveness updates stay on the
    /// engine's own task.
    fn ping_questionable(&self, addr: SocketAddrV4) {
        let request_transport = self.request_transport.clone();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            if let Ok(id) = request_transport.ping(SocketAddr::V4(addr)).await {
                let _ = outcomes.send(EngineOutcome::PingResponded { id, addr });
            }
        });
    }

    fn on_get_peers_tick(&mut self) {
        let now = KrpcSocket::now();
        let batches = self.get_peers.tick(now, GET_PEERS_AMPLIFICATION);
        for (info_hash, nodes) in batches {
            for node in nodes {
                self.throttled_get_peers(info_hash, node.addr);
            }
        }
    }

    /// When `fake_id` is enabled, spoofs the sender id of a query
    /// targeting `target` so its high bits match `target` and its low
    /// `fake_id_prefix_length` bits match our real id (spec.md §4.5).
    fn effective_sender_id(&self, target: &U160) -> U160 {
        if self.config.fake_id {
            self.self_id.fake(target, self.config.fake_id_prefix_length)
        } else {
            self.self_id
        }
    }

    async fn handle_query(&mut self, envelope: Envelope, from: SocketAddr) {
        let query = match envelope.message_type {
            MessageType::Query { query } => query,
            _ => return,
        };
        let now = KrpcSocket::now();

        let from_v4 = match from {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => return,
        };
        if self.blacklist.has(&from_v4, now) {
            return;
        }

        self.note_good_sender(query.sender_id(), from_v4, now);
        let response = self.build_response(&query, now);

        if let Err(e) = self.respond(envelope.transaction_id, response, from).await {
            debug!("failed to respond to {}: {}", from, e);
        }
    }

    fn build_response(&self, query: &Query, now: DateTime<Utc>) -> Response {
        match query {
            Query::Ping { .. } => Response::OnlyId { id: self.self_id },
            Query::FindNode { target, .. } => Response::NextHop {
                id: self.self_id,
                token: None,
                nodes: self.routing_table.k_nearest_good_nodes(target, K, now),
            },
            Query::GetPeers { .. } => Response::GetPeers {
                id: self.self_id,
                token: Some(serde_bytes::ByteBuf::from(GET_PEERS_TOKEN.to_vec())),
                peers: Vec::new(),
            },
            Query::AnnouncePeer { info_hash, .. } => {
                self.observer.observe(*info_hash);
                Response::OnlyId { id: self.self_id }
            }
            Query::SampleInfoHashes { target, .. } => Response::Samples {
                id: self.self_id,
                interval: Some(SAMPLE_INFOHASHES_INTERVAL_SECS),
                nodes: self.routing_table.k_nearest_good_nodes(target, K, now),
                num: Some(0),
                samples: Vec::new(),
            },
        }
    }

    /// Unrecognized-method compatibility fallback (spec.md §4.2): any
    /// datagram carrying a transaction id plus an `info_hash` or `target`
    /// field is answered as though it were `find_node`.
    async fn handle_unrecognized(&mut self, bytes: &[u8], from: SocketAddr) {
        let (transaction_id, target) = match heuristic::guess_unknown_query(bytes) {
            Some(found) => found,
            None => {
                debug!("dropping unrecognized datagram from {}", from);
                return;
            }
        };
        let now = KrpcSocket::now();
        let response = Response::NextHop {
            id: self.self_id,
            token: None,
            nodes: self.routing_table.k_nearest_good_nodes(&target, K, now),
        };
        if let Err(e) = self.respond(transaction_id, response, from).await {
            debug!("failed to respond to unrecognized query from {}: {}", from, e);
        }
    }

    async fn respond(&self, transaction_id: Vec<u8>, response: Response, to: SocketAddr) -> Result<()> {
        let envelope = Envelope {
            ip: self
                .config
                .public_ip
                .map(|ip| krpc_encoding::Addr(SocketAddrV4::new(ip, 0))),
            transaction_id,
            version: Some(serde_bytes::ByteBuf::from(b"RS00".to_vec())),
            message_type: MessageType::Response { response },
            read_only: false,
        };
        let bytes = envelope.encode()?;
        self.request_transport.socket().send_to(&bytes, to).await?;
        Ok(())
    }

    fn on_query_response(&mut self, response: Response, from: SocketAddr, now: DateTime<Utc>) {
        let from_v4 = match from {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => return,
        };
        self.note_good_sender(response.sender_id(), from_v4, now);

        if let Response::NextHop { nodes, .. } = &response {
            for node in nodes {
                self.routing_table.add_node(*node, now);
            }
        }
    }

    fn note_good_sender(&mut self, id: U160, addr: SocketAddrV4, now: DateTime<Utc>) {
        if let AddOutcome::ConflictingId { .. } =
            self.routing_table.add_node(NodeInfo::new(id, addr), now)
        {
            self.blacklist.add(addr, now);
            return;
        }
        self.routing_table.make_good_now(&id, now);
        for table in &mut self.aux_routing_tables {
            table.add_node(NodeInfo::new(id, addr), now);
            table.make_good_now(&id, now);
        }
    }

    /// Folds a query response reported back from a throttled or spawned,
    /// detached task into this engine's own state. This is the only place
    /// `EngineOutcome` is consumed, keeping all mutation of `self.get_peers`
    /// and `self.routing_table` on the single task that owns them
    /// (spec.md §5).
    fn on_engine_outcome(&mut self, outcome: EngineOutcome) {
        let now = KrpcSocket::now();
        match outcome {
            EngineOutcome::GetPeersResponded { info_hash, addr, response } => {
                self.note_good_sender(response.sender_id(), addr, now);
                self.deliver_get_peers_response(&info_hash, &response.sender_id(), response);
            }
            EngineOutcome::PingResponded { id, addr } => {
                self.note_good_sender(id, addr, now);
            }
        }
    }

    /// Feeds a `get_peers` response into the iterative lookup coordinator,
    /// querying any newly enqueued candidates it returns.
    fn deliver_get_peers_response(&mut self, info_hash: &U160, responder_id: &U160, response: Response) {
        match response {
            Response::GetPeers { peers, .. } => {
                let addrs = peers.into_iter().map(|addr| addr.0).collect();
                self.get_peers.on_peers_response(info_hash, responder_id, addrs);
            }
            Response::NextHop { nodes, .. } => {
                let to_query = self.get_peers.on_nodes_response(info_hash, responder_id, nodes);
                for node in to_query {
                    self.throttled_get_peers(*info_hash, node.addr);
                }
            }
            _ => {}
        }
    }
}
