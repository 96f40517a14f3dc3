use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::common::META_LIMIT;

use super::config::GossipConfig;
use super::crypto::Sealer;
use super::types::{
    default_winner, ConflictOutcome, Delegate, EventKind, GossipError, GossipMessage, Member,
    MemberEvent, MemberState,
};

/// The membership protocol engine.
///
/// Owns the UDP socket, the member table, and the background tasks that keep
/// both current. Created once per cluster instance and shared behind an `Arc`.
pub struct GossipEngine {
    config: GossipConfig,
    local_name: String,
    advertise: SocketAddr,
    socket: Arc<UdpSocket>,
    sealer: Sealer,
    members: DashMap<String, Member>,
    incarnation: AtomicU64,
    delegate: RwLock<Option<Arc<dyn Delegate>>>,
    event_tx: RwLock<Option<mpsc::Sender<MemberEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipEngine {
    /// Bind the socket, seed the member table with the local node, and start
    /// the receive, probe, and failure-detection loops.
    pub async fn create(config: GossipConfig) -> Result<Arc<Self>, GossipError> {
        let socket = UdpSocket::bind((config.bind_addr, config.bind_port)).await?;
        let bound = socket.local_addr()?;

        let advertise_ip = config.advertise_addr.unwrap_or(config.bind_addr);
        let advertise_port = if config.advertise_port != 0 {
            config.advertise_port
        } else {
            bound.port()
        };
        let advertise = SocketAddr::new(advertise_ip, advertise_port);

        let local_name = config
            .name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let members = DashMap::new();
        members.insert(
            local_name.clone(),
            Member {
                name: local_name.clone(),
                addr: advertise,
                meta: Vec::new(),
                state: MemberState::Alive,
                incarnation: 1,
                last_seen: Some(Instant::now()),
            },
        );

        let sealer = Sealer::new(&config.secret_key);
        let engine = Arc::new(Self {
            config,
            local_name: local_name.clone(),
            advertise,
            socket: Arc::new(socket),
            sealer,
            members,
            incarnation: AtomicU64::new(1),
            delegate: RwLock::new(None),
            event_tx: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        Self::start(&engine);
        info!(name = %local_name, addr = %advertise, "gossip engine started");
        Ok(engine)
    }

    fn start(engine: &Arc<Self>) {
        let mut handles = Vec::with_capacity(3);

        let this = Arc::clone(engine);
        handles.push(tokio::spawn(async move {
            this.receive_loop().await;
        }));

        let this = Arc::clone(engine);
        handles.push(tokio::spawn(async move {
            this.probe_loop().await;
        }));

        let this = Arc::clone(engine);
        handles.push(tokio::spawn(async move {
            this.failure_detection_loop().await;
        }));

        if let Ok(mut tasks) = engine.tasks.lock() {
            tasks.extend(handles);
        }
    }

    /// Name assigned to the local node (configured or engine-generated).
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Socket address other nodes contact this one at.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    /// The local node's current member record.
    pub fn local_member(&self) -> Member {
        match self.members.get(&self.local_name) {
            Some(member) => member.clone(),
            None => Member {
                name: self.local_name.clone(),
                addr: self.advertise,
                meta: Vec::new(),
                state: MemberState::Alive,
                incarnation: self.incarnation.load(Ordering::SeqCst),
                last_seen: None,
            },
        }
    }

    /// All members failure detection still counts as part of the cluster,
    /// including the local node.
    pub fn members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Active member count, local node included.
    pub fn num_members(&self) -> usize {
        self.members
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Register the delegate supplying local metadata and the conflict policy.
    pub async fn set_delegate(&self, delegate: Arc<dyn Delegate>) {
        *self.delegate.write().await = Some(delegate);
    }

    /// Register the channel membership events are forwarded on.
    pub async fn set_event_sink(&self, tx: mpsc::Sender<MemberEvent>) {
        *self.event_tx.write().await = Some(tx);
    }

    /// Contact seed addresses and wait (bounded) for them to show up in the
    /// member table. Returns how many of the targets were reached.
    pub async fn join(&self, targets: &[SocketAddr]) -> Result<usize, GossipError> {
        if targets.is_empty() {
            return Ok(0);
        }

        let local = self.local_member();
        for target in targets {
            let msg = GossipMessage::Join {
                member: local.clone(),
            };
            if let Err(e) = self.send_to(&msg, *target).await {
                debug!(%target, "join datagram failed: {e}");
            }
        }

        let deadline = Instant::now() + self.config.join_timeout;
        loop {
            let contacted = targets
                .iter()
                .filter(|target| {
                    self.members.iter().any(|entry| {
                        entry.key() != &self.local_name && entry.value().addr == **target
                    })
                })
                .count();

            if contacted == targets.len() {
                return Ok(contacted);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(contacted);
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(25))).await;
        }
    }

    /// Re-gossip the local descriptor: pull a fresh metadata blob from the
    /// delegate, bump the incarnation, and announce within `timeout`.
    pub async fn update_local_node(&self, timeout: Duration) -> Result<(), GossipError> {
        let delegate = self.delegate.read().await.clone();
        let meta = match delegate {
            Some(delegate) => {
                let meta = delegate.local_meta(META_LIMIT);
                if meta.len() > META_LIMIT {
                    return Err(GossipError::MetaTooLarge {
                        len: meta.len(),
                        limit: META_LIMIT,
                    });
                }
                meta
            }
            None => Vec::new(),
        };

        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        let local = {
            match self.members.entry(self.local_name.clone()) {
                Entry::Occupied(mut entry) => {
                    let member = entry.get_mut();
                    member.meta = meta;
                    member.incarnation = incarnation;
                    member.state = MemberState::Alive;
                    member.last_seen = Some(Instant::now());
                    member.clone()
                }
                Entry::Vacant(entry) => entry
                    .insert(Member {
                        name: self.local_name.clone(),
                        addr: self.advertise,
                        meta,
                        state: MemberState::Alive,
                        incarnation,
                        last_seen: Some(Instant::now()),
                    })
                    .clone(),
            }
        };

        let _ = tokio::time::timeout(timeout, self.broadcast(GossipMessage::Alive { member: local }))
            .await;
        Ok(())
    }

    /// Announce departure to the cluster, bounded by `timeout`.
    pub async fn leave(&self, timeout: Duration) {
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut local) = self.members.get_mut(&self.local_name) {
            local.state = MemberState::Left;
            local.incarnation = incarnation;
        }

        let msg = GossipMessage::Leave {
            name: self.local_name.clone(),
            incarnation,
        };
        let _ = tokio::time::timeout(timeout, async {
            self.broadcast(msg).await;
            // let the departure datagrams drain before the caller tears the
            // socket down
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await;
        info!(name = %self.local_name, "left the cluster");
    }

    /// Stop the background loops. The socket closes when the engine drops.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    let plain = match self.sealer.open(&buf[..len]) {
                        Ok(plain) => plain,
                        Err(e) => {
                            trace!(%src, "dropping packet: {e}");
                            continue;
                        }
                    };
                    match bincode::deserialize::<GossipMessage>(&plain) {
                        Ok(msg) => self.handle_message(msg, src).await,
                        Err(e) => trace!(%src, "dropping undecodable message: {e}"),
                    }
                }
                Err(e) => {
                    warn!("failed to receive gossip packet: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.discover(from, src, incarnation).await;
                self.send_roster(src).await;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.touch(&from, incarnation);
                for member in members {
                    self.merge(member).await;
                }
            }

            GossipMessage::Join { member } => {
                info!(member = %member.name, addr = %member.addr, "node joining");
                self.merge(member).await;
                // answer with the full roster so the joiner converges in one
                // round trip
                self.send_roster(src).await;
            }

            GossipMessage::Alive { member } => {
                self.merge(member).await;
            }

            GossipMessage::Suspect { name, incarnation } => {
                self.handle_suspect(name, incarnation).await;
            }

            GossipMessage::Leave { name, incarnation } => {
                self.handle_leave(name, incarnation).await;
            }
        }
    }

    /// Refresh liveness bookkeeping for a directly heard-from member.
    fn touch(&self, name: &str, incarnation: u64) {
        if name == self.local_name {
            return;
        }
        if let Some(mut member) = self.members.get_mut(name) {
            member.last_seen = Some(Instant::now());
            if incarnation > member.incarnation {
                member.incarnation = incarnation;
            }
        }
    }

    /// A ping proves its sender is alive at `src`. First contact from an
    /// unknown name inserts it, so a peer that restarts with no prior state
    /// learns the cluster back from the probes still aimed at its address.
    async fn discover(&self, name: String, src: SocketAddr, incarnation: u64) {
        if name == self.local_name {
            return;
        }

        let event = match self.members.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                let member = entry.get_mut();
                member.last_seen = Some(Instant::now());
                if incarnation > member.incarnation {
                    member.incarnation = incarnation;
                }
                None
            }
            Entry::Vacant(entry) => {
                info!(member = %name, addr = %src, "node discovered by its ping");
                let member = entry
                    .insert(Member {
                        name,
                        addr: src,
                        meta: Vec::new(),
                        state: MemberState::Alive,
                        incarnation,
                        last_seen: Some(Instant::now()),
                    })
                    .clone();
                Some(MemberEvent {
                    member,
                    kind: EventKind::Joined,
                })
            }
        };

        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    async fn send_roster(&self, dest: SocketAddr) {
        // tombstones stay local; gossiping them would regrow reaped entries
        let members: Vec<Member> = self
            .members
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.value().clone())
            .collect();
        let msg = GossipMessage::Ack {
            from: self.local_name.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            members,
        };
        if let Err(e) = self.send_to(&msg, dest).await {
            debug!(%dest, "roster reply failed: {e}");
        }
    }

    /// Fold a gossiped member record into the local table, emitting an event
    /// when the usable view actually changed.
    async fn merge(&self, mut candidate: Member) {
        candidate.last_seen = Some(Instant::now());

        if candidate.name == self.local_name {
            self.maybe_refute(candidate).await;
            return;
        }

        let delegate = self.delegate.read().await.clone();

        // Table mutation happens under the entry guard, with no awaits; the
        // event is emitted after the guard is released.
        let event = match self.members.entry(candidate.name.clone()) {
            Entry::Vacant(entry) => {
                if !candidate.is_active() {
                    // an unknown dead or departed member is not worth a
                    // table entry, let alone re-gossiping
                    None
                } else {
                    let member = entry.insert(candidate).clone();
                    info!(member = %member.name, addr = %member.addr, "node joined");
                    Some(MemberEvent {
                        member,
                        kind: EventKind::Joined,
                    })
                }
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if candidate.addr != existing.addr {
                    // two claims for one name: consult the conflict policy
                    let outcome = match &delegate {
                        Some(delegate) => delegate.resolve_conflict(existing, &candidate),
                        None => default_winner(existing, &candidate),
                    };
                    match outcome {
                        ConflictOutcome::KeepCurrent => {
                            trace!(member = %existing.name, "kept current claim in name conflict");
                            None
                        }
                        ConflictOutcome::TakeCandidate => {
                            warn!(
                                member = %candidate.name,
                                old = %existing.addr,
                                new = %candidate.addr,
                                "name conflict resolved in favor of new claim"
                            );
                            *existing = candidate;
                            Some(MemberEvent {
                                member: existing.clone(),
                                kind: EventKind::Updated,
                            })
                        }
                    }
                } else if candidate.incarnation > existing.incarnation {
                    let was_active = existing.is_active();
                    let meta_changed = existing.meta != candidate.meta;
                    *existing = candidate;
                    if !was_active && existing.is_active() {
                        info!(member = %existing.name, "node rejoined");
                        Some(MemberEvent {
                            member: existing.clone(),
                            kind: EventKind::Joined,
                        })
                    } else if was_active && !existing.is_active() {
                        info!(member = %existing.name, "node left");
                        Some(MemberEvent {
                            member: existing.clone(),
                            kind: EventKind::Left,
                        })
                    } else if meta_changed {
                        info!(member = %existing.name, "node updated");
                        Some(MemberEvent {
                            member: existing.clone(),
                            kind: EventKind::Updated,
                        })
                    } else {
                        None
                    }
                } else if candidate.incarnation == existing.incarnation
                    && candidate.state == MemberState::Alive
                    && existing.state == MemberState::Suspect
                {
                    info!(member = %existing.name, "node refuted suspicion");
                    existing.state = MemberState::Alive;
                    existing.last_seen = Some(Instant::now());
                    None
                } else {
                    if candidate.state == MemberState::Alive && existing.is_active() {
                        existing.last_seen = Some(Instant::now());
                    }
                    None
                }
            }
        };

        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    /// Another node gossiped a claim about us. If the claim is stale or
    /// disputes our identity, reassert the local descriptor with a higher
    /// incarnation; all correct nodes will converge on it.
    async fn maybe_refute(&self, candidate: Member) {
        let disputed = candidate.addr != self.advertise
            || !matches!(candidate.state, MemberState::Alive);
        if !disputed {
            return;
        }

        self.incarnation
            .fetch_max(candidate.incarnation + 1, Ordering::SeqCst);
        let incarnation = self.incarnation.load(Ordering::SeqCst);

        let local = {
            match self.members.get_mut(&self.local_name) {
                Some(mut member) => {
                    member.incarnation = incarnation;
                    member.state = MemberState::Alive;
                    member.last_seen = Some(Instant::now());
                    member.clone()
                }
                None => return,
            }
        };

        info!(incarnation, "refuting stale claim about the local node");
        self.broadcast(GossipMessage::Alive { member: local }).await;
    }

    async fn handle_suspect(&self, name: String, incarnation: u64) {
        if name == self.local_name {
            let local = self.local_member();
            self.maybe_refute(Member {
                state: MemberState::Suspect,
                incarnation,
                ..local
            })
            .await;
            return;
        }

        if let Some(mut member) = self.members.get_mut(&name) {
            if incarnation >= member.incarnation && member.state == MemberState::Alive {
                info!(member = %name, "node suspected");
                member.state = MemberState::Suspect;
                member.incarnation = incarnation;
            }
        }
    }

    async fn handle_leave(&self, name: String, incarnation: u64) {
        if name == self.local_name {
            return;
        }

        let event = match self.members.get_mut(&name) {
            Some(mut member) if member.is_active() && incarnation >= member.incarnation => {
                info!(member = %name, "node left");
                member.state = MemberState::Left;
                member.incarnation = incarnation;
                // retention for the tombstone counts from the departure
                member.last_seen = Some(Instant::now());
                Some(MemberEvent {
                    member: member.clone(),
                    kind: EventKind::Left,
                })
            }
            _ => None,
        };

        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);

        loop {
            interval.tick().await;

            let peers: Vec<SocketAddr> = self
                .members
                .iter()
                .filter(|entry| entry.key() != &self.local_name && entry.value().is_active())
                .map(|entry| entry.value().addr)
                .collect();

            if peers.is_empty() {
                continue;
            }

            use rand::Rng;
            let target = peers[rand::thread_rng().gen_range(0..peers.len())];
            let msg = GossipMessage::Ping {
                from: self.local_name.clone(),
                incarnation: self.incarnation.load(Ordering::SeqCst),
            };
            if let Err(e) = self.send_to(&msg, target).await {
                debug!(%target, "probe failed: {e}");
            }
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut suspicions = Vec::new();
            let mut events = Vec::new();
            let mut reaped = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();
                if member.name == self.local_name {
                    continue;
                }
                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    MemberState::Alive => {
                        if elapsed > self.config.suspect_timeout {
                            warn!(member = %member.name, ?elapsed, "node suspected, no contact");
                            member.state = MemberState::Suspect;
                            suspicions.push(GossipMessage::Suspect {
                                name: member.name.clone(),
                                incarnation: member.incarnation,
                            });
                        }
                    }
                    MemberState::Suspect => {
                        if elapsed > self.config.dead_timeout {
                            warn!(member = %member.name, ?elapsed, "node declared dead");
                            member.state = MemberState::Dead;
                            events.push(MemberEvent {
                                member: member.clone(),
                                kind: EventKind::Left,
                            });
                        }
                    }
                    MemberState::Dead | MemberState::Left => {
                        // tombstones are kept briefly so a late duplicate
                        // Leave does not look like a fresh member, then
                        // dropped to keep the table and the roster bounded
                        if elapsed > self.config.reclaim_timeout {
                            reaped.push(member.name.clone());
                        }
                    }
                }
            }

            for name in reaped {
                debug!(member = %name, "reclaimed departed member entry");
                self.members.remove(&name);
            }
            for msg in suspicions {
                self.broadcast(msg).await;
            }
            for event in events {
                self.emit(event).await;
            }
        }
    }

    async fn broadcast(&self, msg: GossipMessage) {
        let peers: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| entry.key() != &self.local_name && entry.value().is_active())
            .map(|entry| entry.value().addr)
            .collect();

        for addr in peers {
            if let Err(e) = self.send_to(&msg, addr).await {
                debug!(%addr, "broadcast send failed: {e}");
            }
        }
    }

    async fn send_to(&self, msg: &GossipMessage, dest: SocketAddr) -> Result<(), GossipError> {
        let plain = bincode::serialize(msg)?;
        let packet = self.sealer.seal(&plain)?;
        self.socket.send_to(&packet, dest).await?;
        Ok(())
    }

    /// Forward a membership event to the registered sink.
    ///
    /// A full sink intentionally blocks the engine loop: the sink's buffer is
    /// sized by the bridge so that realistic churn bursts never fill it.
    async fn emit(&self, event: MemberEvent) {
        let tx = self.event_tx.read().await.clone();
        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                trace!("event sink closed, dropping membership event");
            }
        }
    }
}
