//! Reconciliation peer: owns the local tree, runs the serve and gossip
//! tasks, and hands recovered elements to the storage layer.
//!
//! The tree sits behind a `tokio` read/write lock.  Sessions take a read
//! guard once the partner's config has arrived and never wait for it: if a
//! flush holds or is queued for the write lock, the session is refused.  Queued
//! inserts and removes are applied by [`Peer::flush`], which takes the write
//! lock and publishes a [`MutationEvent`].
//!
//! A session that hits a local tree fault halts the whole peer: every task
//! is told to stop and the fault is kept for [`Peer::halted`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use num_bigint::BigUint;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock, RwLockReadGuard};
use tokio::task::{JoinHandle, JoinSet};
use tokio::{select, time};
use tracing::{debug, error, info, warn};

use super::matcher::{CidrError, IpMatcher};
use super::messages::{
    read_msg, read_raw_string, write_msgs, write_raw_strings, Config, ReconMsg, CONFIG_FAILED,
    CONFIG_PASSED,
};
use super::settings::{PeerMode, Settings};
use super::{gossip, serve};
use crate::bitstring::Bitstring;
use crate::error::{TreeError, WireError};
use crate::field::Zp;
use crate::ptree::{NodeKind, NodeStore, PrefixTree};

/// Reason given to partners while the tree is being mutated.
pub const BUSY_REASON: &str = "sync not available, currently mutating";

/// Inbound sessions served at once.
const MAX_INBOUND_SESSIONS: usize = 16;

/// Queued recoveries before sessions start refusing.
const RECOVER_QUEUE_LEN: usize = 4;

/// Failures of a single recon session or of the peer lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    /// Socket failure.
    Io(#[from] io::Error),
    #[error(transparent)]
    /// Framing or codec failure.
    Wire(#[from] WireError),
    #[error(transparent)]
    /// Local tree failure.
    Tree(#[from] TreeError),
    #[error("timed out waiting for partner")]
    /// Dial or read timeout.
    Timeout,
    #[error("{0}")]
    /// The local side is mutating or its recovery queue is full.
    Busy(&'static str),
    #[error("cannot peer: {0}")]
    /// The local side rejected the partner's config.
    Incompatible(String),
    #[error("remote rejected configuration: {0}")]
    /// The partner rejected our config or was busy.
    RemoteRejected(String),
    #[error("protocol error: {0}")]
    /// The partner sent something out of sequence.
    Protocol(String),
    #[error("remote error: {0}")]
    /// The partner reported an error.
    Remote(String),
    #[error("peer is shutting down")]
    /// Shutdown interrupted the session.
    Shutdown,
    #[error("invalid allow list entry: {0}")]
    /// Bad CIDR in the settings.
    Matcher(#[from] CidrError),
}

impl From<time::error::Elapsed> for PeerError {
    fn from(_: time::error::Elapsed) -> Self {
        PeerError::Timeout
    }
}

/// Elements recovered from one session, awaiting the storage layer.
///
/// The session that produced it waits until `done` fires or is dropped, so
/// the consumer controls how many recoveries are in flight.
#[derive(Debug)]
pub struct Recover {
    /// Address of the partner the elements came from.
    pub remote_addr: SocketAddr,
    /// The partner's advertised config.
    pub remote_config: Config,
    /// Elements the partner has and we lack.
    pub remote_elements: Vec<Zp>,
    /// HKP address configured for the partner, if it is listed by IP.
    pub partner_http_addr: Option<String>,
    /// Completion signal.
    pub done: oneshot::Sender<()>,
}

impl Recover {
    /// HKP address of the partner: its IP with the advertised HTTP port, or
    /// the configured address when the advertised port is out of range.
    pub fn hkp_addr(&self) -> Option<String> {
        match u16::try_from(self.remote_config.http_port) {
            Ok(port) if port != 0 => {
                Some(SocketAddr::new(self.remote_addr.ip(), port).to_string())
            }
            _ => self.partner_http_addr.clone(),
        }
    }

    /// Signals the producing session that the elements were handled.
    pub fn complete(self) {
        let _ = self.done.send(());
    }
}

/// Published after every flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationEvent {
    /// Elements added to the tree.
    pub inserted: usize,
    /// Elements removed from the tree.
    pub removed: usize,
}

/// Session counters.
#[derive(Debug, Default)]
pub struct PeerStats {
    sessions_started: AtomicU64,
    sessions_succeeded: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_busy: AtomicU64,
    elements_recovered: AtomicU64,
}

/// Point-in-time copy of [`PeerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerStatsSnapshot {
    /// Sessions begun, in either role.
    pub sessions_started: u64,
    /// Sessions that ran to completion.
    pub sessions_succeeded: u64,
    /// Sessions that ended with an error.
    pub sessions_failed: u64,
    /// Sessions refused because one side was busy.
    pub sessions_busy: u64,
    /// Elements handed to the recovery channel.
    pub elements_recovered: u64,
}

impl PeerStats {
    fn inc_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_succeeded(&self) {
        self.sessions_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_busy(&self) {
        self.sessions_busy.fetch_add(1, Ordering::Relaxed);
    }

    fn add_recovered(&self, n: usize) {
        self.elements_recovered
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_succeeded: self.sessions_succeeded.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_busy: self.sessions_busy.load(Ordering::Relaxed),
            elements_recovered: self.elements_recovered.load(Ordering::Relaxed),
        }
    }

    /// Counters in Prometheus text format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        format!(
            "# TYPE recon_sessions_started_total counter\nrecon_sessions_started_total {}\n\
# TYPE recon_sessions_succeeded_total counter\nrecon_sessions_succeeded_total {}\n\
# TYPE recon_sessions_failed_total counter\nrecon_sessions_failed_total {}\n\
# TYPE recon_sessions_busy_total counter\nrecon_sessions_busy_total {}\n\
# TYPE recon_elements_recovered_total counter\nrecon_elements_recovered_total {}\n",
            s.sessions_started,
            s.sessions_succeeded,
            s.sessions_failed,
            s.sessions_busy,
            s.elements_recovered,
        )
    }
}

#[derive(Default)]
struct Pending {
    insert: Vec<Zp>,
    remove: Vec<Zp>,
}

/// State shared by the peer handle and its tasks.
pub(crate) struct Shared<S: NodeStore> {
    pub(crate) settings: Settings,
    pub(crate) p: Arc<BigUint>,
    tree: RwLock<PrefixTree<S>>,
    pending: Mutex<Pending>,
    recover_tx: mpsc::Sender<Recover>,
    full: AtomicBool,
    mutations: broadcast::Sender<MutationEvent>,
    pub(crate) stats: PeerStats,
    shutdown: watch::Sender<bool>,
    fault: watch::Sender<Option<String>>,
}

impl<S: NodeStore> Shared<S> {
    /// A read guard for a new session, or `None` while mutating or while
    /// recoveries are backed up.
    pub(crate) fn try_acquire(&self) -> Option<RwLockReadGuard<'_, PrefixTree<S>>> {
        if self.full.load(Ordering::Acquire) {
            return None;
        }
        self.tree.try_read().ok()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when shutdown is requested.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Records a local tree fault and stops the peer.  Only the first fault
    /// is kept.
    fn halt(&self, role: &'static str, err: &TreeError) {
        error!(role, %err, "local tree fault, halting recon peer");
        self.fault.send_if_modified(|fault| {
            if fault.is_some() {
                return false;
            }
            *fault = Some(err.to_string());
            true
        });
        self.shutdown.send_replace(true);
    }

    /// Bounds `fut` by the read timeout and by shutdown.
    async fn bounded<T, E>(
        &self,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, PeerError>
    where
        PeerError: From<E>,
    {
        select! {
            out = time::timeout(self.settings.read_timeout(), fut) => Ok(out??),
            _ = self.stopped() => Err(PeerError::Shutdown),
        }
    }

    /// Reads one message, bounded by the read timeout and by shutdown.
    pub(crate) async fn read<R>(&self, r: &mut R) -> Result<ReconMsg, PeerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.bounded(read_msg(r, &self.p)).await
    }

    /// Exchanges configs and acknowledgements, then returns the partner's
    /// config with a read guard on the tree.  The guard is only taken once
    /// the partner's config has arrived; a busy tree rejects the partner.
    pub(crate) async fn handshake<R, W>(
        &self,
        r: &mut R,
        w: &mut W,
        role: &'static str,
        remote_addr: SocketAddr,
    ) -> Result<(Config, RwLockReadGuard<'_, PrefixTree<S>>), PeerError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let local = self.settings.config();
        write_msgs(w, &[ReconMsg::Config(local.clone())]).await?;
        let remote = match self.read(r).await? {
            ReconMsg::Config(config) => config,
            other => {
                return Err(PeerError::Protocol(format!(
                    "expected remote config, got {other}"
                )))
            }
        };
        debug!(role, addr = %remote_addr, remote = %ReconMsg::Config(remote.clone()), "remote config");

        let Some(guard) = self.try_acquire() else {
            reject(w, BUSY_REASON).await;
            return Err(PeerError::Busy(BUSY_REASON));
        };
        let mismatch = if remote.bit_quantum != local.bit_quantum {
            warn!(role, addr = %remote_addr, remote = remote.bit_quantum, local = local.bit_quantum, "mismatched bitquantum");
            Some("mismatched bitquantum")
        } else if remote.mbar != local.mbar {
            warn!(role, addr = %remote_addr, remote = remote.mbar, local = local.mbar, "mismatched mbar");
            Some("mismatched mbar")
        } else {
            None
        };
        if let Some(reason) = mismatch {
            drop(guard);
            reject(w, reason).await;
            return Err(PeerError::Incompatible(reason.to_string()));
        }

        write_raw_strings(w, &[CONFIG_PASSED]).await?;
        let status = self.bounded(read_raw_string(r)).await?;
        if status != CONFIG_PASSED {
            let reason = match self.bounded(read_raw_string(r)).await {
                Ok(reason) => reason,
                Err(err) => err.to_string(),
            };
            return Err(PeerError::RemoteRejected(reason));
        }
        Ok((remote, guard))
    }

    /// Hands recovered elements to the storage layer and waits until it is
    /// done with them.  A full channel marks the peer busy until the next
    /// flush.
    pub(crate) async fn deliver(
        &self,
        role: &'static str,
        remote_addr: SocketAddr,
        remote_config: Config,
        elements: Vec<Zp>,
    ) {
        if elements.is_empty() || self.is_stopping() {
            return;
        }
        let n = elements.len();
        let (done, wait) = oneshot::channel();
        let recover = Recover {
            remote_addr,
            remote_config,
            remote_elements: elements,
            partner_http_addr: self
                .settings
                .partner_http_addr(remote_addr.ip())
                .map(str::to_string),
            done,
        };
        match self.recover_tx.try_send(recover) {
            Ok(()) => {
                info!(role, addr = %remote_addr, elements = n, "recovering");
                select! {
                    _ = wait => info!(role, addr = %remote_addr, "recovery complete"),
                    _ = self.stopped() => {}
                }
                self.stats.add_recovered(n);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(role, addr = %remote_addr, elements = n, "recovery channel full");
                self.full.store(true, Ordering::Release);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(role, addr = %remote_addr, elements = n, "recovery channel closed");
            }
        }
    }

    fn queue(&self, insert: Vec<Zp>, remove: Vec<Zp>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert.extend(insert);
        pending.remove.extend(remove);
    }

    fn has_pending(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        !pending.insert.is_empty() || !pending.remove.is_empty()
    }

    async fn flush(&self) -> MutationEvent {
        let mut tree = self.tree.write().await;
        let Pending { insert, remove } = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        let mut event = MutationEvent::default();
        for z in &insert {
            match tree.insert(z) {
                Ok(()) => event.inserted += 1,
                Err(err) => warn!(element = %z, %err, "cannot insert into prefix tree"),
            }
        }
        for z in &remove {
            match tree.remove(z) {
                Ok(()) => event.removed += 1,
                Err(err) => warn!(element = %z, %err, "cannot remove from prefix tree"),
            }
        }
        self.full.store(false, Ordering::Release);
        drop(tree);
        if event.inserted + event.removed > 0 {
            debug!(inserted = event.inserted, removed = event.removed, "mutate");
        }
        let _ = self.mutations.send(event);
        event
    }

    /// Applies queued mutations if there are any.
    pub(crate) async fn flush_pending(&self) {
        if self.has_pending() {
            self.flush().await;
        }
    }
}

/// Tells the partner the handshake failed, giving up after a few seconds.
async fn reject<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, reason: &str) {
    let _ = time::timeout(
        Duration::from_secs(3),
        write_raw_strings(w, &[CONFIG_FAILED, reason]),
    )
    .await;
}

/// The local tree's view of one prefix: the node at that key, or the part
/// of an ancestor leaf that falls under it.
pub(crate) struct PrefixView {
    pub(crate) key: Bitstring,
    pub(crate) svalues: Vec<Zp>,
    pub(crate) size: usize,
    pub(crate) is_leaf: bool,
    elements: Option<Vec<Zp>>,
}

impl PrefixView {
    /// Looks up `prefix`; a missing tree node yields an empty view.
    pub(crate) fn lookup<S: NodeStore>(
        tree: &PrefixTree<S>,
        prefix: &Bitstring,
    ) -> Result<Self, TreeError> {
        let node = tree.node(prefix)?;
        if node.key() == prefix {
            return Ok(PrefixView {
                key: prefix.clone(),
                svalues: node.svalues().to_vec(),
                size: node.size(),
                is_leaf: node.is_leaf(),
                elements: None,
            });
        }
        let elements: Vec<Zp> = match node.kind() {
            NodeKind::Leaf(elements) => elements
                .iter()
                .filter(|z| prefix.is_prefix_of(&Bitstring::from_zp(z)))
                .cloned()
                .collect(),
            NodeKind::Internal => Vec::new(),
        };
        let mut svalues = vec![Zp::one(tree.modulus()); tree.points().len()];
        for z in &elements {
            for (s, point) in svalues.iter_mut().zip(tree.points()) {
                *s = &*s * &(point - z);
            }
        }
        Ok(PrefixView {
            key: prefix.clone(),
            svalues,
            size: elements.len(),
            is_leaf: true,
            elements: Some(elements),
        })
    }

    /// Every local element under the prefix.
    pub(crate) fn elements<S: NodeStore>(
        &self,
        tree: &PrefixTree<S>,
    ) -> Result<Vec<Zp>, TreeError> {
        match &self.elements {
            Some(elements) => Ok(elements.clone()),
            None => tree.elements(&tree.node(&self.key)?),
        }
    }
}

/// A reconciliation peer over a tree backed by `S`.
pub struct Peer<S: NodeStore + 'static> {
    shared: Arc<Shared<S>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: NodeStore + 'static> Peer<S> {
    /// Creates a stopped peer and the receiving end of its recovery channel.
    pub fn new(settings: Settings, tree: PrefixTree<S>) -> (Self, mpsc::Receiver<Recover>) {
        let (recover_tx, recover_rx) = mpsc::channel(RECOVER_QUEUE_LEN);
        let (mutations, _) = broadcast::channel(64);
        let shared = Shared {
            p: tree.modulus().clone(),
            settings,
            tree: RwLock::new(tree),
            pending: Mutex::new(Pending::default()),
            recover_tx,
            full: AtomicBool::new(false),
            mutations,
            stats: PeerStats::default(),
            shutdown: watch::Sender::new(false),
            fault: watch::Sender::new(None),
        };
        let peer = Peer {
            shared: Arc::new(shared),
            tasks: Mutex::new(Vec::new()),
        };
        (peer, recover_rx)
    }

    /// The peer's settings.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// The local tree.  Holding a read guard blocks flushes; holding the
    /// write guard makes partners see this peer as busy.
    pub fn tree(&self) -> &RwLock<PrefixTree<S>> {
        &self.shared.tree
    }

    /// Session counters.
    pub fn stats(&self) -> &PeerStats {
        &self.shared.stats
    }

    /// Queues elements for insertion at the next flush.
    pub fn insert(&self, zs: impl IntoIterator<Item = Zp>) {
        self.shared.queue(zs.into_iter().collect(), Vec::new());
    }

    /// Queues elements for removal at the next flush.
    pub fn remove(&self, zs: impl IntoIterator<Item = Zp>) {
        self.shared.queue(Vec::new(), zs.into_iter().collect());
    }

    /// Applies queued mutations under the tree write lock.
    pub async fn flush(&self) -> MutationEvent {
        self.shared.flush().await
    }

    /// The tree fault that halted the peer, if one has.
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.borrow().clone()
    }

    /// Resolves once a tree fault halts the peer, with its description.
    /// The peer's tasks are already stopping; call [`Peer::stop`] to wait
    /// for them.
    pub async fn halted(&self) -> String {
        let mut rx = self.shared.fault.subscribe();
        let fault = rx.wait_for(Option::is_some).await.ok().and_then(|f| f.clone());
        fault.unwrap_or_default()
    }

    /// Receives a [`MutationEvent`] after every flush.
    pub fn subscribe_mutations(&self) -> broadcast::Receiver<MutationEvent> {
        self.shared.mutations.subscribe()
    }

    /// Binds the recon listener (unless gossip only) and spawns the serve
    /// and gossip tasks for the configured mode.  Returns the bound address
    /// when serving.
    pub async fn start(&self) -> Result<Option<SocketAddr>, PeerError> {
        if self.shared.is_stopping() {
            return Err(PeerError::Shutdown);
        }
        let mode = self.shared.settings.mode;
        let mut tasks = Vec::new();
        let mut bound = None;
        if mode != PeerMode::GossipOnly {
            let listener = TcpListener::bind(&self.shared.settings.recon_addr).await?;
            let addr = listener.local_addr()?;
            let matcher = build_matcher(&self.shared.settings).await?;
            info!(evt = "listen", %addr, "recon serving");
            tasks.push(tokio::spawn(serve_loop(self.shared.clone(), listener, matcher)));
            bound = Some(addr);
        }
        if mode != PeerMode::ServeOnly {
            tasks.push(tokio::spawn(gossip_loop(self.shared.clone())));
        }
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
        Ok(bound)
    }

    /// Signals every task to stop, waits for them, then applies any
    /// queued mutations.
    pub async fn stop(&self) {
        self.shared.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!(%err, "peer task ended abnormally");
            }
        }
        self.shared.flush_pending().await;
        info!(evt = "stopped", "recon peer stopped");
    }

    /// Runs one gossip session against `addr` right away.
    pub async fn initiate_recon(&self, addr: &str) -> Result<(), PeerError> {
        run_gossip_session(&self.shared, addr).await
    }

    /// Serves one already-connected session.
    pub async fn accept<R, W>(
        &self,
        reader: R,
        writer: W,
        remote_addr: SocketAddr,
    ) -> Result<(), PeerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        run_serve_session(&self.shared, reader, writer, remote_addr).await
    }
}

async fn build_matcher(settings: &Settings) -> Result<IpMatcher, PeerError> {
    let mut matcher = IpMatcher::new();
    for cidr in &settings.allow_cidrs {
        matcher.allow_cidr(cidr)?;
    }
    for (name, partner) in &settings.partners {
        for addr in [&partner.http_addr, &partner.recon_addr] {
            if addr.is_empty() {
                continue;
            }
            match lookup_host(addr.as_str()).await {
                Ok(addrs) => matcher.allow_addrs(addrs),
                Err(err) => warn!(partner = %name, %addr, %err, "cannot resolve partner"),
            }
        }
    }
    Ok(matcher)
}

async fn run_serve_session<S, R, W>(
    shared: &Shared<S>,
    reader: R,
    mut writer: W,
    remote_addr: SocketAddr,
) -> Result<(), PeerError>
where
    S: NodeStore,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    if shared.is_stopping() {
        return Err(PeerError::Shutdown);
    }
    shared.stats.inc_started();
    let result = serve::accept(shared, reader, &mut writer, remote_addr).await;
    match &result {
        Ok(()) => shared.stats.inc_succeeded(),
        Err(PeerError::Busy(_)) => {
            shared.stats.inc_busy();
            debug!(role = serve::ROLE, addr = %remote_addr, "refused while busy");
        }
        Err(PeerError::Tree(err)) => {
            shared.stats.inc_failed();
            shared.halt(serve::ROLE, err);
        }
        Err(err) => {
            shared.stats.inc_failed();
            warn!(role = serve::ROLE, addr = %remote_addr, %err, "recon failed");
        }
    }
    shared.flush_pending().await;
    result
}

async fn run_gossip_session<S: NodeStore>(shared: &Shared<S>, addr: &str) -> Result<(), PeerError> {
    if shared.is_stopping() {
        return Err(PeerError::Shutdown);
    }
    if shared.try_acquire().is_none() {
        shared.stats.inc_busy();
        return Err(PeerError::Busy(BUSY_REASON));
    }
    shared.stats.inc_started();
    let result = gossip::initiate(shared, addr).await;
    match &result {
        Ok(()) => shared.stats.inc_succeeded(),
        Err(PeerError::Busy(_)) => {
            shared.stats.inc_busy();
            debug!(role = gossip::ROLE, %addr, "busy after handshake");
        }
        Err(PeerError::RemoteRejected(reason)) if reason == BUSY_REASON => {
            shared.stats.inc_busy();
            debug!(role = gossip::ROLE, %addr, "partner busy");
        }
        Err(PeerError::Tree(err)) => {
            shared.stats.inc_failed();
            shared.halt(gossip::ROLE, err);
        }
        Err(err) => {
            shared.stats.inc_failed();
            warn!(role = gossip::ROLE, %addr, %err, "recon failed");
        }
    }
    shared.flush_pending().await;
    result
}

async fn serve_loop<S: NodeStore + 'static>(
    shared: Arc<Shared<S>>,
    listener: TcpListener,
    matcher: IpMatcher,
) {
    let limiter = Arc::new(tokio::sync::Semaphore::new(MAX_INBOUND_SESSIONS));
    let mut sessions = JoinSet::new();
    loop {
        select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(role = serve::ROLE, %err, "accept failed");
                        continue;
                    }
                };
                if !matcher.matches(&remote_addr.ip()) {
                    warn!(role = serve::ROLE, addr = %remote_addr, "connection rejected");
                    continue;
                }
                let permit = match limiter.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(role = serve::ROLE, addr = %remote_addr, "too many inbound sessions");
                        continue;
                    }
                };
                info!(role = serve::ROLE, addr = %remote_addr, "accepted connection");
                let shared = shared.clone();
                sessions.spawn(async move {
                    let _permit = permit;
                    let (reader, writer) = stream.into_split();
                    let _ = run_serve_session(&shared, reader, writer, remote_addr).await;
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shared.stopped() => break,
        }
    }
    while sessions.join_next().await.is_some() {}
}

async fn gossip_loop<S: NodeStore + 'static>(shared: Arc<Shared<S>>) {
    loop {
        let delay = shared
            .settings
            .skewed_gossip_interval(&mut rand::thread_rng());
        debug!(role = gossip::ROLE, delay_ms = delay.as_millis() as u64, "waiting for next gossip attempt");
        select! {
            _ = time::sleep(delay) => {}
            _ = shared.stopped() => return,
        }
        let partner = shared
            .settings
            .random_partner(&mut rand::thread_rng())
            .map(|(name, p)| (name.to_string(), p.recon_addr.clone()));
        let Some((name, addr)) = partner else {
            debug!(role = gossip::ROLE, "no partners to gossip with");
            continue;
        };
        debug!(role = gossip::ROLE, partner = %name, %addr, "initiating recon");
        let _ = run_gossip_session(&shared, &addr).await;
    }
}

/// Dials `addr` within the connect timeout.
pub(crate) async fn dial(settings: &Settings, addr: &str) -> Result<TcpStream, PeerError> {
    let stream = time::timeout(settings.conn_timeout(), TcpStream::connect(addr)).await??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::p_sks;
    use crate::net::settings::Partner;
    use crate::ptree::{MemStore, PTreeConfig};
    use crate::zset::ZSet;

    fn zs(values: impl IntoIterator<Item = i64>) -> Vec<Zp> {
        let p = p_sks();
        values.into_iter().map(|v| Zp::from_i64(&p, v)).collect()
    }

    fn test_settings(mode: PeerMode) -> Settings {
        Settings {
            recon_addr: "127.0.0.1:0".into(),
            mode,
            read_timeout_secs: 5,
            conn_timeout_secs: 5,
            gossip_interval_ms: 3_600_000,
            ..Settings::default()
        }
    }

    fn tree_with(config: PTreeConfig, elements: &[Zp]) -> PrefixTree<MemStore> {
        let mut tree = PrefixTree::in_memory(config).unwrap();
        for z in elements {
            tree.insert(z).unwrap();
        }
        tree
    }

    /// Spawns a storage stand-in that inserts every recovery and flushes.
    fn consume(peer: Arc<Peer<MemStore>>, mut rx: mpsc::Receiver<Recover>) {
        tokio::spawn(async move {
            while let Some(recover) = rx.recv().await {
                peer.insert(recover.remote_elements.iter().cloned());
                peer.flush().await;
                recover.complete();
            }
        });
    }

    async fn members(peer: &Peer<MemStore>) -> ZSet {
        let tree = peer.tree().read().await;
        tree.elements(&tree.root().unwrap())
            .unwrap()
            .into_iter()
            .collect()
    }

    async fn converge(a_elements: Vec<Zp>, b_elements: Vec<Zp>) -> (ZSet, ZSet, ZSet) {
        let config = PTreeConfig::default();
        let expect: ZSet = a_elements.iter().chain(&b_elements).cloned().collect();

        let (a, a_rx) = Peer::new(
            test_settings(PeerMode::GossipOnly),
            tree_with(config, &a_elements),
        );
        let (b, b_rx) = Peer::new(
            test_settings(PeerMode::ServeOnly),
            tree_with(config, &b_elements),
        );
        let (a, b) = (Arc::new(a), Arc::new(b));
        consume(a.clone(), a_rx);
        consume(b.clone(), b_rx);
        let mut b_events = b.subscribe_mutations();

        let addr = b.start().await.unwrap().unwrap();
        a.initiate_recon(&addr.to_string()).await.unwrap();
        loop {
            let event = time::timeout(Duration::from_secs(5), b_events.recv())
                .await
                .unwrap()
                .unwrap();
            if event.inserted > 0 {
                break;
            }
        }
        b.stop().await;
        (members(&a).await, members(&b).await, expect)
    }

    #[tokio::test]
    async fn test_two_peers_exchange_missing_elements() {
        let (a, b, expect) =
            converge(zs([65537, 65539]), zs([65537, 65541])).await;
        assert_eq!(a, expect);
        assert_eq!(b, expect);
    }

    #[tokio::test]
    async fn test_poly_sync_descends_past_low_mbar() {
        let shared: Vec<i64> = (1..=200).map(|i| i * 65537).collect();
        let mut a = shared.clone();
        a.extend([7_000_003, 7_000_019, 7_000_027, 7_000_039]);
        let mut b = shared;
        b.extend([9_000_011, 9_000_013, 9_000_041]);
        let (a, b, expect) = converge(zs(a), zs(b)).await;
        assert_eq!(expect.len(), 207);
        assert_eq!(a, expect);
        assert_eq!(b, expect);
    }

    #[tokio::test]
    async fn test_mismatched_bit_quantum_is_rejected() {
        let mut b_settings = test_settings(PeerMode::ServeOnly);
        b_settings.ptree.bit_quantum = 3;
        let (a, _a_rx) = Peer::new(
            test_settings(PeerMode::GossipOnly),
            tree_with(PTreeConfig::default(), &[]),
        );
        let (b, _b_rx) = Peer::new(b_settings.clone(), tree_with(b_settings.ptree, &[]));
        let addr = b.start().await.unwrap().unwrap();
        let err = a.initiate_recon(&addr.to_string()).await.unwrap_err();
        assert!(
            matches!(&err, PeerError::Incompatible(reason) if reason == "mismatched bitquantum"),
            "{err}"
        );
        assert_eq!(a.stats().snapshot().sessions_failed, 1);
        b.stop().await;
    }

    #[tokio::test]
    async fn test_busy_server_refuses_session() {
        let config = PTreeConfig::default();
        let (a, _a_rx) = Peer::new(test_settings(PeerMode::GossipOnly), tree_with(config, &zs([65537])));
        let (b, _b_rx) = Peer::new(test_settings(PeerMode::ServeOnly), tree_with(config, &[]));
        let addr = b.start().await.unwrap().unwrap();
        {
            let _mutating = b.tree().write().await;
            let err = a.initiate_recon(&addr.to_string()).await.unwrap_err();
            assert!(
                matches!(&err, PeerError::RemoteRejected(reason) if reason == BUSY_REASON),
                "{err}"
            );
        }
        assert_eq!(a.stats().snapshot().sessions_busy, 1);
        b.stop().await;
        assert!(members(&b).await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_applies_queued_mutations() {
        let (peer, _rx) = Peer::new(
            test_settings(PeerMode::GossipOnly),
            tree_with(PTreeConfig::default(), &zs([65537])),
        );
        let mut events = peer.subscribe_mutations();
        peer.insert(zs([65539, 65541]));
        peer.remove(zs([65537, 70001]));
        let event = peer.flush().await;
        assert_eq!(event, MutationEvent { inserted: 2, removed: 1 });
        assert_eq!(events.recv().await.unwrap(), event);
        let expect: ZSet = zs([65539, 65541]).into_iter().collect();
        assert_eq!(members(&peer).await, expect);
    }

    #[tokio::test]
    async fn test_start_and_stop_both_modes() {
        let (peer, _rx) = Peer::new(
            test_settings(PeerMode::Both),
            tree_with(PTreeConfig::default(), &[]),
        );
        assert!(peer.start().await.unwrap().is_some());
        time::timeout(Duration::from_secs(5), peer.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_root_halts_serving_peer() {
        let config = PTreeConfig::default();
        let (a, _a_rx) = Peer::new(test_settings(PeerMode::GossipOnly), tree_with(config, &zs([65537])));
        let mut broken = tree_with(config, &zs([65539]));
        broken.drop_tree().unwrap();
        let (b, _b_rx) = Peer::new(test_settings(PeerMode::ServeOnly), broken);
        let addr = b.start().await.unwrap().unwrap();

        let err = a.initiate_recon(&addr.to_string()).await.unwrap_err();
        assert!(
            matches!(&err, PeerError::Remote(text) if text.contains("node not found")),
            "{err}"
        );
        let fault = time::timeout(Duration::from_secs(5), b.halted())
            .await
            .unwrap();
        assert!(fault.contains("node not found"), "{fault}");
        assert_eq!(b.fault(), Some(fault));
        time::timeout(Duration::from_secs(5), b.stop())
            .await
            .unwrap();
        assert!(matches!(b.start().await, Err(PeerError::Shutdown)));
        assert_eq!(a.fault(), None);
        assert_eq!(a.stats().snapshot().sessions_failed, 1);
    }

    #[tokio::test]
    async fn test_missing_root_halts_gossiping_peer() {
        let config = PTreeConfig::default();
        let mut broken = tree_with(config, &zs([65537]));
        broken.drop_tree().unwrap();
        let (a, _a_rx) = Peer::new(test_settings(PeerMode::Both), broken);
        let (b, _b_rx) = Peer::new(test_settings(PeerMode::ServeOnly), tree_with(config, &zs([65539])));
        a.start().await.unwrap();
        let addr = b.start().await.unwrap().unwrap();

        let err = a.initiate_recon(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, PeerError::Tree(TreeError::NodeNotFound(_))), "{err}");
        assert!(a.fault().is_some());
        time::timeout(Duration::from_secs(5), a.stop())
            .await
            .unwrap();
        assert!(matches!(
            a.initiate_recon(&addr.to_string()).await,
            Err(PeerError::Shutdown)
        ));
        b.stop().await;
        assert_eq!(b.fault(), None);
    }

    #[tokio::test]
    async fn test_stop_interrupts_session_with_silent_partner() {
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = test_settings(PeerMode::GossipOnly);
        settings.read_timeout_secs = 60;
        settings.gossip_interval_ms = 20;
        settings.partners.insert(
            "silent".into(),
            Partner {
                recon_addr: silent.local_addr().unwrap().to_string(),
                ..Partner::default()
            },
        );
        let (peer, _rx) = Peer::new(settings, tree_with(PTreeConfig::default(), &zs([65537])));
        peer.start().await.unwrap();
        let (_conn, _) = time::timeout(Duration::from_secs(5), silent.accept())
            .await
            .unwrap()
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.stats().snapshot().sessions_started, 1);

        time::timeout(Duration::from_secs(5), peer.stop())
            .await
            .unwrap();
        assert_eq!(peer.stats().snapshot().sessions_failed, 1);
    }

    #[tokio::test]
    async fn test_silent_client_blocks_neither_flush_nor_stop() {
        let mut settings = test_settings(PeerMode::ServeOnly);
        settings.read_timeout_secs = 60;
        let (peer, _rx) = Peer::new(settings, tree_with(PTreeConfig::default(), &[]));
        let addr = peer.start().await.unwrap().unwrap();
        let _conn = TcpStream::connect(addr).await.unwrap();
        time::timeout(Duration::from_secs(5), async {
            while peer.stats().snapshot().sessions_started == 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        peer.insert(zs([65537]));
        let event = time::timeout(Duration::from_secs(5), peer.flush())
            .await
            .unwrap();
        assert_eq!(event.inserted, 1);
        time::timeout(Duration::from_secs(5), peer.stop())
            .await
            .unwrap();
    }

    #[test]
    fn test_hkp_addr_falls_back_to_configured_partner() {
        let (done, _wait) = oneshot::channel();
        let mut recover = Recover {
            remote_addr: "10.0.0.1:11370".parse().unwrap(),
            remote_config: Config {
                http_port: 11371,
                ..Settings::default().config()
            },
            remote_elements: Vec::new(),
            partner_http_addr: Some("keys.a.example:11371".into()),
            done,
        };
        assert_eq!(recover.hkp_addr().as_deref(), Some("10.0.0.1:11371"));
        recover.remote_config.http_port = 65_536 + 11_371;
        assert_eq!(recover.hkp_addr().as_deref(), Some("keys.a.example:11371"));
        recover.partner_http_addr = None;
        assert_eq!(recover.hkp_addr(), None);
    }

    #[test]
    fn test_prefix_view_filters_ancestor_leaf() {
        let elements = zs((1..=20).map(|i| i * 65537));
        let tree = tree_with(PTreeConfig::default(), &elements);
        let root = tree.root().unwrap();
        assert!(root.is_leaf());

        let z = &elements[3];
        let prefix = Bitstring::from_zp(z).prefix(4);
        let view = PrefixView::lookup(&tree, &prefix).unwrap();
        let under: Vec<Zp> = elements
            .iter()
            .filter(|e| prefix.is_prefix_of(&Bitstring::from_zp(e)))
            .cloned()
            .collect();
        assert!(view.is_leaf);
        assert_eq!(view.size, under.len());
        assert_eq!(view.elements(&tree).unwrap(), under);

        let only = tree_with(PTreeConfig::default(), &under).root().unwrap();
        assert_eq!(view.svalues, only.svalues());

        let whole = PrefixView::lookup(&tree, root.key()).unwrap();
        assert_eq!(whole.svalues, root.svalues());
    }

    #[test]
    fn test_stats_render() {
        let stats = PeerStats::default();
        stats.inc_started();
        stats.add_recovered(12);
        let text = stats.render();
        assert!(text.contains("recon_sessions_started_total 1"));
        assert!(text.contains("recon_elements_recovered_total 12"));
    }
}
