//! Responder side of a recon session.
//!
//! The responder walks its own tree top-down.  Each visited node becomes a
//! request (sample values, or the full element list for small nodes) and a
//! matching entry on the bottom queue.  Requests are written in batches
//! terminated by `Flush`; the initiator answers them in order, so every reply
//! pairs with the oldest outstanding bottom entry.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::{select, time};
use tracing::{debug, info, trace};

use super::messages::{read_msg, write_msgs, ReconMsg};
use super::peer::{PeerError, Shared};
use crate::error::WireError;
use crate::ptree::{Node, NodeStore, PrefixTree};
use crate::zset::ZSet;

pub(crate) const ROLE: &str = "serve";

/// Children are dropped rather than queued beyond this many requests.
const MAX_REQUEST_QUEUE_LEN: usize = 60_000;

type Reply = Result<ReconMsg, WireError>;

enum Bottom {
    Request(Node),
    FlushEnded,
}

struct Responder<'a, S: NodeStore, W: ?Sized> {
    shared: &'a Shared<S>,
    tree: &'a PrefixTree<S>,
    w: &'a mut W,
    remote_addr: SocketAddr,
    requests: VecDeque<Node>,
    bottoms: VecDeque<Bottom>,
    outgoing: Vec<ReconMsg>,
    flushing: bool,
    recovered: ZSet,
}

/// Runs an inbound session: handshake, tree walk, then delivery of the
/// recovered elements.
pub(crate) async fn accept<S, R, W>(
    shared: &Shared<S>,
    mut reader: R,
    w: &mut W,
    remote_addr: SocketAddr,
) -> Result<(), PeerError>
where
    S: NodeStore,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (remote_config, tree) = shared.handshake(&mut reader, w, ROLE, remote_addr).await?;
    info!(role = ROLE, addr = %remote_addr, "recon session started");

    let (tx, mut replies) = mpsc::channel::<Reply>(shared.settings.max_outstanding_recon_requests + 1);
    let p = shared.p.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            let reply = read_msg(&mut reader, &p).await;
            let failed = reply.is_err();
            if tx.send(reply).await.is_err() || failed {
                break;
            }
        }
    });

    let mut responder = Responder {
        shared,
        tree: &tree,
        w,
        remote_addr,
        requests: VecDeque::new(),
        bottoms: VecDeque::new(),
        outgoing: Vec::new(),
        flushing: false,
        recovered: ZSet::new(),
    };
    let mut result = match tree.root() {
        Ok(root) => {
            responder.requests.push_back(root);
            responder.run(&mut replies).await
        }
        Err(err) => Err(err.into()),
    };
    reader_task.abort();
    match &result {
        Ok(()) => responder.outgoing.push(ReconMsg::Done),
        Err(err) => {
            debug!(role = ROLE, addr = %remote_addr, %err, "aborting recon");
            responder.outgoing.push(ReconMsg::Error(err.to_string()));
        }
    }
    let outgoing = std::mem::take(&mut responder.outgoing);
    if let Err(err) = write_msgs(responder.w, &outgoing).await {
        if result.is_ok() {
            result = Err(err.into());
        }
    }
    let recovered = std::mem::take(&mut responder.recovered).items();
    drop(tree);

    info!(role = ROLE, addr = %remote_addr, recovered = recovered.len(), ok = result.is_ok(), "recon session finished");
    shared
        .deliver(ROLE, remote_addr, remote_config, recovered)
        .await;
    result
}

impl<'a, S: NodeStore, W: AsyncWrite + Unpin + ?Sized> Responder<'a, S, W> {
    async fn run(&mut self, replies: &mut mpsc::Receiver<Reply>) -> Result<(), PeerError> {
        let max_outstanding = self.shared.settings.max_outstanding_recon_requests;
        while !(self.requests.is_empty() && self.bottoms.is_empty()) {
            if self.shared.is_stopping() {
                return Err(PeerError::Shutdown);
            }
            match self.bottoms.front() {
                None => self.send_next_request()?,
                Some(Bottom::FlushEnded) => {
                    self.bottoms.pop_front();
                    self.flushing = false;
                }
                Some(Bottom::Request(_)) => match replies.try_recv() {
                    Ok(reply) => self.handle_reply(reply?)?,
                    Err(TryRecvError::Empty) => {
                        if self.bottoms.len() > max_outstanding || self.requests.is_empty() {
                            if !self.flushing {
                                self.flush_queue().await?;
                            } else {
                                let reply = self.wait_reply(replies).await?;
                                self.handle_reply(reply)?;
                            }
                        } else {
                            self.send_next_request()?;
                        }
                    }
                    Err(TryRecvError::Disconnected) => {
                        return Err(PeerError::Protocol("connection closed".into()))
                    }
                },
            }
        }
        Ok(())
    }

    async fn wait_reply(&self, replies: &mut mpsc::Receiver<Reply>) -> Result<ReconMsg, PeerError> {
        select! {
            reply = time::timeout(self.shared.settings.read_timeout(), replies.recv()) => match reply? {
                Some(reply) => Ok(reply?),
                None => Err(PeerError::Protocol("connection closed".into())),
            },
            _ = self.shared.stopped() => Err(PeerError::Shutdown),
        }
    }

    fn send_next_request(&mut self) -> Result<(), PeerError> {
        let Some(node) = self.requests.pop_front() else {
            return Ok(());
        };
        let msg = if node.is_leaf() || node.size() < self.tree.config().mbar {
            ReconMsg::ReconRqstFull {
                prefix: node.key().clone(),
                elements: self.tree.elements(&node)?.into_iter().collect(),
            }
        } else {
            ReconMsg::ReconRqstPoly {
                prefix: node.key().clone(),
                size: node.size(),
                samples: node.svalues().to_vec(),
            }
        };
        trace!(role = ROLE, addr = %self.remote_addr, msg = %msg, "queue request");
        self.outgoing.push(msg);
        self.bottoms.push_back(Bottom::Request(node));
        Ok(())
    }

    async fn flush_queue(&mut self) -> Result<(), PeerError> {
        self.outgoing.push(ReconMsg::Flush);
        write_msgs(self.w, &self.outgoing).await?;
        self.outgoing.clear();
        self.bottoms.push_back(Bottom::FlushEnded);
        self.flushing = true;
        Ok(())
    }

    fn handle_reply(&mut self, reply: ReconMsg) -> Result<(), PeerError> {
        let Some(Bottom::Request(node)) = self.bottoms.pop_front() else {
            return Err(PeerError::Protocol(format!("reply {reply} without a request")));
        };
        trace!(role = ROLE, addr = %self.remote_addr, node = %node.key(), msg = %reply, "reply");
        match reply {
            ReconMsg::SyncFail => {
                if node.is_leaf() {
                    return Err(PeerError::Protocol("sync failure at leaf node".into()));
                }
                for (i, child) in self.tree.children(&node)?.into_iter().enumerate() {
                    if i == 0 {
                        self.requests.push_back(child);
                    } else if self.requests.len() < MAX_REQUEST_QUEUE_LEN {
                        self.requests.push_front(child);
                    }
                }
            }
            ReconMsg::Elements(elements) => self.recovered.add_all(&elements),
            ReconMsg::FullElements(remote) => {
                let local: ZSet = self.tree.elements(&node)?.into_iter().collect();
                let local_needs = remote.difference(&local);
                let remote_needs = local.difference(&remote);
                debug!(
                    role = ROLE,
                    addr = %self.remote_addr,
                    node = %node.key(),
                    local_needs = local_needs.len(),
                    remote_needs = remote_needs.len(),
                    "full elements"
                );
                self.outgoing.push(ReconMsg::Elements(remote_needs));
                self.recovered.add_all(&local_needs);
            }
            ReconMsg::Error(text) => return Err(PeerError::Remote(text)),
            ReconMsg::DbRqst(_) | ReconMsg::DbRepl(_) => {
                return Err(WireError::Unsupported("database messages").into())
            }
            other => {
                return Err(PeerError::Protocol(format!("unexpected message {other}")))
            }
        }
        Ok(())
    }
}
