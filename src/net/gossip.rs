//! Initiator side of a recon session.
//!
//! The initiator answers the responder's requests against its own tree.
//! Replies are buffered and written when the responder sends `Flush`.  The
//! session ends on `Done`, on an error, or once enough elements have been
//! recovered.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::messages::{write_msgs, ReconMsg};
use super::peer::{dial, PeerError, PrefixView, Shared};
use crate::bitstring::Bitstring;
use crate::error::{ReconError, TreeError, WireError};
use crate::field::Zp;
use crate::ptree::{NodeStore, PrefixTree};
use crate::reconcile::reconcile;
use crate::zset::ZSet;

pub(crate) const ROLE: &str = "gossip";

/// What the initiator sends back for one request, and what it learned.
struct Step {
    reply: ReconMsg,
    recovered: ZSet,
}

impl Step {
    fn reply(reply: ReconMsg) -> Self {
        Step {
            reply,
            recovered: ZSet::new(),
        }
    }
}

/// Dials `addr`, runs a session against the tree, releases the tree, then
/// delivers what was recovered.
pub(crate) async fn initiate<S: NodeStore>(shared: &Shared<S>, addr: &str) -> Result<(), PeerError> {
    let stream = dial(&shared.settings, addr).await?;
    let remote_addr = stream.peer_addr()?;
    let (mut r, mut w) = stream.into_split();
    let (remote_config, tree) = shared.handshake(&mut r, &mut w, ROLE, remote_addr).await?;
    info!(role = ROLE, addr = %remote_addr, "recon session started");

    let mut recovered = ZSet::new();
    let result = recon(shared, &tree, &mut r, &mut w, remote_addr, &mut recovered).await;
    drop(tree);

    info!(role = ROLE, addr = %remote_addr, recovered = recovered.len(), ok = result.is_ok(), "recon session finished");
    shared
        .deliver(ROLE, remote_addr, remote_config, recovered.items())
        .await;
    result
}

async fn recon<S, R, W>(
    shared: &Shared<S>,
    tree: &PrefixTree<S>,
    r: &mut R,
    w: &mut W,
    remote_addr: SocketAddr,
    recovered: &mut ZSet,
) -> Result<(), PeerError>
where
    S: NodeStore,
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut pending = Vec::new();
    loop {
        if recovered.len() >= shared.settings.max_recover_size {
            info!(role = ROLE, addr = %remote_addr, "recovery limit reached");
            return Ok(());
        }
        let step = match shared.read(r).await? {
            ReconMsg::ReconRqstPoly {
                prefix,
                size,
                samples,
            } => handle_poly(tree, &prefix, size, &samples),
            ReconMsg::ReconRqstFull { prefix, elements } => handle_full(tree, &prefix, &elements),
            ReconMsg::Elements(elements) => {
                recovered.add_all(&elements);
                continue;
            }
            ReconMsg::Flush => {
                write_msgs(w, &pending).await?;
                pending.clear();
                continue;
            }
            ReconMsg::Done => return Ok(()),
            ReconMsg::Error(text) => return Err(PeerError::Remote(text)),
            other => Err(match other {
                ReconMsg::DbRqst(_) | ReconMsg::DbRepl(_) => {
                    WireError::Unsupported("database messages").into()
                }
                other => PeerError::Protocol(format!("unexpected message {other}")),
            }),
        };
        match step {
            Ok(step) => {
                recovered.add_all(&step.recovered);
                pending.push(step.reply);
            }
            Err(err) => {
                warn!(role = ROLE, addr = %remote_addr, %err, "aborting recon");
                let _ = write_msgs(w, &[ReconMsg::Error(err.to_string())]).await;
                return Err(err);
            }
        }
    }
}

/// Request prefixes can be no longer than an element key.
fn check_prefix<S: NodeStore>(tree: &PrefixTree<S>, prefix: &Bitstring) -> Result<(), PeerError> {
    let key_bits = tree.modulus().bits() as usize;
    if prefix.len() > key_bits {
        return Err(PeerError::Protocol(format!(
            "prefix of {} bits exceeds {key_bits}-bit keys",
            prefix.len()
        )));
    }
    Ok(())
}

fn handle_poly<S: NodeStore>(
    tree: &PrefixTree<S>,
    prefix: &Bitstring,
    size: usize,
    samples: &[Zp],
) -> Result<Step, PeerError> {
    check_prefix(tree, prefix)?;
    let view = PrefixView::lookup(tree, prefix)?;
    if samples.len() != view.svalues.len() {
        return Err(PeerError::Protocol(format!(
            "expected {} samples, got {}",
            view.svalues.len(),
            samples.len()
        )));
    }
    if size == view.size && samples == view.svalues.as_slice() {
        return Ok(Step::reply(ReconMsg::Elements(ZSet::new())));
    }
    let values = samples
        .iter()
        .zip(&view.svalues)
        .map(|(remote, local)| remote.div(local))
        .collect::<Result<Vec<_>, _>>()
        .map_err(TreeError::from)?;
    let deg_diff = size as i64 - view.size as i64;
    match reconcile(&values, tree.points(), deg_diff) {
        Ok((remote_only, local_only)) => Ok(Step {
            reply: ReconMsg::Elements(local_only),
            recovered: remote_only,
        }),
        Err(ReconError::LowMBar) => {
            let config = tree.config();
            if view.is_leaf || view.size < config.thresh_mult * config.mbar {
                let local = view.elements(tree)?.into_iter().collect();
                Ok(Step::reply(ReconMsg::FullElements(local)))
            } else {
                Ok(Step::reply(ReconMsg::SyncFail))
            }
        }
        Err(err) => {
            debug!(role = ROLE, node = %prefix, %err, "reconcile failed");
            Ok(Step::reply(ReconMsg::SyncFail))
        }
    }
}

fn handle_full<S: NodeStore>(
    tree: &PrefixTree<S>,
    prefix: &Bitstring,
    remote: &ZSet,
) -> Result<Step, PeerError> {
    check_prefix(tree, prefix)?;
    let view = PrefixView::lookup(tree, prefix)?;
    let local: ZSet = view.elements(tree)?.into_iter().collect();
    let local_needs = remote.difference(&local);
    let remote_needs = local.difference(remote);
    debug!(
        role = ROLE,
        node = %prefix,
        local_needs = local_needs.len(),
        remote_needs = remote_needs.len(),
        "full request"
    );
    Ok(Step {
        reply: ReconMsg::Elements(remote_needs),
        recovered: local_needs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptree::{MemStore, PTreeConfig};

    fn tree() -> PrefixTree<MemStore> {
        let mut tree = PrefixTree::in_memory(PTreeConfig::default()).unwrap();
        let p = tree.modulus().clone();
        for v in [65537, 65539, 65541] {
            tree.insert(&Zp::from_i64(&p, v)).unwrap();
        }
        tree
    }

    #[test]
    fn test_overlong_prefix_is_refused_before_lookup() {
        let tree = tree();
        let samples = tree.root().unwrap().svalues().to_vec();
        let prefix = Bitstring::new(1 << 20);
        let err = handle_poly(&tree, &prefix, 3, &samples).err().unwrap();
        assert!(matches!(err, PeerError::Protocol(_)), "{err}");
        let err = handle_full(&tree, &prefix, &ZSet::new()).err().unwrap();
        assert!(matches!(err, PeerError::Protocol(_)), "{err}");
    }

    #[test]
    fn test_full_length_prefix_is_answered() {
        let tree = tree();
        let z = Zp::from_i64(tree.modulus(), 65539);
        let prefix = Bitstring::from_zp(&z);
        let step = handle_full(&tree, &prefix, &ZSet::new()).unwrap();
        let expect: ZSet = [z].into_iter().collect();
        assert_eq!(step.reply, ReconMsg::Elements(expect));
        assert!(step.recovered.is_empty());
    }

    #[test]
    fn test_equal_samples_short_circuit() {
        let tree = tree();
        let root = tree.root().unwrap();
        let step = handle_poly(&tree, root.key(), root.size(), root.svalues()).unwrap();
        assert_eq!(step.reply, ReconMsg::Elements(ZSet::new()));
    }
}
