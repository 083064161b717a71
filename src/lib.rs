#![deny(missing_docs)]

//! # keyrecon
//!
//! **keyrecon** reconciles large sets of key digests between keyservers
//! using the SKS recon protocol.  Two peers holding nearly identical sets
//! find their symmetric difference while exchanging data proportional to the
//! difference rather than to the sets.
//!
//! ## Layers
//!
//! * **Field and algebra**: [`Zp`] elements over the SKS prime, [`Poly`]
//!   polynomials and [`Matrix`] reduction.
//! * **Reconciliation**: [`reconcile::reconcile`] turns sample ratios into
//!   the two one-sided differences by rational interpolation and
//!   factorization.
//! * **Prefix tree**: [`PrefixTree`] partitions elements by the bits of
//!   their value and keeps per-node sample aggregates, persisted through a
//!   [`NodeStore`] (`redb` or in memory).
//! * **Recon peer** (feature `net`): [`net::Peer`] gossips with partners over
//!   TCP, walks down to the nodes that differ, and hands recovered elements
//!   to the [`storage`] layer.
//!
//! ## Usage
//!
//! ```rust
//! use keyrecon::{p_sks, reconcile::reconcile, zpoints, PTreeConfig, PrefixTree, Zp};
//!
//! let mut tree = PrefixTree::in_memory(PTreeConfig::default()).unwrap();
//! let p = p_sks();
//! for v in [65537, 65539] {
//!     tree.insert(&Zp::from_i64(&p, v)).unwrap();
//! }
//! assert_eq!(tree.len().unwrap(), 2);
//!
//! // Sample ratios of {1, 2, 3} against {1, 2} reveal the missing 3.
//! let points = zpoints(&p, 4);
//! let values: Vec<Zp> = points
//!     .iter()
//!     .map(|x| {
//!         let remote = &(&(x - &Zp::from_i64(&p, 10)) * &(x - &Zp::from_i64(&p, 20)))
//!             * &(x - &Zp::from_i64(&p, 30));
//!         let local = &(x - &Zp::from_i64(&p, 10)) * &(x - &Zp::from_i64(&p, 20));
//!         remote.div(&local).unwrap()
//!     })
//!     .collect();
//! let (remote_only, local_only) = reconcile(&values, &points, 1).unwrap();
//! assert!(remote_only.contains(&Zp::from_i64(&p, 30)));
//! assert!(local_only.is_empty());
//! ```

pub mod bitstring;
pub mod error;
pub mod field;
pub mod matrix;
#[cfg(feature = "net")]
pub mod net;
pub mod poly;
pub mod ptree;
pub mod reconcile;
#[cfg(feature = "net")]
pub mod storage;
pub mod wire;
pub mod zset;

pub use bitstring::Bitstring;
pub use error::{ReconError, TreeError, WireError};
pub use field::{p_sks, zpoints, Zp};
pub use matrix::Matrix;
pub use poly::Poly;
pub use ptree::{MemStore, Node, NodeKind, NodeStore, PTreeConfig, PrefixTree, RedbStore};
pub use zset::ZSet;
