//! Prefix tree nodes and their stored record format.
//!
//! A record is laid out as SKS writes it: element count, key bit length,
//! key bytes, one fixed-width sample value per evaluation point, a leaf flag
//! byte and, for leaves, an element count followed by the elements.

use std::io::{Cursor, Read};
use std::sync::Arc;

use num_bigint::BigUint;

use crate::bitstring::Bitstring;
use crate::error::WireError;
use crate::field::Zp;
use crate::wire::{read_bytes, read_int, read_len, read_zp, write_len, write_zp};

/// Payload carried by a node: literal elements, or nothing for internal
/// nodes whose children are addressed by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Holds its elements directly.
    Leaf(Vec<Zp>),
    /// Has `2^BitQuantum` children.
    Internal,
}

/// One prefix tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(crate) key: Bitstring,
    pub(crate) svalues: Vec<Zp>,
    pub(crate) num_elements: usize,
    pub(crate) kind: NodeKind,
}

impl Node {
    /// An empty leaf whose sample values are all one.
    pub(crate) fn empty(key: Bitstring, p: &Arc<BigUint>, num_samples: usize) -> Self {
        Node {
            key,
            svalues: vec![Zp::one(p); num_samples],
            num_elements: 0,
            kind: NodeKind::Leaf(Vec::new()),
        }
    }

    /// Key of this node; its length is `depth * BitQuantum`.
    pub fn key(&self) -> &Bitstring {
        &self.key
    }

    /// Aggregate sample values, one per evaluation point.
    pub fn svalues(&self) -> &[Zp] {
        &self.svalues
    }

    /// Number of elements in this subtree.
    pub fn size(&self) -> usize {
        self.num_elements
    }

    /// Whether the node holds its elements directly.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    /// The node payload.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Elements held by a leaf; empty for internal nodes.
    pub fn leaf_elements(&self) -> &[Zp] {
        match &self.kind {
            NodeKind::Leaf(elements) => elements,
            NodeKind::Internal => &[],
        }
    }

    /// Depth below the root for the given quantum.
    pub fn depth(&self, bit_quantum: usize) -> usize {
        self.key.len() / bit_quantum
    }

    pub(crate) fn mul_svalues(&mut self, marray: &[Zp]) {
        for (s, m) in self.svalues.iter_mut().zip(marray) {
            *s = &*s * m;
        }
    }

    /// Serializes the node record.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        write_len(&mut out, self.num_elements)?;
        write_len(&mut out, self.key.len())?;
        out.extend_from_slice(self.key.bytes());
        for s in &self.svalues {
            write_zp(&mut out, s)?;
        }
        match &self.kind {
            NodeKind::Leaf(elements) => {
                out.push(1);
                write_len(&mut out, elements.len())?;
                for e in elements {
                    write_zp(&mut out, e)?;
                }
            }
            NodeKind::Internal => out.push(0),
        }
        Ok(out)
    }

    /// Parses a node record with `num_samples` sample values.
    pub fn decode(buf: &[u8], p: &Arc<BigUint>, num_samples: usize) -> Result<Self, WireError> {
        let mut r = Cursor::new(buf);
        let num_elements = read_int(&mut r)? as usize;
        let key_bits = read_len(&mut r)?;
        let key = Bitstring::from_bytes(key_bits, &read_bytes(&mut r, key_bits.div_ceil(8))?);
        let svalues = (0..num_samples)
            .map(|_| read_zp(&mut r, p))
            .collect::<Result<Vec<_>, _>>()?;
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag)?;
        let kind = match flag[0] {
            0 => NodeKind::Internal,
            1 => {
                let n = read_len(&mut r)?;
                NodeKind::Leaf((0..n).map(|_| read_zp(&mut r, p)).collect::<Result<_, _>>()?)
            }
            other => return Err(WireError::Malformed(format!("leaf flag {other}"))),
        };
        Ok(Node {
            key,
            svalues,
            num_elements,
            kind,
        })
    }
}

/// Store key for a node: the wire encoding of its bit string key.
pub fn node_key(key: &Bitstring) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.bytes().len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(&(key.bytes().len() as u32).to_be_bytes());
    out.extend_from_slice(key.bytes());
    out
}
