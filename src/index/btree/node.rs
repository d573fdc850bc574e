//! B-tree node encoding
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Magic: "TREE" (4) | NodeType (1) | Level (1) | Entries (2)│
//! │ LeftSibling: addr | RightSibling: addr                    │
//! ├───────────────────────────────────────────────────────────┤
//! │ Key 0 | Child 0 | Key 1 | Child 1 | ... | Key n (sentinel)│
//! ├───────────────────────────────────────────────────────────┤
//! │ Zero padding up to the capacity of 2K entries             │
//! └───────────────────────────────────────────────────────────┘
//! ```
//! Level 0 is a leaf: children are chunk addresses. Above that, children are
//! node addresses and key i is a lower bound of child i's subtree.

use crate::codec::Codec;
use crate::error::{ChunkError, Result};
use crate::storage::StorageFile;

use super::key::ChunkKey;

pub(crate) const NODE_MAGIC: &[u8; 4] = b"TREE";

/// Node type id for raw-data chunk trees
pub(crate) const NODE_TYPE_CHUNK: u8 = 1;

/// Everything needed to size and parse nodes of one tree
#[derive(Debug, Clone)]
pub(crate) struct NodeShape {
    pub rank: usize,
    pub k: usize,
    pub codec: Codec,
}

impl NodeShape {
    pub fn capacity(&self) -> usize {
        2 * self.k
    }

    pub fn node_size(&self) -> usize {
        let addr = self.codec.addr_size();
        let key = ChunkKey::encoded_size(self.rank);
        4 + 1 + 1 + 2 + 2 * addr + (self.capacity() + 1) * key + self.capacity() * addr
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub level: u8,
    pub left: Option<u64>,
    pub right: Option<u64>,
    /// `children.len() + 1` keys; the last is the sentinel upper bound
    pub keys: Vec<ChunkKey>,
    pub children: Vec<u64>,
}

impl Node {
    pub fn empty_leaf(rank: usize) -> Self {
        Self {
            level: 0,
            left: None,
            right: None,
            keys: vec![ChunkKey::zero(rank)],
            children: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn sentinel(&self) -> &ChunkKey {
        &self.keys[self.children.len()]
    }

    pub fn sentinel_mut(&mut self) -> &mut ChunkKey {
        let n = self.children.len();
        &mut self.keys[n]
    }

    pub fn encode(&self, shape: &NodeShape) -> Vec<u8> {
        debug_assert!(self.len() <= shape.capacity());
        debug_assert_eq!(self.keys.len(), self.children.len() + 1);

        let size = shape.node_size();
        let mut enc = shape.codec.encoder(size);
        enc.put_slice(NODE_MAGIC);
        enc.put_u8(NODE_TYPE_CHUNK);
        enc.put_u8(self.level);
        enc.put_u16(self.len() as u16);
        enc.put_addr(self.left);
        enc.put_addr(self.right);
        for (key, &child) in self.keys.iter().zip(&self.children) {
            key.encode(&mut enc);
            enc.put_addr(Some(child));
        }
        self.sentinel().encode(&mut enc);
        enc.pad_to(size);
        enc.finish()
    }

    pub fn decode(buf: &[u8], shape: &NodeShape) -> Result<Self> {
        let mut dec = shape.codec.decoder(buf, "b-tree node");
        if dec.get_bytes(4)? != NODE_MAGIC {
            return Err(dec.corrupt("bad magic"));
        }
        let node_type = dec.get_u8()?;
        if node_type != NODE_TYPE_CHUNK {
            return Err(dec.corrupt(format!("unexpected node type {node_type}")));
        }
        let level = dec.get_u8()?;
        let entries = dec.get_u16()? as usize;
        if entries > shape.capacity() {
            return Err(dec.corrupt(format!(
                "entry count {} exceeds capacity {}",
                entries,
                shape.capacity()
            )));
        }
        let left = dec.get_addr()?;
        let right = dec.get_addr()?;

        let mut keys = Vec::with_capacity(entries + 1);
        let mut children = Vec::with_capacity(entries);
        for _ in 0..entries {
            keys.push(ChunkKey::decode(&mut dec, shape.rank)?);
            let child = dec
                .get_addr()?
                .ok_or_else(|| dec.corrupt("undefined child address"))?;
            children.push(child);
        }
        keys.push(ChunkKey::decode(&mut dec, shape.rank)?);

        Ok(Self {
            level,
            left,
            right,
            keys,
            children,
        })
    }

    pub fn read(file: &StorageFile, addr: u64, shape: &NodeShape) -> Result<Self> {
        let mut buf = vec![0u8; shape.node_size()];
        file.read_at(addr, &mut buf)?;
        Self::decode(&buf, shape)
    }

    pub fn write(&self, file: &StorageFile, addr: u64, shape: &NodeShape) -> Result<()> {
        file.write_at(addr, &self.encode(shape))
    }

    /// Read a child and check it sits exactly one level below `parent_level`
    pub fn read_child(file: &StorageFile, addr: u64, parent_level: u8, shape: &NodeShape) -> Result<Self> {
        let child = Self::read(file, addr, shape)?;
        if parent_level == 0 || child.level != parent_level - 1 {
            return Err(ChunkError::cannot_load(
                "b-tree node",
                format!(
                    "node at {} has level {}, parent level is {}",
                    addr, child.level, parent_level
                ),
            ));
        }
        Ok(child)
    }
}
