//! Balanced Tree Index
//!
//! A B-tree of fixed-size nodes keyed by chunk offsets. Data records live in
//! the leaves; internal keys are lower bounds of their subtrees; every node
//! ends with a sentinel upper bound.
//!
//! ## Invariants
//! - every node except the root holds between K and 2K entries
//! - nodes on one level are chained through left/right sibling addresses
//! - the root address moves when the root splits or collapses, so the owner
//!   must persist [`BTreeIndex::root`] after mutating calls

mod key;
mod node;

use std::cmp::Ordering;

use crate::error::{ChunkError, Result};
use crate::layout::{ChunkCoord, ChunkLayout};
use crate::storage::StorageFile;

use super::ChunkRecord;
use key::ChunkKey;
use node::{Node, NodeShape};

/// Outcome of inserting into a subtree
enum Insert {
    Done,
    /// The subtree root split; the new right half lives at `addr`
    Split {
        left_first: ChunkKey,
        right_first: ChunkKey,
        right_sentinel: ChunkKey,
        addr: u64,
    },
}

pub struct BTreeIndex {
    root: u64,
    shape: NodeShape,
    chunk_dims: Vec<u64>,
}

impl BTreeIndex {
    pub(crate) fn create(file: &StorageFile, layout: &ChunkLayout, k: u16) -> Result<Self> {
        if k == 0 {
            return Err(ChunkError::Config("b-tree K must be at least 1".into()));
        }
        let shape = NodeShape {
            rank: layout.rank(),
            k: k as usize,
            codec: file.codec(),
        };
        let root = file.allocate(shape.node_size() as u64)?;
        Node::empty_leaf(shape.rank).write(file, root, &shape)?;

        Ok(Self {
            root,
            shape,
            chunk_dims: layout.chunk_dims().to_vec(),
        })
    }

    pub(crate) fn open(file: &StorageFile, layout: &ChunkLayout, k: u16, root: u64) -> Result<Self> {
        if k == 0 {
            return Err(ChunkError::cannot_load("b-tree", "K is zero"));
        }
        let shape = NodeShape {
            rank: layout.rank(),
            k: k as usize,
            codec: file.codec(),
        };
        let root_node = Node::read(file, root, &shape)?;
        if root_node.left.is_some() || root_node.right.is_some() {
            return Err(ChunkError::cannot_load("b-tree", "root node has siblings"));
        }

        Ok(Self {
            root,
            shape,
            chunk_dims: layout.chunk_dims().to_vec(),
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn k(&self) -> u16 {
        self.shape.k as u16
    }

    /// Number of levels (1 for a lone leaf)
    pub fn height(&self, file: &StorageFile) -> Result<u8> {
        Ok(Node::read(file, self.root, &self.shape)?.level + 1)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub(crate) fn get(&self, file: &StorageFile, coord: &ChunkCoord) -> Result<ChunkRecord> {
        let target = coord.as_raw();
        let mut node = Node::read(file, self.root, &self.shape)?;

        while !node.is_leaf() {
            let Some(i) = Self::route(&node, target) else {
                return Ok(ChunkRecord::unallocated(coord.clone()));
            };
            node = Node::read_child(file, node.children[i], node.level, &self.shape)?;
        }

        let found = node.keys[..node.len()].binary_search_by(|k| k.cmp_coord(target));
        Ok(match found {
            Ok(i) => ChunkRecord {
                coord: coord.clone(),
                addr: Some(node.children[i]),
                nbytes: node.keys[i].nbytes as u64,
                filter_mask: node.keys[i].filter_mask,
            },
            Err(_) => ChunkRecord::unallocated(coord.clone()),
        })
    }

    /// Child whose key range contains `target`: the last i with keys[i] <= target
    fn route(node: &Node, target: &[u64]) -> Option<usize> {
        let n = node.len();
        let pos = node.keys[..n].partition_point(|k| k.cmp_coord(target) != Ordering::Greater);
        pos.checked_sub(1)
    }

    // =========================================================================
    // Insert / Update
    // =========================================================================

    /// Insert a record, or overwrite the existing one for the same coordinate
    pub(crate) fn set(&mut self, file: &StorageFile, record: &ChunkRecord) -> Result<()> {
        let Some(chunk_addr) = record.addr else {
            return Err(ChunkError::Resource("cannot index an unallocated chunk".into()));
        };
        let key = ChunkKey {
            nbytes: record.nbytes as u32,
            filter_mask: record.filter_mask,
            offsets: record.coord.as_raw().to_vec(),
        };

        let root = Node::read(file, self.root, &self.shape)?;
        let outcome = self.insert_at(file, self.root, root, key, chunk_addr)?;

        if let Insert::Split {
            left_first,
            right_first,
            right_sentinel,
            addr,
        } = outcome
        {
            let old_root = self.root;
            let old_level = Node::read(file, old_root, &self.shape)?.level;
            let new_root = Node {
                level: old_level + 1,
                left: None,
                right: None,
                keys: vec![left_first.bound(), right_first.bound(), right_sentinel.bound()],
                children: vec![old_root, addr],
            };
            let new_addr = file.allocate(self.shape.node_size() as u64)?;
            new_root.write(file, new_addr, &self.shape)?;
            self.root = new_addr;
            tracing::debug!("B-tree root split, new root at {} (level {})", new_addr, new_root.level);
        }
        Ok(())
    }

    fn insert_at(
        &mut self,
        file: &StorageFile,
        addr: u64,
        mut node: Node,
        key: ChunkKey,
        chunk_addr: u64,
    ) -> Result<Insert> {
        let target = key.offsets.clone();

        if node.is_leaf() {
            let n = node.len();
            match node.keys[..n].binary_search_by(|k| k.cmp_coord(&target)) {
                Ok(i) => {
                    node.keys[i] = key;
                    node.children[i] = chunk_addr;
                    node.write(file, addr, &self.shape)?;
                    return Ok(Insert::Done);
                }
                Err(i) => {
                    node.keys.insert(i, key);
                    node.children.insert(i, chunk_addr);
                }
            }
        } else {
            let i = match Self::route(&node, &target) {
                Some(i) => i,
                None => {
                    // New minimum: lower the first bound before descending
                    node.keys[0] = key.bound();
                    0
                }
            };
            let child_addr = node.children[i];
            let child = Node::read_child(file, child_addr, node.level, &self.shape)?;
            if let Insert::Split {
                right_first, addr: right_addr, ..
            } = self.insert_at(file, child_addr, child, key, chunk_addr)?
            {
                node.keys.insert(i + 1, right_first.bound());
                node.children.insert(i + 1, right_addr);
            }
        }

        if node.sentinel().cmp_coord(&target) != Ordering::Greater {
            *node.sentinel_mut() = self.upper_bound(&target);
        }

        if node.len() > self.shape.capacity() {
            self.split(file, addr, node)
        } else {
            node.write(file, addr, &self.shape)?;
            Ok(Insert::Done)
        }
    }

    /// Split an over-full node at the median; `node` keeps the left half
    fn split(&mut self, file: &StorageFile, addr: u64, mut node: Node) -> Result<Insert> {
        let mid = node.len() / 2;
        let right_children = node.children.split_off(mid);
        let right_keys = node.keys.split_off(mid);
        node.keys.push(right_keys[0].bound());

        let right_addr = file.allocate(self.shape.node_size() as u64)?;
        let right = Node {
            level: node.level,
            left: Some(addr),
            right: node.right,
            keys: right_keys,
            children: right_children,
        };

        if let Some(neighbor_addr) = node.right {
            let mut neighbor = Node::read(file, neighbor_addr, &self.shape)?;
            neighbor.left = Some(right_addr);
            neighbor.write(file, neighbor_addr, &self.shape)?;
        }
        node.right = Some(right_addr);

        right.write(file, right_addr, &self.shape)?;
        node.write(file, addr, &self.shape)?;
        tracing::debug!(
            "B-tree node {} split at level {}: {} + {} entries",
            addr,
            node.level,
            node.len(),
            right.len()
        );

        Ok(Insert::Split {
            left_first: node.keys[0].clone(),
            right_first: right.keys[0].clone(),
            right_sentinel: right.sentinel().clone(),
            addr: right_addr,
        })
    }

    /// Exclusive upper bound of the chunk at `offsets`
    fn upper_bound(&self, offsets: &[u64]) -> ChunkKey {
        let mut bound: Vec<u64> = offsets
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&o, &c)| o + c)
            .collect();
        bound.push(0);
        ChunkKey {
            nbytes: 0,
            filter_mask: 0,
            offsets: bound,
        }
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove the record for `coord`; returns false if it wasn't present
    pub(crate) fn remove(&mut self, file: &StorageFile, coord: &ChunkCoord) -> Result<bool> {
        let mut root = Node::read(file, self.root, &self.shape)?;
        let root_addr = self.root;
        if !self.remove_at(file, root_addr, &mut root, coord.as_raw())? {
            return Ok(false);
        }

        // Collapse internal roots that are down to one child
        while !root.is_leaf() && root.len() == 1 {
            let child_addr = root.children[0];
            let child = Node::read_child(file, child_addr, root.level, &self.shape)?;
            file.free(self.root, self.shape.node_size() as u64)?;
            tracing::debug!("B-tree root collapsed to {} (level {})", child_addr, child.level);
            self.root = child_addr;
            root = child;
        }
        Ok(true)
    }

    fn remove_at(&mut self, file: &StorageFile, addr: u64, node: &mut Node, target: &[u64]) -> Result<bool> {
        if node.is_leaf() {
            let n = node.len();
            let Ok(i) = node.keys[..n].binary_search_by(|k| k.cmp_coord(target)) else {
                return Ok(false);
            };
            node.keys.remove(i);
            node.children.remove(i);
            node.write(file, addr, &self.shape)?;
            return Ok(true);
        }

        let Some(i) = Self::route(node, target) else {
            return Ok(false);
        };
        let child_addr = node.children[i];
        let mut child = Node::read_child(file, child_addr, node.level, &self.shape)?;
        if !self.remove_at(file, child_addr, &mut child, target)? {
            return Ok(false);
        }

        if child.len() < self.shape.k && node.len() > 1 {
            self.rebalance(file, node, i, child)?;
        }
        node.write(file, addr, &self.shape)?;
        Ok(true)
    }

    /// Fix an under-full child `i` of `parent` by borrowing from or merging
    /// with an adjacent sibling under the same parent
    fn rebalance(&mut self, file: &StorageFile, parent: &mut Node, i: usize, mut child: Node) -> Result<()> {
        let k = self.shape.k;
        let child_addr = parent.children[i];

        if i + 1 < parent.len() {
            let right_addr = parent.children[i + 1];
            let mut right = Node::read_child(file, right_addr, parent.level, &self.shape)?;

            if right.len() > k {
                // Borrow the right sibling's first entry
                let key = right.keys.remove(0);
                let ptr = right.children.remove(0);
                let n = child.len();
                child.keys.insert(n, key);
                child.children.push(ptr);
                *child.sentinel_mut() = right.keys[0].bound();
                parent.keys[i + 1] = right.keys[0].bound();

                child.write(file, child_addr, &self.shape)?;
                right.write(file, right_addr, &self.shape)?;
            } else {
                // Absorb the right sibling
                child.keys.pop();
                child.keys.append(&mut right.keys);
                child.children.append(&mut right.children);
                child.right = right.right;
                self.relink_left(file, right.right, child_addr)?;
                parent.keys.remove(i + 1);
                parent.children.remove(i + 1);

                child.write(file, child_addr, &self.shape)?;
                file.free(right_addr, self.shape.node_size() as u64)?;
                tracing::debug!("B-tree merged node {} into {}", right_addr, child_addr);
            }
        } else if i > 0 {
            let left_addr = parent.children[i - 1];
            let mut left = Node::read_child(file, left_addr, parent.level, &self.shape)?;

            if left.len() > k {
                // Borrow the left sibling's last entry
                let n = left.len();
                let key = left.keys.remove(n - 1);
                let ptr = left.children.remove(n - 1);
                *left.sentinel_mut() = key.bound();
                parent.keys[i] = key.bound();
                child.keys.insert(0, key);
                child.children.insert(0, ptr);

                left.write(file, left_addr, &self.shape)?;
                child.write(file, child_addr, &self.shape)?;
            } else {
                // Fold into the left sibling
                left.keys.pop();
                left.keys.append(&mut child.keys);
                left.children.append(&mut child.children);
                left.right = child.right;
                self.relink_left(file, child.right, left_addr)?;
                parent.keys.remove(i);
                parent.children.remove(i);

                left.write(file, left_addr, &self.shape)?;
                file.free(child_addr, self.shape.node_size() as u64)?;
                tracing::debug!("B-tree merged node {} into {}", child_addr, left_addr);
            }
        }
        Ok(())
    }

    /// Point `node_addr`'s left sibling pointer at `left`
    fn relink_left(&self, file: &StorageFile, node_addr: Option<u64>, left: u64) -> Result<()> {
        if let Some(addr) = node_addr {
            let mut node = Node::read(file, addr, &self.shape)?;
            node.left = Some(left);
            node.write(file, addr, &self.shape)?;
        }
        Ok(())
    }

    // =========================================================================
    // Iteration & Deletion
    // =========================================================================

    pub(crate) fn records<'a>(&'a self, file: &'a StorageFile) -> Result<LeafRecords<'a>> {
        let mut addr = self.root;
        let mut node = Node::read(file, addr, &self.shape)?;
        while !node.is_leaf() {
            addr = node.children[0];
            node = Node::read_child(file, addr, node.level, &self.shape)?;
        }
        Ok(LeafRecords {
            file,
            shape: &self.shape,
            addr,
            node: Some(node),
            pos: 0,
        })
    }

    /// Free every node (chunk blocks are freed by the caller)
    pub(crate) fn delete(self, file: &StorageFile) -> Result<()> {
        let mut stack = vec![self.root];
        while let Some(addr) = stack.pop() {
            let node = Node::read(file, addr, &self.shape)?;
            if !node.is_leaf() {
                stack.extend_from_slice(&node.children);
            }
            file.free(addr, self.shape.node_size() as u64)?;
        }
        Ok(())
    }
}

/// Walks the leaf level left to right through sibling pointers
pub struct LeafRecords<'a> {
    file: &'a StorageFile,
    shape: &'a NodeShape,
    addr: u64,
    node: Option<Node>,
    pos: usize,
}

impl Iterator for LeafRecords<'_> {
    type Item = Result<ChunkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;
            if self.pos < node.len() {
                let key = &node.keys[self.pos];
                let record = ChunkRecord {
                    coord: ChunkCoord::from_raw(key.offsets.clone()),
                    addr: Some(node.children[self.pos]),
                    nbytes: key.nbytes as u64,
                    filter_mask: key.filter_mask,
                };
                self.pos += 1;
                return Some(Ok(record));
            }

            let Some(next_addr) = node.right else {
                self.node = None;
                return None;
            };
            let next = match Node::read(self.file, next_addr, self.shape) {
                Ok(next) => next,
                Err(e) => {
                    self.node = None;
                    return Some(Err(e));
                }
            };
            if next.left != Some(self.addr) || !next.is_leaf() {
                self.node = None;
                return Some(Err(ChunkError::cannot_load(
                    "b-tree node",
                    format!("inconsistent sibling pointers between {} and {}", self.addr, next_addr),
                )));
            }
            self.addr = next_addr;
            self.node = Some(next);
            self.pos = 0;
        }
    }
}
