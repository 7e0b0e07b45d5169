//! Ordering buffer for mapped sample rows
//!
//! Rows arrive in whatever order the mapping workers finish. The buffer keeps
//! them in a binary search tree keyed by row timestamp so a drain can hand
//! them to the block writer in non-decreasing time order.
//!
//! The tree is not self-balancing: sorted input degrades insertion to linear
//! time in the buffer size. Drains keep the buffer small, so this is bounded
//! by the drain threshold.

use crate::mapper::SampleRow;
use tracing::debug;

/// Arena slot of one tree node
#[derive(Debug)]
struct Node {
    key: i64,
    row: Option<SampleRow>,
    left: Option<usize>,
    right: Option<usize>,
}

/// Unbalanced binary search tree of sample rows.
///
/// Not internally synchronized; callers hold the buffer lock around
/// `insert` and around the swap that precedes a drain.
#[derive(Debug, Default)]
pub struct OrderingBuffer {
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl OrderingBuffer {
    /// Create a new empty ordering buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row keyed by its timestamp.
    ///
    /// Empty rows are rejected and `false` is returned. Equal keys go to the
    /// right subtree, so rows with the same timestamp drain in insertion order.
    pub fn insert(&mut self, row: SampleRow) -> bool {
        let Some(key) = row.timestamp() else {
            debug!("Rejected empty sample row");
            return false;
        };

        let idx = self.nodes.len();
        self.nodes.push(Node {
            key,
            row: Some(row),
            left: None,
            right: None,
        });

        let Some(mut current) = self.root else {
            self.root = Some(idx);
            return true;
        };

        loop {
            let node = &mut self.nodes[current];
            let next = if key < node.key {
                &mut node.left
            } else {
                &mut node.right
            };
            match *next {
                Some(child) => current = child,
                None => {
                    *next = Some(idx);
                    return true;
                }
            }
        }
    }

    /// Number of rows inserted since the buffer was created
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Consume the buffer, yielding rows in ascending timestamp order
    pub fn drain(self) -> Drain {
        Drain {
            current: self.root,
            stack: Vec::new(),
            nodes: self.nodes,
        }
    }
}

impl IntoIterator for OrderingBuffer {
    type Item = SampleRow;
    type IntoIter = Drain;

    fn into_iter(self) -> Drain {
        self.drain()
    }
}

/// In-order traversal over a consumed [`OrderingBuffer`]
#[derive(Debug)]
pub struct Drain {
    nodes: Vec<Node>,
    stack: Vec<usize>,
    current: Option<usize>,
}

impl Iterator for Drain {
    type Item = SampleRow;

    fn next(&mut self) -> Option<SampleRow> {
        while let Some(idx) = self.current {
            self.stack.push(idx);
            self.current = self.nodes[idx].left;
        }
        let idx = self.stack.pop()?;
        self.current = self.nodes[idx].right;
        self.nodes[idx].row.take()
    }
}
