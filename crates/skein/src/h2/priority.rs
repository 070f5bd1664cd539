//! Stream priority tree, cf. https://www.rfc-editor.org/rfc/rfc7540#section-5.3
//!
//! Each node sits in its parent's queue at a virtual "level". Scheduling
//! pops the lowest level (ties go to the lowest stream id), and puts the
//! node back further away the lighter its weight is. A node that can't send
//! lets its own children take its turn.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use skein_h2::StreamId;
use smallvec::SmallVec;

/// Weight given to streams that never got an explicit priority
pub const DEFAULT_WEIGHT: u16 = 16;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum PriorityError {
    #[error("stream {0} is already in the priority tree")]
    DuplicateStream(StreamId),

    #[error("stream {0} is not in the priority tree")]
    MissingStream(StreamId),

    #[error("stream {0} cannot depend on itself")]
    PriorityLoop(StreamId),

    #[error("stream 0 is the root of the tree and has no priority")]
    PseudoStream,

    #[error("weight {0} is outside of 1..=256")]
    BadWeight(u16),
}

/// Every stream in the tree is blocked: there is nothing to send right now.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("no stream is ready to send")]
pub struct Deadlock;

#[derive(Debug)]
struct Node {
    weight: u16,
    parent: StreamId,
    children: SmallVec<[StreamId; 4]>,
    child_queue: BinaryHeap<Reverse<(u64, StreamId)>>,
    active: bool,
    last_weight: u64,
    deficit: u32,
}

impl Node {
    fn new(weight: u16) -> Self {
        Self {
            weight,
            parent: StreamId::CONNECTION,
            children: Default::default(),
            child_queue: Default::default(),
            active: true,
            last_weight: 0,
            deficit: 0,
        }
    }
}

#[derive(Debug)]
pub struct PriorityTree {
    nodes: HashMap<StreamId, Node>,
}

impl Default for PriorityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityTree {
    pub fn new() -> Self {
        let mut root = Node::new(DEFAULT_WEIGHT);
        root.active = false;

        let mut nodes = HashMap::new();
        nodes.insert(StreamId::CONNECTION, root);
        Self { nodes }
    }

    pub fn contains(&self, id: StreamId) -> bool {
        !id.is_connection() && self.nodes.contains_key(&id)
    }

    /// Number of streams in the tree (the root doesn't count).
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a new stream, active. A parent that isn't in the tree yet is
    /// created with the default priority.
    pub fn insert(
        &mut self,
        id: StreamId,
        depends_on: Option<StreamId>,
        weight: u16,
        exclusive: bool,
    ) -> Result<(), PriorityError> {
        if id.is_connection() {
            return Err(PriorityError::PseudoStream);
        }
        if self.nodes.contains_key(&id) {
            return Err(PriorityError::DuplicateStream(id));
        }
        if depends_on == Some(id) {
            return Err(PriorityError::PriorityLoop(id));
        }
        check_weight(weight)?;

        let parent = self.parent_or_root(depends_on)?;
        self.nodes.insert(id, Node::new(weight));
        if exclusive {
            self.add_child_exclusive(parent, id);
        } else {
            self.add_child(parent, id);
        }
        Ok(())
    }

    /// Moves an existing stream under a new parent with a new weight. If the
    /// new parent currently depends on the stream, the new parent is first
    /// moved up to the stream's old parent.
    pub fn reprioritize(
        &mut self,
        id: StreamId,
        depends_on: Option<StreamId>,
        weight: u16,
        exclusive: bool,
    ) -> Result<(), PriorityError> {
        if id.is_connection() {
            return Err(PriorityError::PseudoStream);
        }
        if !self.nodes.contains_key(&id) {
            return Err(PriorityError::MissingStream(id));
        }
        if depends_on == Some(id) {
            return Err(PriorityError::PriorityLoop(id));
        }
        check_weight(weight)?;

        let new_parent = self.parent_or_root(depends_on)?;
        let cycle = self.is_ancestor(id, new_parent);

        let Some(node) = self.nodes.get_mut(&id) else {
            return Err(PriorityError::MissingStream(id));
        };
        node.weight = weight;
        let old_parent = node.parent;

        if cycle {
            let grandparent = self.parent_of(new_parent);
            self.remove_child(grandparent, new_parent);
            self.add_child(old_parent, new_parent);
        }

        self.remove_child(old_parent, id);
        if exclusive {
            self.add_child_exclusive(new_parent, id);
        } else {
            self.add_child(new_parent, id);
        }
        Ok(())
    }

    /// Removes a stream. Its children move up to its parent.
    pub fn remove(&mut self, id: StreamId) -> Result<(), PriorityError> {
        if id.is_connection() {
            return Err(PriorityError::PseudoStream);
        }
        let Some(node) = self.nodes.remove(&id) else {
            return Err(PriorityError::MissingStream(id));
        };

        self.remove_child(node.parent, id);
        for child in node.children {
            self.add_child(node.parent, child);
        }
        Ok(())
    }

    /// The stream has nothing it can send. Unknown streams are ignored.
    pub fn block(&mut self, id: StreamId) {
        if id.is_connection() {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.active = false;
        }
    }

    /// The stream has something it can send. Unknown streams are ignored.
    pub fn unblock(&mut self, id: StreamId) {
        if id.is_connection() {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.active = true;
        }
    }

    pub fn is_blocked(&self, id: StreamId) -> bool {
        self.nodes.get(&id).map(|n| !n.active).unwrap_or(true)
    }

    /// Picks the next stream allowed to send a frame.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<StreamId, Deadlock> {
        self.schedule(StreamId::CONNECTION)
    }

    fn schedule(&mut self, id: StreamId) -> Result<StreamId, Deadlock> {
        let mut popped: SmallVec<[(u64, StreamId); 8]> = SmallVec::new();
        let mut next = None;

        while next.is_none() {
            let Some(Reverse(entry)) = self.nodes.get_mut(&id).and_then(|n| n.child_queue.pop())
            else {
                break;
            };
            popped.push(entry);

            let (_, child) = entry;
            let active = self.nodes.get(&child).map(|n| n.active).unwrap_or(false);
            next = if active {
                Some(child)
            } else {
                self.schedule(child).ok()
            };
        }

        // everything we looked at goes back in the queue, further away
        for (level, child) in popped {
            let Some(node) = self.nodes.get_mut(&child) else {
                continue;
            };
            let budget = 256 + node.deficit;
            let weight = node.weight as u32;
            node.deficit = budget % weight;
            let next_level = level + (budget / weight) as u64;

            if let Some(parent) = self.nodes.get_mut(&id) {
                parent.last_weight = level;
                parent.child_queue.push(Reverse((next_level, child)));
            }
        }

        next.ok_or(Deadlock)
    }

    fn parent_or_root(&mut self, depends_on: Option<StreamId>) -> Result<StreamId, PriorityError> {
        match depends_on {
            None => Ok(StreamId::CONNECTION),
            Some(parent) if parent.is_connection() => Ok(StreamId::CONNECTION),
            Some(parent) => {
                if !self.nodes.contains_key(&parent) {
                    self.insert(parent, None, DEFAULT_WEIGHT, false)?;
                }
                Ok(parent)
            }
        }
    }

    fn parent_of(&self, id: StreamId) -> StreamId {
        self.nodes
            .get(&id)
            .map(|n| n.parent)
            .unwrap_or(StreamId::CONNECTION)
    }

    /// Whether `ancestor` is somewhere above `id`
    fn is_ancestor(&self, ancestor: StreamId, id: StreamId) -> bool {
        let mut current = id;
        // the tree can't be deeper than it has nodes
        for _ in 0..self.nodes.len() {
            if current.is_connection() {
                return false;
            }
            current = self.parent_of(current);
            if current == ancestor {
                return true;
            }
        }
        false
    }

    fn add_child(&mut self, parent: StreamId, child: StreamId) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = parent;
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(child);
            node.child_queue.push(Reverse((node.last_weight, child)));
        }
    }

    fn add_child_exclusive(&mut self, parent: StreamId, child: StreamId) {
        let Some(node) = self.nodes.get_mut(&parent) else {
            return;
        };
        let old_children = std::mem::take(&mut node.children);
        node.child_queue.clear();
        node.last_weight = 0;

        self.add_child(parent, child);
        for old_child in old_children {
            self.add_child(child, old_child);
        }
    }

    fn remove_child(&mut self, parent: StreamId, child: StreamId) {
        let Some(node) = self.nodes.get_mut(&parent) else {
            return;
        };
        node.children.retain(|c| *c != child);
        node.child_queue.retain(|Reverse((_, c))| *c != child);
    }
}

fn check_weight(weight: u16) -> Result<(), PriorityError> {
    if (1..=256).contains(&weight) {
        Ok(())
    } else {
        Err(PriorityError::BadWeight(weight))
    }
}
