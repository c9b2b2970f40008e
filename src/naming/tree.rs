//! The naming tree and its lock manager.
//!
//! Every path maps to one node. A node carries a readers–writer counter and
//! a FIFO queue of waiting lock requests; locks are acquired as a chain
//! (shared on every ancestor, the requested mode at the target). Decisions
//! for a whole chain are taken in one pass under the namespace's mutex;
//! waiting happens outside it on the grant half of a oneshot channel.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::path::WirePath;
use crate::{Result, WireFsError};

/// Shared releases at a file before the naming server is asked to add a
/// replica.
pub const REPLICATION_THRESHOLD: u32 = 20;

/// A queued lock request: the requested mode and the channel that flips to
/// granted when `service_pending` reaches it.
struct LockWaiter {
    exclusive: bool,
    grant: oneshot::Sender<()>,
}

/// Outcome of one node's acquisition decision.
pub enum Acquired {
    Granted,
    Pending(oneshot::Receiver<()>),
}

/// What a release at the target asks the naming server to do about the
/// file's replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaCandidate {
    /// The shared-release count hit the threshold: copy the file to one
    /// more storage server.
    Replicate,
    /// Exclusive access just ended: shrink the replica set to one copy.
    Collapse,
}

/// One node of the naming tree.
///
/// `readers` is -1 while held exclusively, 0 when free, and the holder
/// count while held shared.
pub struct PathNode {
    children: HashMap<String, PathNode>,
    is_dir: bool,
    readers: i64,
    waiters: VecDeque<LockWaiter>,
    read_count: u32,
}

impl PathNode {
    fn new(is_dir: bool) -> Self {
        Self {
            children: HashMap::new(),
            is_dir,
            readers: 0,
            waiters: VecDeque::new(),
            read_count: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.is_dir
    }

    pub fn children(&self) -> &HashMap<String, PathNode> {
        &self.children
    }

    #[cfg(test)]
    pub(crate) fn readers(&self) -> i64 {
        self.readers
    }
}

/// The directory tree, rooted at `/`. The owner serializes access with a
/// mutex; methods here assume they run inside that critical section.
pub struct Namespace {
    root: PathNode,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            root: PathNode::new(true),
        }
    }

    /// Walks the components of `path` from the root. Fails with not-found
    /// at the first missing component.
    pub fn lookup(&self, path: &WirePath) -> Result<&PathNode> {
        let mut node = &self.root;
        for component in path.components() {
            node = node
                .children
                .get(component)
                .ok_or_else(|| WireFsError::NotFound(path.to_string()))?;
        }
        Ok(node)
    }

    pub fn contains(&self, path: &WirePath) -> bool {
        self.lookup(path).is_ok()
    }

    /// Inserts a file at `path`, creating intermediate directory nodes.
    /// Returns `true` iff a new leaf was created; `false` when the terminal
    /// already exists, or when some intermediate component is a file.
    pub fn add_file(&mut self, path: &WirePath) -> bool {
        let components = path.components();
        let Some((last, ancestors)) = components.split_last() else {
            // The root is never a file.
            return false;
        };

        let mut node = &mut self.root;
        for component in ancestors {
            node = node
                .children
                .entry(component.clone())
                .or_insert_with(|| PathNode::new(true));
            if !node.is_dir {
                return false;
            }
        }
        if node.children.contains_key(last) {
            return false;
        }
        node.children.insert(last.clone(), PathNode::new(false));
        true
    }

    /// Inserts a direct child of `parent`. Fails with not-found when the
    /// parent is missing or is a file; returns `false` when the child
    /// already exists.
    pub fn create_child(&mut self, parent: &WirePath, name: &str, is_dir: bool) -> Result<bool> {
        let node = self.lookup_mut(parent)?;
        if !node.is_dir {
            return Err(WireFsError::NotFound(format!(
                "{parent} is not a directory"
            )));
        }
        if node.children.contains_key(name) {
            return Ok(false);
        }
        node.children.insert(name.to_string(), PathNode::new(is_dir));
        Ok(true)
    }

    /// Detaches the subtree at `path` from its parent.
    pub fn remove(&mut self, path: &WirePath) -> Result<()> {
        let last = path
            .last()
            .map_err(|_| WireFsError::InvalidArgument("the root cannot be removed".into()))?
            .to_string();
        let parent = self.lookup_mut(&path.parent()?)?;
        parent
            .children
            .remove(&last)
            .map(|_| ())
            .ok_or_else(|| WireFsError::NotFound(path.to_string()))
    }

    /// Yields every file leaf under `directory`; fails with not-found if
    /// `directory` is missing or is a file.
    pub fn enumerate(&self, directory: &WirePath) -> Result<Vec<WirePath>> {
        let node = self.lookup(directory)?;
        if !node.is_dir {
            return Err(WireFsError::NotFound(format!(
                "{directory} is not a directory"
            )));
        }
        let mut files = Vec::new();
        Self::collect_files(node, directory, &mut files)?;
        Ok(files)
    }

    fn collect_files(node: &PathNode, at: &WirePath, out: &mut Vec<WirePath>) -> Result<()> {
        for (name, child) in &node.children {
            let path = at.child(name)?;
            if child.is_dir {
                Self::collect_files(child, &path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }

    fn lookup_mut(&mut self, path: &WirePath) -> Result<&mut PathNode> {
        let mut node = &mut self.root;
        for component in path.components() {
            node = node
                .children
                .get_mut(component)
                .ok_or_else(|| WireFsError::NotFound(path.to_string()))?;
        }
        Ok(node)
    }

    /// Takes the acquisition decision for every node on the chain from the
    /// root to `path`: shared on each ancestor, `exclusive` at the target.
    /// Nodes that cannot grant immediately enqueue a FIFO waiter; the caller
    /// awaits all pending tokens outside the namespace mutex.
    ///
    /// Fails with not-found before any waiter is enqueued.
    pub fn acquire_chain(&mut self, path: &WirePath, exclusive: bool) -> Result<Vec<Acquired>> {
        self.lookup(path)?;

        let components = path.components();
        let mut decisions = Vec::with_capacity(components.len() + 1);
        let mut node = &mut self.root;
        let mut remaining = components.iter().peekable();
        loop {
            let is_target = remaining.peek().is_none();
            decisions.push(Self::acquire_node(node, is_target && exclusive));
            match remaining.next() {
                None => break,
                Some(component) => {
                    node = node
                        .children
                        .get_mut(component)
                        .expect("path validated before the chain walk");
                }
            }
        }
        Ok(decisions)
    }

    fn acquire_node(node: &mut PathNode, exclusive: bool) -> Acquired {
        let writer_waiting = node.waiters.iter().any(|w| w.exclusive);
        let granted = if exclusive {
            node.readers == 0 && !writer_waiting
        } else {
            node.readers != -1 && !writer_waiting
        };
        if granted {
            node.readers = if exclusive { -1 } else { node.readers + 1 };
            Acquired::Granted
        } else {
            let (grant, token) = oneshot::channel();
            node.waiters.push_back(LockWaiter { exclusive, grant });
            Acquired::Pending(token)
        }
    }

    /// Releases the chain previously acquired for `path`: shared on each
    /// ancestor, `exclusive` at the target. Returns what the release at a
    /// *file* target asks the replication policy to do, if anything.
    ///
    /// Unlocking a path that does not exist is a caller error.
    pub fn release_chain(
        &mut self,
        path: &WirePath,
        exclusive: bool,
    ) -> Result<Option<ReplicaCandidate>> {
        if !self.contains(path) {
            return Err(WireFsError::InvalidArgument(format!(
                "unlock of unknown path {path}"
            )));
        }

        let components = path.components();
        let mut candidate = None;
        let mut node = &mut self.root;
        let mut remaining = components.iter().peekable();
        loop {
            let is_target = remaining.peek().is_none();
            if is_target {
                candidate = Self::release_target(node, exclusive);
            } else {
                Self::release_shared(node);
            }
            match remaining.next() {
                None => break,
                Some(component) => {
                    node = node
                        .children
                        .get_mut(component)
                        .expect("path validated before the chain walk");
                }
            }
        }
        Ok(candidate)
    }

    fn release_target(node: &mut PathNode, exclusive: bool) -> Option<ReplicaCandidate> {
        if exclusive {
            node.readers = 0;
            Self::service_pending(node);
            if !node.is_dir {
                return Some(ReplicaCandidate::Collapse);
            }
        } else {
            Self::release_shared(node);
            if !node.is_dir {
                node.read_count += 1;
                if node.read_count >= REPLICATION_THRESHOLD {
                    node.read_count = 0;
                    return Some(ReplicaCandidate::Replicate);
                }
            }
        }
        None
    }

    fn release_shared(node: &mut PathNode) {
        debug_assert!(node.readers > 0, "shared release without a holder");
        if node.readers > 0 {
            node.readers -= 1;
        }
        if node.readers == 0 {
            Self::service_pending(node);
        }
    }

    /// Grants from the head of the waiter queue for as long as possible:
    /// an exclusive head is granted only with no holders, and ends the
    /// scan; shared heads are granted while no writer holds the node. A
    /// waiting writer thereby blocks shared requests queued behind it.
    fn service_pending(node: &mut PathNode) {
        while let Some(head) = node.waiters.front() {
            if head.exclusive {
                if node.readers == 0 {
                    node.readers = -1;
                    let waiter = node.waiters.pop_front().expect("head checked");
                    let _ = waiter.grant.send(());
                }
                return;
            } else if node.readers != -1 {
                node.readers += 1;
                let waiter = node.waiters.pop_front().expect("head checked");
                let _ = waiter.grant.send(());
            } else {
                return;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn node(&self, path: &WirePath) -> &PathNode {
        self.lookup(path).unwrap()
    }
}
