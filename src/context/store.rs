//! Dependency-tracked, append-only context store.
//!
//! Every task output that passes validation is written here as a
//! [`ContextEntry`]. Entries form a dependency graph (an edge `a -> b` means
//! `a` depends on `b`) that is kept acyclic on every write. Readers get
//! entries ordered so that no entry appears before anything it depends on.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;

use crate::context::entry::{ContextEntry, EntryId};
use crate::context::log::ContextLog;
use crate::core::{Metadata, Role};
use crate::error::{Error, Result};
use crate::workflow::WorkflowId;
use crate::{clog_debug, clog_warn};

/// The shared record of every task output.
///
/// Node indices in the graph line up with positions in `entries`; nothing is
/// removed except by [`ContextStore::clear`], which resets both.
pub struct ContextStore {
    entries: Vec<Arc<ContextEntry>>,
    graph: DiGraph<EntryId, ()>,
    index: HashMap<EntryId, NodeIndex>,
    attached: HashSet<WorkflowId>,
    log: Option<ContextLog>,
}

impl ContextStore {
    /// An in-memory store with no persisted log.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            graph: DiGraph::new(),
            index: HashMap::new(),
            attached: HashSet::new(),
            log: None,
        }
    }

    /// A store backed by a context log, rebuilt from whatever the log holds.
    pub fn open(log: ContextLog) -> Result<Self> {
        let mut store = Self::new();
        for entry in log.load()? {
            store.restore(entry)?;
        }
        clog_debug!(
            "ContextStore::open path={} entries={}",
            log.path().display(),
            store.len()
        );
        store.log = Some(log);
        Ok(store)
    }

    /// Write a new entry and return its identifier.
    ///
    /// # Errors
    /// `UnknownDependency` if a dependency is not in the store,
    /// `CyclicDependency` if the entry would close a cycle. The store is
    /// unchanged on any error.
    pub fn store(
        &mut self,
        role: Role,
        payload: serde_json::Value,
        metadata: Metadata,
        dependencies: Vec<EntryId>,
    ) -> Result<EntryId> {
        let mut deps = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        let entry = ContextEntry {
            id: EntryId::new(),
            role,
            payload,
            metadata,
            created_at: Utc::now(),
            dependencies: deps,
            seq: self.entries.len() as u64,
        };

        let node = self.link(&entry)?;
        if let Some(log) = &self.log {
            if let Err(e) = log.append(&entry) {
                self.graph.remove_node(node);
                return Err(e);
            }
        }

        let id = entry.id;
        clog_debug!(
            "Stored entry {} role={} deps={} seq={}",
            id.short(),
            entry.role,
            entry.dependencies.len(),
            entry.seq
        );
        self.index.insert(id, node);
        self.entries.push(Arc::new(entry));
        Ok(id)
    }

    /// Re-insert an entry read back from the context log.
    ///
    /// Applies the same dependency checks as [`ContextStore::store`] and keeps
    /// the entry's identifier and timestamp.
    pub fn restore(&mut self, mut entry: ContextEntry) -> Result<()> {
        if self.index.contains_key(&entry.id) {
            return Err(Error::DuplicateEntry(entry.id));
        }
        entry.seq = self.entries.len() as u64;

        let node = self.link(&entry)?;
        self.index.insert(entry.id, node);
        self.entries.push(Arc::new(entry));
        Ok(())
    }

    /// Add the entry's node and edges, rolling back if the write is invalid.
    fn link(&mut self, entry: &ContextEntry) -> Result<NodeIndex> {
        let mut targets = Vec::with_capacity(entry.dependencies.len());
        for dep in &entry.dependencies {
            let target = *self
                .index
                .get(dep)
                .ok_or(Error::UnknownDependency { dependency: *dep })?;
            targets.push(target);
        }

        // The node is always the last one, so removing it leaves every other
        // index in place.
        let node = self.graph.add_node(entry.id);
        for target in targets {
            self.graph.add_edge(node, target, ());
        }

        if is_cyclic_directed(&self.graph) {
            self.graph.remove_node(node);
            clog_warn!("Rejected entry {}: dependency cycle", entry.id.short());
            return Err(Error::CyclicDependency { entry: entry.id });
        }

        Ok(node)
    }

    /// Context for a task of `role` in a workflow.
    ///
    /// Starts from the latest entry of every other role in the workflow and
    /// returns those entries with everything they transitively depend on,
    /// dependencies first and otherwise in insertion order.
    pub fn get_for_role(&self, role: Role, workflow_id: WorkflowId) -> Vec<Arc<ContextEntry>> {
        let mut latest: HashMap<Role, NodeIndex> = HashMap::new();
        for (position, entry) in self.entries.iter().enumerate() {
            if entry.role != role && entry.workflow_id() == Some(workflow_id) {
                latest.insert(entry.role, NodeIndex::new(position));
            }
        }

        self.ordered_closure(latest.into_values())
    }

    /// The given entries with their transitive dependencies, in dependency order.
    ///
    /// # Errors
    /// `UnknownDependency` if an identifier is not in the store.
    pub fn resolve(&self, ids: &[EntryId]) -> Result<Vec<Arc<ContextEntry>>> {
        let mut seeds = Vec::with_capacity(ids.len());
        for id in ids {
            let node = *self
                .index
                .get(id)
                .ok_or(Error::UnknownDependency { dependency: *id })?;
            seeds.push(node);
        }
        Ok(self.ordered_closure(seeds))
    }

    fn ordered_closure(&self, seeds: impl IntoIterator<Item = NodeIndex>) -> Vec<Arc<ContextEntry>> {
        let mut closure: HashSet<NodeIndex> = HashSet::new();
        for seed in seeds {
            if closure.contains(&seed) {
                continue;
            }
            let mut dfs = Dfs::new(&self.graph, seed);
            while let Some(node) = dfs.next(&self.graph) {
                closure.insert(node);
            }
        }

        // Kahn's algorithm over the closure, breaking ties by insertion order.
        let mut pending: HashMap<NodeIndex, usize> = closure
            .iter()
            .map(|&node| {
                let deps = self.graph.neighbors_directed(node, Direction::Outgoing).count();
                (node, deps)
            })
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .filter(|(_, &deps)| deps == 0)
            .map(|(node, _)| Reverse(node.index()))
            .collect();

        let mut ordered = Vec::with_capacity(closure.len());
        while let Some(Reverse(position)) = ready.pop() {
            let node = NodeIndex::new(position);
            ordered.push(Arc::clone(&self.entries[position]));

            for dependent in self.graph.neighbors_directed(node, Direction::Incoming) {
                if let Some(remaining) = pending.get_mut(&dependent) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        ready.push(Reverse(dependent.index()));
                    }
                }
            }
        }

        ordered
    }

    /// Every entry in insertion order.
    ///
    /// The iterator is lazy and can be cloned to restart from the same point.
    pub fn history(&self) -> History<'_> {
        History {
            entries: &self.entries,
            position: 0,
        }
    }

    /// Entries written by one workflow, in insertion order.
    pub fn for_workflow(&self, workflow_id: WorkflowId) -> Vec<Arc<ContextEntry>> {
        self.history()
            .filter(|e| e.workflow_id() == Some(workflow_id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &EntryId) -> Option<Arc<ContextEntry>> {
        self.index
            .get(id)
            .map(|node| Arc::clone(&self.entries[node.index()]))
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark a workflow as running against this store.
    pub fn attach_workflow(&mut self, workflow_id: WorkflowId) {
        self.attached.insert(workflow_id);
    }

    pub fn detach_workflow(&mut self, workflow_id: WorkflowId) {
        self.attached.remove(&workflow_id);
    }

    pub fn attached_workflows(&self) -> usize {
        self.attached.len()
    }

    /// Wipe every entry, in memory and in the log.
    ///
    /// # Errors
    /// `StoreInUse` while any workflow is attached.
    pub fn clear(&mut self) -> Result<()> {
        if !self.attached.is_empty() {
            return Err(Error::StoreInUse {
                workflows: self.attached.len(),
            });
        }

        if let Some(log) = &self.log {
            log.truncate()?;
        }
        let cleared = self.entries.len();
        self.entries.clear();
        self.graph.clear();
        self.index.clear();
        clog_debug!("ContextStore cleared {} entries", cleared);
        Ok(())
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("entries", &self.entries.len())
            .field("attached", &self.attached.len())
            .field("persistent", &self.log.is_some())
            .finish()
    }
}

/// Lazy iterator over a store's entries in insertion order.
#[derive(Clone)]
pub struct History<'a> {
    entries: &'a [Arc<ContextEntry>],
    position: usize,
}

impl<'a> Iterator for History<'a> {
    type Item = &'a Arc<ContextEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.position)?;
        self.position += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for History<'_> {}
