//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Repo-IMAP.
//
// Repo-IMAP is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Repo-IMAP is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Repo-IMAP. If not, see <http://www.gnu.org/licenses/>.

//! An in-memory `Repository`.
//!
//! This is a complete but unoptimised implementation of the repository
//! contract, used by the tests and by the command-line tool to evaluate
//! fixtures.
//!
//! Each session takes a full copy of the committed state when it begins.
//! Every node carries a version number incremented whenever a commit (or a
//! `cas_properties` call) changes it. At commit time, every node the session
//! wrote must still be at the version the session originally saw; otherwise
//! the commit fails with `Error::TransientConflict` and nothing is applied.
//!
//! Node identifiers and `db_id`s come from one process-wide sequence that is
//! not rolled back, so identifiers are increasing in allocation order but a
//! rolled-back transaction leaves a gap.
//!
//! Deleted nodes are not removed; they are detached from their parent and
//! remember where they came from so that `restore_node` can put them back.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use log::debug;

use super::*;
use crate::support::error::Error;

#[derive(Clone, Debug)]
struct Node {
    kind: NodeKind,
    name: String,
    db_id: u64,
    parent: Option<NodeRef>,
    /// If set, the node has been deleted from this parent.
    archived_from: Option<NodeRef>,
    markers: BTreeSet<Marker>,
    props: BTreeMap<Property, PropValue>,
    content: Vec<u8>,
    version: u64,
}

#[derive(Clone, Debug, Default)]
struct State {
    nodes: HashMap<NodeRef, Node>,
}

impl State {
    fn raw(&self, node: NodeRef) -> Result<&Node, Error> {
        self.nodes.get(&node).ok_or(Error::NxNode)
    }

    fn exists(&self, node: NodeRef) -> bool {
        let mut current = node;
        loop {
            match self.nodes.get(&current) {
                None => return false,
                Some(n) if n.archived_from.is_some() => return false,
                Some(n) => match n.parent {
                    None => return true,
                    Some(p) => current = p,
                },
            }
        }
    }

    fn live(&self, node: NodeRef) -> Result<&Node, Error> {
        if self.exists(node) {
            self.raw(node)
        } else {
            Err(Error::NxNode)
        }
    }

    fn info(&self, node: NodeRef) -> Result<ItemInfo, Error> {
        self.live(node).map(|n| ItemInfo {
            node,
            db_id: n.db_id,
            name: n.name.clone(),
            kind: n.kind,
        })
    }

    fn ancestry(&self, node: NodeRef) -> Vec<NodeRef> {
        let mut ret = Vec::new();
        let mut current = Some(node);
        while let Some(n) = current {
            ret.push(n);
            current = self
                .nodes
                .get(&n)
                .and_then(|n| n.parent.or(n.archived_from));
        }
        ret
    }
}

/// See module docs.
pub struct MemoryRepository {
    root: NodeRef,
    sequence: AtomicU64,
    committed: Mutex<State>,
    /// Denied (user, node, action) triples. Denials are inherited by
    /// descendants.
    denials: RwLock<HashSet<(String, NodeRef, Action)>>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    /// Create a repository containing only a root folder.
    pub fn new() -> Self {
        let root = NodeRef(1);
        let mut state = State::default();
        state.nodes.insert(
            root,
            Node {
                kind: NodeKind::Folder,
                name: String::new(),
                db_id: root.0,
                parent: None,
                archived_from: None,
                markers: BTreeSet::new(),
                props: BTreeMap::new(),
                content: Vec::new(),
                version: 1,
            },
        );

        MemoryRepository {
            root,
            sequence: AtomicU64::new(root.0 + 1),
            committed: Mutex::new(state),
            denials: RwLock::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    /// Ensure the next allocated identifier is at least `id`.
    ///
    /// The sequence never moves backwards.
    pub fn advance_sequence_to(&self, id: u64) {
        self.sequence.fetch_max(id, Ordering::SeqCst);
    }

    /// Deny `user` the given action on `node` and everything beneath it.
    pub fn deny(&self, user: &str, node: NodeRef, action: Action) {
        self.denials
            .write()
            .unwrap()
            .insert((user.to_owned(), node, action));
    }

    /// Lift a denial previously set by `deny()`.
    pub fn allow(&self, user: &str, node: NodeRef, action: Action) {
        self.denials
            .write()
            .unwrap()
            .remove(&(user.to_owned(), node, action));
    }

    fn allocate_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

impl Repository for MemoryRepository {
    fn begin(&self, read_only: bool) -> Result<Box<dyn Session + '_>, Error> {
        let snapshot = self.committed.lock().unwrap().clone();
        Ok(Box::new(MemorySession {
            repo: self,
            read_only,
            snapshot,
            written: HashMap::new(),
        }))
    }

    fn exists(&self, node: NodeRef) -> bool {
        self.committed.lock().unwrap().exists(node)
    }

    fn cas_properties(
        &self,
        node: NodeRef,
        guard: (Property, Option<PropValue>),
        writes: Vec<(Property, PropValue)>,
    ) -> Result<bool, Error> {
        let mut state = self.committed.lock().unwrap();
        if !state.exists(node) {
            return Err(Error::NxNode);
        }

        let n = state.nodes.get_mut(&node).ok_or(Error::NxNode)?;
        let (guard_prop, expected) = guard;
        if n.props.get(&guard_prop) != expected.as_ref() {
            return Ok(false);
        }

        for (prop, value) in writes {
            n.props.insert(prop, value);
        }
        n.version += 1;
        Ok(true)
    }
}

struct MemorySession<'a> {
    repo: &'a MemoryRepository,
    read_only: bool,
    snapshot: State,
    /// Every node this session has modified, along with the version it had
    /// when the session began (`None` if created by this session).
    written: HashMap<NodeRef, Option<u64>>,
}

impl MemorySession<'_> {
    fn writable(&self) -> Result<(), Error> {
        if self.read_only {
            Err(Error::ReadOnlyTransaction)
        } else {
            Ok(())
        }
    }

    fn node_mut(&mut self, node: NodeRef) -> Result<&mut Node, Error> {
        self.writable()?;
        let n = self.snapshot.nodes.get_mut(&node).ok_or(Error::NxNode)?;
        let version = n.version;
        self.written.entry(node).or_insert(Some(version));
        Ok(n)
    }

    fn insert_new(&mut self, node: NodeRef, n: Node) {
        self.snapshot.nodes.insert(node, n);
        self.written.insert(node, None);
    }

    fn require_folder(&self, node: NodeRef) -> Result<(), Error> {
        match self.snapshot.live(node)?.kind {
            NodeKind::Folder => Ok(()),
            NodeKind::Content => Err(Error::NxFolder),
        }
    }
}

impl Session for MemorySession<'_> {
    fn read_only(&self) -> bool {
        self.read_only
    }

    fn exists(&self, node: NodeRef) -> bool {
        self.snapshot.exists(node)
    }

    fn item(&self, node: NodeRef) -> Result<ItemInfo, Error> {
        self.snapshot.info(node)
    }

    fn list_children(&self, folder: NodeRef) -> Result<Vec<ItemInfo>, Error> {
        self.require_folder(folder)?;
        Ok(self
            .snapshot
            .nodes
            .iter()
            .filter(|&(_, n)| {
                Some(folder) == n.parent && n.archived_from.is_none()
            })
            .map(|(&node, n)| ItemInfo {
                node,
                db_id: n.db_id,
                name: n.name.clone(),
                kind: n.kind,
            })
            .collect())
    }

    fn parents(&self, node: NodeRef) -> Result<Vec<NodeRef>, Error> {
        Ok(self.snapshot.live(node)?.parent.into_iter().collect())
    }

    fn has_marker(&self, node: NodeRef, marker: Marker) -> Result<bool, Error> {
        Ok(self.snapshot.live(node)?.markers.contains(&marker))
    }

    fn get_property(
        &self,
        node: NodeRef,
        prop: Property,
    ) -> Result<Option<PropValue>, Error> {
        let n = self.snapshot.live(node)?;
        Ok(match prop {
            Property::Name => Some(PropValue::Text(n.name.clone())),
            _ => n.props.get(&prop).cloned(),
        })
    }

    fn read_content(&self, node: NodeRef) -> Result<Vec<u8>, Error> {
        Ok(self.snapshot.live(node)?.content.clone())
    }

    fn has_permission(
        &self,
        user: &str,
        node: NodeRef,
        action: Action,
    ) -> Access {
        let denials = self.repo.denials.read().unwrap();
        if denials.is_empty() {
            return Access::Allowed;
        }

        let denied = self
            .snapshot
            .ancestry(node)
            .into_iter()
            .any(|n| denials.contains(&(user.to_owned(), n, action)));
        if denied {
            Access::Denied
        } else {
            Access::Allowed
        }
    }

    fn set_marker(
        &mut self,
        node: NodeRef,
        marker: Marker,
        value: bool,
    ) -> Result<(), Error> {
        self.snapshot.live(node)?;
        let n = self.node_mut(node)?;
        if value {
            n.markers.insert(marker);
        } else {
            n.markers.remove(&marker);
        }
        Ok(())
    }

    fn set_property(
        &mut self,
        node: NodeRef,
        prop: Property,
        value: PropValue,
    ) -> Result<(), Error> {
        self.snapshot.live(node)?;
        let n = self.node_mut(node)?;
        if Property::Name == prop {
            n.name = value.as_text(prop)?.to_owned();
        } else {
            n.props.insert(prop, value);
        }
        Ok(())
    }

    fn create_content(
        &mut self,
        parent: NodeRef,
        name: &str,
        content: &[u8],
    ) -> Result<ItemInfo, Error> {
        self.writable()?;
        self.require_folder(parent)?;

        let id = self.repo.allocate_id();
        let node = NodeRef(id);
        let mut props = BTreeMap::new();
        props.insert(
            Property::ContentUrl,
            PropValue::Text(format!("store://{}", id)),
        );
        self.insert_new(
            node,
            Node {
                kind: NodeKind::Content,
                name: name.to_owned(),
                db_id: id,
                parent: Some(parent),
                archived_from: None,
                markers: BTreeSet::new(),
                props,
                content: content.to_vec(),
                version: 0,
            },
        );
        debug!("memory repository: created {} under {}", node, parent);
        self.snapshot.info(node)
    }

    fn create_folder(
        &mut self,
        parent: NodeRef,
        name: &str,
    ) -> Result<ItemInfo, Error> {
        self.writable()?;
        self.require_folder(parent)?;
        if self.list_children(parent)?.iter().any(|c| c.name == name) {
            return Err(Error::NameInUse);
        }

        let id = self.repo.allocate_id();
        let node = NodeRef(id);
        self.insert_new(
            node,
            Node {
                kind: NodeKind::Folder,
                name: name.to_owned(),
                db_id: id,
                parent: Some(parent),
                archived_from: None,
                markers: BTreeSet::new(),
                props: BTreeMap::new(),
                content: Vec::new(),
                version: 0,
            },
        );
        self.snapshot.info(node)
    }

    fn copy_node(
        &mut self,
        node: NodeRef,
        dest: NodeRef,
    ) -> Result<ItemInfo, Error> {
        self.writable()?;
        self.require_folder(dest)?;
        let src = self.snapshot.live(node)?.clone();
        if NodeKind::Content != src.kind {
            return Err(Error::NxMessage);
        }

        let id = self.repo.allocate_id();
        let copy = NodeRef(id);
        let mut props = src.props;
        props.insert(
            Property::ContentUrl,
            PropValue::Text(format!("store://{}", id)),
        );
        self.insert_new(
            copy,
            Node {
                db_id: id,
                parent: Some(dest),
                archived_from: None,
                props,
                version: 0,
                ..src
            },
        );
        self.snapshot.info(copy)
    }

    fn move_node(&mut self, node: NodeRef, dest: NodeRef) -> Result<(), Error> {
        self.require_folder(dest)?;
        self.snapshot.live(node)?;
        if self.snapshot.ancestry(dest).contains(&node) {
            return Err(Error::Invalid("cannot move a folder beneath itself"));
        }
        self.node_mut(node)?.parent = Some(dest);
        Ok(())
    }

    fn delete_node(&mut self, node: NodeRef) -> Result<(), Error> {
        let parent = self.snapshot.live(node)?.parent.ok_or(Error::NxNode)?;
        let n = self.node_mut(node)?;
        n.parent = None;
        n.archived_from = Some(parent);
        Ok(())
    }

    fn restore_node(&mut self, node: NodeRef) -> Result<NodeRef, Error> {
        let parent =
            self.snapshot.raw(node)?.archived_from.ok_or(Error::NxNode)?;
        if !self.snapshot.exists(parent) {
            return Err(Error::NxFolder);
        }

        let n = self.node_mut(node)?;
        n.parent = Some(parent);
        n.archived_from = None;
        Ok(parent)
    }

    fn commit(self: Box<Self>) -> Result<(), Error> {
        if self.written.is_empty() {
            return Ok(());
        }

        let MemorySession {
            repo,
            mut snapshot,
            written,
            ..
        } = *self;

        let mut committed = repo.committed.lock().unwrap();
        for (&node, &base) in &written {
            let current = committed.nodes.get(&node).map(|n| n.version);
            if current != base {
                debug!(
                    "memory repository: conflict on {} ({:?} != {:?})",
                    node, current, base
                );
                return Err(Error::TransientConflict);
            }
        }

        for (node, base) in written {
            if let Some(mut n) = snapshot.nodes.remove(&node) {
                n.version = base.unwrap_or(0) + 1;
                committed.nodes.insert(node, n);
            }
        }

        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}
