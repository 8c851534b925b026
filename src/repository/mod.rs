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

//! Interfaces to the content repository underlying the IMAP view.
//!
//! The repository owns the node graph: folders, content items, their
//! markers (aspects and flag properties) and arbitrary properties. It also
//! owns transactions. Nothing in the IMAP layer persists anything except
//! through these interfaces.
//!
//! All reads and writes happen within a `Session`, which represents one
//! ambient transaction. Sessions are snapshot-isolated; a read-write session
//! that loses a race with another committer fails to commit with
//! `Error::TransientConflict`, and the caller is expected to retry the whole
//! unit of work.
//!
//! The only operation available outside a session is `cas_properties`, an
//! atomic compare-and-set on a single node, which exists so that two readers
//! cannot both establish a different initial change token for the same
//! folder.

use std::collections::BTreeSet;
use std::fmt;

use crate::support::error::Error;

pub mod memory;

/// Identifies a node in the repository.
///
/// This is the handle of the node and is unrelated to its `db_id`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(pub u64);

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NodeRef({})", self.0)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node://{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Folder,
    Content,
}

/// A point-in-time description of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemInfo {
    pub node: NodeRef,
    /// The stable numeric identifier of the node.
    ///
    /// These are allocated from a single sequence shared by the whole
    /// repository, so within any one folder they are increasing in creation
    /// order but not contiguous.
    pub db_id: u64,
    pub name: String,
    pub kind: NodeKind,
}

impl ItemInfo {
    pub fn is_content(&self) -> bool {
        NodeKind::Content == self.kind
    }
}

/// Boolean markers which can be attached to a node.
///
/// The first six are the IMAP system flags, stored as boolean properties on
/// content items. The rest are aspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Marker {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Recent,
    /// The item was created as an IMAP message, as opposed to being an
    /// ordinary document which happens to live in a mail folder.
    MailContent,
    /// The folder is exposed as an IMAP mailbox.
    ImapFolder,
    /// The folder is listed but cannot be selected.
    NonSelectable,
}

/// Named properties understood by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Property {
    /// Opaque text value regenerated whenever the membership of a folder
    /// changes.
    ChangeToken,
    /// The current UIDVALIDITY of a folder.
    UidValidity,
    /// The greatest `db_id` ever observed in a folder.
    MaxUid,
    Name,
    Title,
    Author,
    Description,
    ContentUrl,
    /// The users who have unsubscribed from a folder. Folders are
    /// subscribed by default.
    Unsubscribed,
}

impl Property {
    pub fn name(self) -> &'static str {
        match self {
            Property::ChangeToken => "imap:changeToken",
            Property::UidValidity => "imap:uidValidity",
            Property::MaxUid => "imap:maxUid",
            Property::Name => "cm:name",
            Property::Title => "cm:title",
            Property::Author => "cm:author",
            Property::Description => "cm:description",
            Property::ContentUrl => "cm:contentUrl",
            Property::Unsubscribed => "imap:unsubscribed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropValue {
    Text(String),
    Long(i64),
    Bool(bool),
    Users(BTreeSet<String>),
}

impl PropValue {
    pub fn as_text(&self, prop: Property) -> Result<&str, Error> {
        match *self {
            PropValue::Text(ref s) => Ok(s),
            _ => Err(Error::BadProperty(prop.name())),
        }
    }

    pub fn as_long(&self, prop: Property) -> Result<i64, Error> {
        match *self {
            PropValue::Long(v) => Ok(v),
            _ => Err(Error::BadProperty(prop.name())),
        }
    }

    pub fn as_users(
        &self,
        prop: Property,
    ) -> Result<&BTreeSet<String>, Error> {
        match *self {
            PropValue::Users(ref users) => Ok(users),
            _ => Err(Error::BadProperty(prop.name())),
        }
    }
}

/// Operations subject to permission checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Read,
    WriteProperties,
    Delete,
    CreateChildren,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// A repository of nodes.
pub trait Repository: Send + Sync {
    /// Start a new transaction.
    fn begin(&self, read_only: bool) -> Result<Box<dyn Session + '_>, Error>;

    /// Check whether `node` currently exists in committed state.
    fn exists(&self, node: NodeRef) -> bool;

    /// Atomically apply `writes` to `node` iff its property `guard.0`
    /// currently has the value `guard.1` (`None` meaning absent).
    ///
    /// Returns whether the writes were applied. This bypasses permission
    /// checks and is immediately visible to new sessions.
    fn cas_properties(
        &self,
        node: NodeRef,
        guard: (Property, Option<PropValue>),
        writes: Vec<(Property, PropValue)>,
    ) -> Result<bool, Error>;
}

/// One transaction against a `Repository`.
///
/// All mutations are invisible to other sessions until `commit()`.
/// Mutations fail with `Error::ReadOnlyTransaction` on read-only sessions.
pub trait Session {
    fn read_only(&self) -> bool;

    fn exists(&self, node: NodeRef) -> bool;
    fn item(&self, node: NodeRef) -> Result<ItemInfo, Error>;
    /// List the direct children of `folder`, in no particular order.
    ///
    /// No permission filtering is applied.
    fn list_children(&self, folder: NodeRef) -> Result<Vec<ItemInfo>, Error>;
    fn parents(&self, node: NodeRef) -> Result<Vec<NodeRef>, Error>;
    fn has_marker(&self, node: NodeRef, marker: Marker) -> Result<bool, Error>;
    fn get_property(
        &self,
        node: NodeRef,
        prop: Property,
    ) -> Result<Option<PropValue>, Error>;
    fn read_content(&self, node: NodeRef) -> Result<Vec<u8>, Error>;
    fn has_permission(&self, user: &str, node: NodeRef, action: Action)
        -> Access;

    fn set_marker(
        &mut self,
        node: NodeRef,
        marker: Marker,
        value: bool,
    ) -> Result<(), Error>;
    fn set_property(
        &mut self,
        node: NodeRef,
        prop: Property,
        value: PropValue,
    ) -> Result<(), Error>;
    fn create_content(
        &mut self,
        parent: NodeRef,
        name: &str,
        content: &[u8],
    ) -> Result<ItemInfo, Error>;
    fn create_folder(
        &mut self,
        parent: NodeRef,
        name: &str,
    ) -> Result<ItemInfo, Error>;
    /// Copy a content node into `dest`, giving the copy a fresh `db_id`.
    fn copy_node(
        &mut self,
        node: NodeRef,
        dest: NodeRef,
    ) -> Result<ItemInfo, Error>;
    fn move_node(&mut self, node: NodeRef, dest: NodeRef) -> Result<(), Error>;
    /// Delete the node, moving it to the archive.
    fn delete_node(&mut self, node: NodeRef) -> Result<(), Error>;
    /// Restore an archived node to its original parent, which is returned.
    ///
    /// The node keeps its `db_id`.
    fn restore_node(&mut self, node: NodeRef) -> Result<NodeRef, Error>;

    fn commit(self: Box<Self>) -> Result<(), Error>;
    fn rollback(self: Box<Self>);
}
