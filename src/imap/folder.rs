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

//! The mailbox abstraction handed to the mail-server framework.
//!
//! An `ImapFolder` is a view of one repository folder for one user in one
//! view mode. It holds a single lazily-fetched `FolderStatus`, which it
//! drops after its own mutations so the next read picks up the new change
//! token. Changes made elsewhere are noticed on `reset()`.
//!
//! Every operation converts errors to `FolderError` at this boundary.

use std::ops::RangeBounds;
use std::sync::Arc;

use log::{info, warn};

use super::listener::{FolderListener, ListenerId, ListenerRegistry};
use super::model::{
    Flag, Flags, FolderStatus, Seqnum, StoredMessage, Uid, ViewMode,
};
use super::service::{ImapService, DELIMITER};
use super::transaction::Transaction;
use crate::repository::{Access, Action, Marker, NodeRef};
use crate::support::error::{Error, FolderError};

pub struct ImapFolder {
    service: Arc<ImapService>,
    user: String,
    node: NodeRef,
    name: String,
    full_name: String,
    mode: ViewMode,
    read_only: bool,
    selectable: bool,
    log_prefix: String,
    status: Option<Arc<FolderStatus>>,
    listeners: ListenerRegistry,
}

impl ImapFolder {
    pub fn open(
        service: Arc<ImapService>,
        user: &str,
        node: NodeRef,
        mode: ViewMode,
    ) -> Result<Self, FolderError> {
        let (path, read_only, selectable) =
            service.transactions().run(true, user, |tx| {
                let session = tx.session();
                if !session.exists(node) {
                    return Err(Error::NxFolder);
                }

                let mut path = Vec::new();
                let mut current = node;
                loop {
                    let parents = session.parents(current)?;
                    let parent = match parents.first() {
                        Some(&p) => p,
                        // The repository root is not part of the name
                        None => break,
                    };
                    path.push(session.item(current)?.name);
                    current = parent;
                }
                path.reverse();

                let read_only = Access::Denied
                    == session.has_permission(
                        user,
                        node,
                        Action::CreateChildren,
                    );
                let selectable =
                    !session.has_marker(node, Marker::NonSelectable)?;
                Ok((path, read_only, selectable))
            })?;

        let full_name = path.join(DELIMITER.to_string().as_str());
        let name = path.last().cloned().unwrap_or_default();
        Ok(ImapFolder {
            log_prefix: format!("{}:{}", user, full_name),
            service,
            user: user.to_owned(),
            node,
            name,
            full_name,
            mode,
            read_only,
            selectable,
            status: None,
            listeners: ListenerRegistry::new(),
        })
    }

    pub fn node(&self) -> NodeRef {
        self.node
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full hierarchical name, with components separated by `.`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn view_mode(&self) -> ViewMode {
        self.mode
    }

    pub fn is_selectable(&self) -> bool {
        self.selectable
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn permanent_flags(&self) -> Flags {
        Flags::PERMANENT
    }

    pub fn add_listener(&self, listener: Arc<dyn FolderListener>) -> ListenerId {
        self.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }

    /// Forget the held status and check whether the folder still exists.
    ///
    /// If this returns false, the instance must be discarded.
    pub fn reset(&mut self) -> bool {
        self.status = None;
        self.service.repository().exists(self.node)
    }

    fn status(&mut self) -> Result<Arc<FolderStatus>, Error> {
        if let Some(ref status) = self.status {
            return Ok(Arc::clone(status));
        }

        let service = &self.service;
        let (user, node, mode) = (&self.user, self.node, self.mode);
        let status = service
            .transactions()
            .run(true, &self.log_prefix, |tx| {
                service.folder_status(tx, user, node, mode)
            })?;
        self.status = Some(Arc::clone(&status));
        Ok(status)
    }

    pub fn message_count(&mut self) -> Result<u32, FolderError> {
        Ok(self.status()?.message_count)
    }

    pub fn uids(&mut self) -> Result<Vec<Uid>, FolderError> {
        Ok(self.status()?.search.keys().copied().collect())
    }

    /// Return the sequence number of `uid`.
    ///
    /// A UID absent from the folder is a fatal error.
    pub fn get_msn(&mut self, uid: Uid) -> Result<Seqnum, FolderError> {
        Ok(self.status()?.seqnum(uid).ok_or(Error::NxMessage)?)
    }

    pub fn first_unseen(&mut self) -> Result<u32, FolderError> {
        Ok(self.status()?.first_unseen)
    }

    pub fn unseen_count(&mut self) -> Result<u32, FolderError> {
        Ok(self.status()?.unseen_count)
    }

    pub fn uid_validity(&mut self) -> Result<u64, FolderError> {
        Ok(self.status()?.uid_validity)
    }

    pub fn uid_next(&mut self) -> Result<Uid, FolderError> {
        Ok(self.status()?.uid_next())
    }

    /// Return the number of `\Recent` messages.
    ///
    /// If `reset` is true, `\Recent` is then cleared from all of them. The
    /// held status is kept, so until the next `reset()` this instance still
    /// reports the old recent count. Failure to clear the flag is logged and
    /// does not fail the call.
    pub fn recent_count(&mut self, reset: bool) -> Result<u32, FolderError> {
        let status = self.status()?;
        if !reset || 0 == status.recent_count || self.read_only {
            return Ok(status.recent_count);
        }

        let result = self.service.transactions().run(
            false,
            &self.log_prefix,
            |tx| {
                for item in status.search.values() {
                    if tx.session().exists(item.node)
                        && tx.session().has_marker(item.node, Marker::Recent)?
                    {
                        tx.set_marker(item.node, Marker::Recent, false)?;
                    }
                }
                Ok(())
            },
        );
        if let Err(e) = result {
            warn!("{} Failed to reset \\Recent: {}", self.log_prefix, e);
        }

        Ok(status.recent_count)
    }

    fn stored_message(
        &self,
        tx: &Transaction<'_>,
        uid: Uid,
        status: &FolderStatus,
    ) -> Result<StoredMessage, Error> {
        let item = status.search.get(&uid).ok_or(Error::NxMessage)?;
        if !tx.session().exists(item.node) {
            return Err(Error::NxMessage);
        }

        Ok(StoredMessage {
            uid,
            item: item.clone(),
            flags: self.service.get_flags(tx, item.node)?,
        })
    }

    fn collect_messages(
        &mut self,
        filter: impl Fn(Uid, &StoredMessage) -> bool,
    ) -> Result<Vec<StoredMessage>, FolderError> {
        let status = self.status()?;
        let this = &*self;
        let messages = this.service.transactions().run(
            true,
            &this.log_prefix,
            |tx| {
                let mut ret = Vec::new();
                for &uid in status.search.keys() {
                    match this.stored_message(tx, uid, &status) {
                        Ok(m) => {
                            if filter(uid, &m) {
                                ret.push(m);
                            }
                        }
                        // Deleted since the status was computed
                        Err(Error::NxMessage) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(ret)
            },
        )?;
        Ok(messages)
    }

    pub fn messages(&mut self) -> Result<Vec<StoredMessage>, FolderError> {
        self.collect_messages(|_, _| true)
    }

    pub fn non_deleted_messages(
        &mut self,
    ) -> Result<Vec<StoredMessage>, FolderError> {
        self.collect_messages(|_, m| !m.flags.contains(Flags::DELETED))
    }

    pub fn messages_in_range(
        &mut self,
        range: impl RangeBounds<Uid>,
    ) -> Result<Vec<StoredMessage>, FolderError> {
        self.collect_messages(|uid, _| range.contains(&uid))
    }

    pub fn message(&mut self, uid: Uid) -> Result<StoredMessage, FolderError> {
        let status = self.status()?;
        let this = &*self;
        Ok(this.service.transactions().run(
            true,
            &this.log_prefix,
            |tx| this.stored_message(tx, uid, &status),
        )?)
    }

    pub fn message_content(&mut self, uid: Uid) -> Result<Vec<u8>, FolderError> {
        let status = self.status()?;
        let node = status.search.get(&uid).ok_or(Error::NxMessage)?.node;
        Ok(self.service.transactions().run(true, &self.log_prefix, |tx| {
            tx.session().read_content(node).map_err(|e| {
                if e.is_not_found() {
                    Error::NxMessage
                } else {
                    e
                }
            })
        })?)
    }

    fn not_read_only(&self) -> Result<(), Error> {
        if self.read_only {
            Err(Error::MailboxReadOnly)
        } else {
            Ok(())
        }
    }

    /// Run a read-write transaction, then drop the held status.
    fn mutate<R>(
        &mut self,
        work: impl FnMut(&mut Transaction<'_>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let result =
            self.service
                .transactions()
                .run(false, &self.log_prefix, work);
        self.status = None;
        result
    }

    /// Add a new message to the folder, returning its UID.
    pub fn append_message(
        &mut self,
        name: &str,
        content: &[u8],
        flags: Flags,
    ) -> Result<Uid, FolderError> {
        self.not_read_only()?;

        let service = Arc::clone(&self.service);
        let user = self.user.clone();
        let node = self.node;
        let uid = self.mutate(|tx| {
            let info = tx.create_content(node, name, content)?;
            tx.set_marker(info.node, Marker::MailContent, true)?;
            service.set_flags(tx, &user, info.node, flags, true)?;
            Ok(Uid(info.db_id))
        })?;

        info!("{} Appended message {}", self.log_prefix, uid);
        Ok(uid)
    }

    /// Copy the message with the given UID into `dest`, returning the UID of
    /// the copy.
    pub fn copy_message(
        &mut self,
        uid: Uid,
        dest: NodeRef,
    ) -> Result<Uid, FolderError> {
        let src = self
            .status()?
            .search
            .get(&uid)
            .ok_or(Error::NxMessage)?
            .node;

        let user = self.user.clone();
        let copy = self.mutate(|tx| {
            if !tx.session().exists(src) {
                return Err(Error::NxMessage);
            }
            if Access::Denied
                == tx
                    .session()
                    .has_permission(&user, dest, Action::CreateChildren)
            {
                return Err(Error::PermissionDenied(
                    "No permission to create messages in destination"
                        .to_owned(),
                ));
            }
            tx.copy_node(src, dest)
        })?;

        Ok(Uid(copy.db_id))
    }

    /// Delete every message carrying `\Deleted`, returning their UIDs.
    pub fn expunge(&mut self) -> Result<Vec<Uid>, FolderError> {
        self.not_read_only()?;

        let status = self.status()?;
        let user = self.user.clone();
        let expunged = self.mutate(|tx| {
            let mut expunged = Vec::new();
            for (&uid, item) in &status.search {
                if !tx.session().exists(item.node)
                    || !tx.session().has_marker(item.node, Marker::Deleted)?
                {
                    continue;
                }

                if Access::Denied
                    == tx.session().has_permission(
                        &user,
                        item.node,
                        Action::Delete,
                    )
                {
                    return Err(Error::PermissionDenied(format!(
                        "No permission to delete message {}",
                        uid
                    )));
                }

                tx.delete_node(item.node)?;
                expunged.push(uid);
            }
            Ok(expunged)
        })?;

        if !expunged.is_empty() {
            info!(
                "{} Expunged {} message(s)",
                self.log_prefix,
                expunged.len()
            );
        }
        Ok(expunged)
    }

    /// Mark every message `\Deleted`.
    pub fn delete_all_messages(&mut self) -> Result<(), FolderError> {
        self.not_read_only()?;

        let status = self.status()?;
        let service = Arc::clone(&self.service);
        let user = self.user.clone();
        self.mutate(|tx| {
            for item in status.search.values() {
                if tx.session().exists(item.node) {
                    service.set_flag(tx, &user, item.node, Flag::Deleted, true)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Set or clear `flags` on the message with the given UID.
    ///
    /// Listeners other than `silent` are notified of the resulting flags.
    /// Returns the resulting flags.
    pub fn set_flags(
        &mut self,
        flags: Flags,
        value: bool,
        uid: Uid,
        silent: Option<ListenerId>,
        add_uid: bool,
    ) -> Result<Flags, FolderError> {
        self.update_flags(uid, silent, add_uid, |service, tx, user, node| {
            service.set_flags(tx, user, node, flags, value)
        })
    }

    /// Replace the permanent flags of the message with the given UID.
    ///
    /// `\Recent` is left alone.
    pub fn replace_flags(
        &mut self,
        flags: Flags,
        uid: Uid,
        silent: Option<ListenerId>,
        add_uid: bool,
    ) -> Result<Flags, FolderError> {
        self.update_flags(uid, silent, add_uid, |service, tx, user, node| {
            let current = service.get_flags(tx, node)? & Flags::PERMANENT;
            let clear = current - flags;
            let set = (flags & Flags::PERMANENT) - current;
            service.set_flags(tx, user, node, clear, false)?;
            service.set_flags(tx, user, node, set, true)
        })
    }

    fn update_flags(
        &mut self,
        uid: Uid,
        silent: Option<ListenerId>,
        add_uid: bool,
        change: impl Fn(
            &ImapService,
            &mut Transaction<'_>,
            &str,
            NodeRef,
        ) -> Result<(), Error>,
    ) -> Result<Flags, FolderError> {
        let status = self.status()?;
        let msn = status.seqnum(uid).ok_or(Error::NxMessage)?;
        let node = status.search[&uid].node;

        let service = Arc::clone(&self.service);
        let user = self.user.clone();
        let flags = self.mutate(|tx| {
            if !tx.session().exists(node) {
                return Err(Error::NxMessage);
            }
            change(&*service, tx, user.as_str(), node)?;
            service.get_flags(tx, node)
        })?;

        self.listeners.notify_flag_update(
            msn,
            flags,
            if add_uid { Some(uid) } else { None },
            silent,
        );
        Ok(flags)
    }
}
