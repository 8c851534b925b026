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

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};

use super::change_token;
use super::folder_cache::FolderStatusCache;
use super::model::{CacheKey, Flag, Flags, FolderStatus, Uid, ViewMode};
use super::transaction::{Transaction, TransactionHelper};
use super::uid_validity::next_uid_validity;
use crate::repository::{Access, Action, ItemInfo, Marker, NodeRef, Repository};
use crate::support::error::Error;
use crate::support::system_config::ImapConfig;

/// Process-wide IMAP state: the folder status cache and the transaction
/// policy.
///
/// One instance is shared by every session of the server.
pub struct ImapService {
    transactions: TransactionHelper,
    cache: FolderStatusCache,
    computations: AtomicU64,
}

impl ImapService {
    pub fn new(repo: Arc<dyn Repository>, config: &ImapConfig) -> Self {
        ImapService {
            transactions: TransactionHelper::new(repo, &config.transaction),
            cache: FolderStatusCache::new(config.cache.folder_status_capacity),
            computations: AtomicU64::new(0),
        }
    }

    pub fn transactions(&self) -> &TransactionHelper {
        &self.transactions
    }

    pub fn repository(&self) -> &dyn Repository {
        self.transactions.repository()
    }

    pub fn cache(&self) -> &FolderStatusCache {
        &self.cache
    }

    /// The number of times a folder status has actually been computed, as
    /// opposed to served from the cache.
    pub fn status_computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Compute the status of `folder` as seen by `user` through `mode`, or
    /// fetch it from the cache if the folder has not changed since it was
    /// last computed.
    ///
    /// If `tx` has itself modified the folder, the result reflects those
    /// uncommitted changes and the cache is neither consulted nor filled.
    pub fn folder_status(
        &self,
        tx: &Transaction<'_>,
        user: &str,
        folder: NodeRef,
        mode: ViewMode,
    ) -> Result<Arc<FolderStatus>, Error> {
        let session = tx.session();
        if !session.exists(folder) {
            return Err(Error::NxFolder);
        }

        let dirty = tx.has_tracker(folder);
        let token = change_token::get_token(session, folder)?;
        if let (false, Some(token)) = (dirty, token.as_ref()) {
            let key = CacheKey::new(user, token, mode);
            if let Some(status) = self.cache.get(&key) {
                return Ok(status);
            }
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let mut search = BTreeMap::<Uid, ItemInfo>::new();
        // Over all content, regardless of visibility
        let mut max_uid = 0u64;
        for child in session.list_children(folder)? {
            if !child.is_content() {
                continue;
            }
            max_uid = max_uid.max(child.db_id);

            if Access::Denied
                == session.has_permission(user, child.node, Action::Read)
            {
                continue;
            }

            let mail = session.has_marker(child.node, Marker::MailContent)?;
            if mode.includes(mail) {
                search.insert(Uid(child.db_id), child);
            }
        }

        let mut recent_count = 0u32;
        let mut unseen_count = 0u32;
        let mut first_unseen = 0u32;
        for (ix, item) in search.values().enumerate() {
            if session.has_marker(item.node, Marker::Recent)? {
                recent_count += 1;
            }
            if !session.has_marker(item.node, Marker::Seen)? {
                unseen_count += 1;
                if 0 == first_unseen {
                    first_unseen = ix as u32 + 1;
                }
            }
        }

        let mut uid_validity = change_token::uid_validity(session, folder)?;
        let (token, cacheable) = match token {
            Some(token) => (token, !dirty),
            None if dirty => (String::new(), false),
            None => {
                let token = change_token::new_token();
                let initial_validity = if 0 == uid_validity {
                    Some(next_uid_validity(0))
                } else {
                    None
                };

                if !change_token::establish(
                    self.repository(),
                    folder,
                    &token,
                    max_uid,
                    initial_validity,
                )? {
                    debug!(
                        "{} Lost race to establish change token; \
                         rereading committed state",
                        tx.log_prefix()
                    );
                    return self.committed_folder_status(
                        user,
                        folder,
                        mode,
                        tx.log_prefix(),
                    );
                }

                debug!(
                    "{} Established change token {} with MAXUID {}",
                    tx.log_prefix(),
                    token,
                    max_uid
                );
                if let Some(initial_validity) = initial_validity {
                    uid_validity = initial_validity;
                }
                (token, true)
            }
        };

        let status = Arc::new(FolderStatus {
            message_count: search.len() as u32,
            recent_count,
            first_unseen,
            unseen_count,
            uid_validity,
            change_token: token.clone(),
            search,
        });

        debug!(
            "{} Computed status: {} messages, {} recent, {} unseen",
            tx.log_prefix(),
            status.message_count,
            status.recent_count,
            status.unseen_count
        );

        if cacheable {
            Ok(self
                .cache
                .insert_or_adopt(CacheKey::new(user, &token, mode), status))
        } else {
            Ok(status)
        }
    }

    /// Compute the status of `folder` in a fresh read-only transaction.
    ///
    /// Used after losing the race to establish the first change token, so
    /// that the result carries the token which was actually persisted.
    fn committed_folder_status(
        &self,
        user: &str,
        folder: NodeRef,
        mode: ViewMode,
        log_prefix: &str,
    ) -> Result<Arc<FolderStatus>, Error> {
        let session = self.repository().begin(true)?;
        let fresh = Transaction::new(session, log_prefix);
        let result = self.folder_status(&fresh, user, folder, mode);
        fresh.rollback();
        result
    }

    pub fn get_flags(
        &self,
        tx: &Transaction<'_>,
        item: NodeRef,
    ) -> Result<Flags, Error> {
        let mut flags = Flags::empty();
        for &flag in Flag::all() {
            if tx.session().has_marker(item, flag.marker())? {
                flags |= flag.into();
            }
        }
        Ok(flags)
    }

    pub fn set_flag(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        item: NodeRef,
        flag: Flag,
        value: bool,
    ) -> Result<(), Error> {
        self.set_flags(tx, user, item, flag.into(), value)
    }

    /// Set or clear every flag in `flags` on `item`.
    ///
    /// `\Deleted` requires delete permission; everything else requires
    /// permission to write properties. A denied `\Seen` is dropped
    /// silently, since readers of shared folders routinely lack write
    /// access. Any other denial fails the whole call before anything is
    /// changed.
    pub fn set_flags(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        item: NodeRef,
        flags: Flags,
        value: bool,
    ) -> Result<(), Error> {
        let mut allowed = Vec::new();
        for flag in flags.iter_flags() {
            let action = if Flag::Deleted == flag {
                Action::Delete
            } else {
                Action::WriteProperties
            };

            if Access::Allowed == tx.session().has_permission(user, item, action)
            {
                allowed.push(flag);
            } else if Flag::Seen == flag {
                info!(
                    "{} Ignoring {} on {}: no write permission",
                    tx.log_prefix(),
                    flag,
                    item
                );
            } else {
                return Err(Error::PermissionDenied(format!(
                    "No permission to set {} flag",
                    flag
                )));
            }
        }

        for flag in allowed {
            tx.set_marker(item, flag.marker(), value)?;
        }

        Ok(())
    }

    /// Create a new IMAP-visible folder.
    pub fn create_mailbox(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        parent: NodeRef,
        name: &str,
    ) -> Result<NodeRef, Error> {
        if name.is_empty() || name.contains(DELIMITER) {
            return Err(Error::Invalid("bad mailbox name"));
        }
        if Access::Denied
            == tx
                .session()
                .has_permission(user, parent, Action::CreateChildren)
        {
            return Err(Error::PermissionDenied(format!(
                "No permission to create folders in {}",
                parent
            )));
        }

        let folder = tx.create_folder(parent, name)?.node;
        tx.set_marker(folder, Marker::ImapFolder, true)?;
        info!("{} Created mailbox {}", tx.log_prefix(), name);
        Ok(folder)
    }

    /// Find the folder at `path` (components separated by `.`) under
    /// `root`.
    pub fn resolve_mailbox(
        &self,
        tx: &Transaction<'_>,
        root: NodeRef,
        path: &str,
    ) -> Result<NodeRef, Error> {
        let mut current = root;
        for part in path.split(DELIMITER) {
            current = self
                .child_folder(tx, current, part)?
                .ok_or(Error::NxFolder)?;
        }
        Ok(current)
    }

    /// Find the immediate subfolder of `parent` called `name`.
    pub(super) fn child_folder(
        &self,
        tx: &Transaction<'_>,
        parent: NodeRef,
        name: &str,
    ) -> Result<Option<NodeRef>, Error> {
        Ok(tx
            .session()
            .list_children(parent)?
            .into_iter()
            .find(|c| !c.is_content() && c.name == name)
            .map(|c| c.node))
    }
}

/// Separates the components of hierarchical mailbox names.
pub const DELIMITER: char = '.';
