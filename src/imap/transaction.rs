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
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use super::uid_validity::UidValidityTracker;
use crate::repository::{
    ItemInfo, Marker, NodeKind, NodeRef, PropValue, Property, Repository,
    Session,
};
use crate::support::error::Error;
use crate::support::system_config::TransactionConfig;

/// Properties whose change alters what a client would see in a message it
/// has already fetched.
const SIGNIFICANT_PROPERTIES: &[Property] = &[
    Property::Name,
    Property::Title,
    Property::Author,
    Property::Description,
    Property::ContentUrl,
];

/// One unit of work against the repository, plus the IMAP bookkeeping
/// attached to it.
///
/// Every mutation that can change what an IMAP client sees in a folder must
/// go through the methods here rather than the raw session, so that the
/// affected folder gets a `UidValidityTracker`. Trackers are flushed exactly
/// once, in `commit()`, inside the same session as the changes themselves.
pub struct Transaction<'r> {
    session: Box<dyn Session + 'r>,
    trackers: BTreeMap<NodeRef, UidValidityTracker>,
    log_prefix: String,
}

impl<'r> Transaction<'r> {
    pub fn new(session: Box<dyn Session + 'r>, log_prefix: &str) -> Self {
        Transaction {
            session,
            trackers: BTreeMap::new(),
            log_prefix: log_prefix.to_owned(),
        }
    }

    pub fn read_only(&self) -> bool {
        self.session.read_only()
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Direct read access to the underlying session.
    pub fn session(&self) -> &dyn Session {
        &*self.session
    }

    /// Get the tracker for `folder`, creating it if this transaction has not
    /// touched it yet.
    pub fn tracker(&mut self, folder: NodeRef) -> &mut UidValidityTracker {
        self.trackers
            .entry(folder)
            .or_insert_with(|| UidValidityTracker::new(folder))
    }

    pub fn has_tracker(&self, folder: NodeRef) -> bool {
        self.trackers.contains_key(&folder)
    }

    pub fn create_folder(
        &mut self,
        parent: NodeRef,
        name: &str,
    ) -> Result<ItemInfo, Error> {
        self.session.create_folder(parent, name)
    }

    /// Create a new content item, which starts out `\Recent`.
    pub fn create_content(
        &mut self,
        parent: NodeRef,
        name: &str,
        content: &[u8],
    ) -> Result<ItemInfo, Error> {
        let info = self.session.create_content(parent, name, content)?;
        self.on_new_child(parent, &info)?;
        Ok(info)
    }

    pub fn copy_node(
        &mut self,
        node: NodeRef,
        dest: NodeRef,
    ) -> Result<ItemInfo, Error> {
        let info = self.session.copy_node(node, dest)?;
        self.on_new_child(dest, &info)?;
        Ok(info)
    }

    /// Move `node` under `dest`.
    ///
    /// Moving a node into a folder it is already in does nothing. Only
    /// content counts as an arrival in `dest`; a moved subfolder leaves the
    /// UIDs of both folders alone.
    pub fn move_node(
        &mut self,
        node: NodeRef,
        dest: NodeRef,
    ) -> Result<(), Error> {
        if self.session.parents(node)?.contains(&dest) {
            return Ok(());
        }

        let info = self.session.item(node)?;
        if info.is_content() {
            self.touch_parents(node)?;
        }
        self.session.move_node(node, dest)?;
        if info.is_content() {
            self.tracker(dest).record_new_uid(info.db_id);
        }
        Ok(())
    }

    pub fn delete_node(&mut self, node: NodeRef) -> Result<(), Error> {
        self.touch_parents(node)?;
        self.session.delete_node(node)
    }

    /// Restore an archived item, which comes back unseen and undeleted.
    ///
    /// Returns the folder it was restored into.
    pub fn restore_node(&mut self, node: NodeRef) -> Result<NodeRef, Error> {
        let parent = self.session.restore_node(node)?;
        let info = self.session.item(node)?;
        if info.is_content() {
            self.session.set_marker(node, Marker::Deleted, false)?;
            self.session.set_marker(node, Marker::Seen, false)?;
            self.tracker(parent).record_new_uid(info.db_id);
        }
        Ok(parent)
    }

    pub fn set_marker(
        &mut self,
        node: NodeRef,
        marker: Marker,
        value: bool,
    ) -> Result<(), Error> {
        self.session.set_marker(node, marker, value)?;
        if self.session.item(node)?.is_content() {
            self.touch_parents(node)?;
        }
        Ok(())
    }

    /// Set a property, forcing a new UIDVALIDITY on the containing IMAP
    /// folder if a visible attribute of a message changed.
    pub fn set_property(
        &mut self,
        node: NodeRef,
        prop: Property,
        value: PropValue,
    ) -> Result<(), Error> {
        if !self.session.item(node)?.is_content() {
            return self.session.set_property(node, prop, value);
        }

        let changed = SIGNIFICANT_PROPERTIES.contains(&prop)
            && self.session.get_property(node, prop)?.as_ref() != Some(&value);
        self.session.set_property(node, prop, value)?;

        for parent in self.session.parents(node)? {
            if !self.session.has_marker(parent, Marker::ImapFolder)? {
                continue;
            }

            let tracker = self.tracker(parent);
            if changed {
                tracker.force_new_uid_validity();
            }
        }
        Ok(())
    }

    /// Flush all trackers and commit the session.
    pub fn commit(self) -> Result<(), Error> {
        let Transaction {
            mut session,
            trackers,
            log_prefix,
        } = self;

        if !session.read_only() {
            for tracker in trackers.values() {
                tracker.before_commit(&mut *session, &log_prefix)?;
            }
        }

        session.commit()
    }

    pub fn rollback(self) {
        self.session.rollback();
    }

    fn on_new_child(
        &mut self,
        parent: NodeRef,
        info: &ItemInfo,
    ) -> Result<(), Error> {
        if NodeKind::Content == info.kind {
            self.session.set_marker(info.node, Marker::Recent, true)?;
            self.tracker(parent).record_new_uid(info.db_id);
        }
        Ok(())
    }

    fn touch_parents(&mut self, node: NodeRef) -> Result<(), Error> {
        for parent in self.session.parents(node)? {
            self.tracker(parent);
        }
        Ok(())
    }
}

/// Runs units of work in transactions, retrying on transient conflicts.
#[derive(Clone)]
pub struct TransactionHelper {
    repo: Arc<dyn Repository>,
    max_retries: u32,
    retry_wait: Duration,
}

impl TransactionHelper {
    pub fn new(repo: Arc<dyn Repository>, config: &TransactionConfig) -> Self {
        TransactionHelper {
            repo,
            max_retries: config.max_retries,
            retry_wait: config.retry_wait(),
        }
    }

    pub fn repository(&self) -> &dyn Repository {
        &*self.repo
    }

    /// Run `work` in a new transaction and commit it.
    ///
    /// If `work` or the commit fails with `TransientConflict`, the whole
    /// unit is retried in a fresh transaction, up to `max_retries` times.
    /// Any other error rolls back and is returned immediately.
    pub fn run<R>(
        &self,
        read_only: bool,
        log_prefix: &str,
        mut work: impl FnMut(&mut Transaction<'_>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        for attempt in 0..=self.max_retries {
            if attempt > 0 && self.retry_wait > Duration::from_millis(0) {
                thread::sleep(self.retry_wait);
            }

            let mut tx = Transaction::new(self.repo.begin(read_only)?, log_prefix);
            let result = match work(&mut tx) {
                Ok(result) => result,
                Err(Error::TransientConflict) => {
                    tx.rollback();
                    info!("{} Conflict during transaction, retrying", log_prefix);
                    continue;
                }
                Err(e) => {
                    tx.rollback();
                    return Err(e);
                }
            };

            match tx.commit() {
                Ok(()) => return Ok(result),
                Err(Error::TransientConflict) => {
                    info!("{} Conflict at commit, retrying", log_prefix);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "{} Giving up after {} conflicting attempts",
            log_prefix,
            self.max_retries + 1
        );
        Err(Error::GaveUpRetrying)
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use super::*;
    use crate::imap::change_token;
    use crate::repository::memory::MemoryRepository;

    fn set_up() -> (Arc<MemoryRepository>, NodeRef) {
        let repo = Arc::new(MemoryRepository::new());
        let mut session = repo.begin(false).unwrap();
        let inbox = session.create_folder(repo.root(), "INBOX").unwrap().node;
        session.set_marker(inbox, Marker::ImapFolder, true).unwrap();
        session.commit().unwrap();
        (repo, inbox)
    }

    fn token(repo: &MemoryRepository, folder: NodeRef) -> Option<String> {
        let session = repo.begin(true).unwrap();
        change_token::get_token(&*session, folder).unwrap()
    }

    fn validity(repo: &MemoryRepository, folder: NodeRef) -> u64 {
        let session = repo.begin(true).unwrap();
        change_token::uid_validity(&*session, folder).unwrap()
    }

    fn helper(repo: &Arc<MemoryRepository>, max_retries: u32) -> TransactionHelper {
        TransactionHelper::new(
            Arc::clone(repo) as Arc<dyn Repository>,
            &TransactionConfig {
                max_retries,
                retry_wait_ms: 0,
            },
        )
    }

    #[test]
    fn create_marks_recent_and_refreshes_token() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);

        let info = helper
            .run(false, "test", |tx| tx.create_content(inbox, "a", b"x"))
            .unwrap();

        let session = repo.begin(true).unwrap();
        assert!(session.has_marker(info.node, Marker::Recent).unwrap());
        assert_eq!(
            Some(info.db_id),
            change_token::max_uid(&*session, inbox).unwrap()
        );
        assert!(token(&repo, inbox).is_some());
    }

    #[test]
    fn every_mutation_replaces_token() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        let info = helper
            .run(false, "test", |tx| tx.create_content(inbox, "a", b"x"))
            .unwrap();

        let mut last = token(&repo, inbox);
        let mut check = |what: &str| {
            let now = token(&repo, inbox);
            assert_ne!(last, now, "token unchanged after {}", what);
            last = now;
        };

        helper
            .run(false, "test", |tx| {
                tx.set_marker(info.node, Marker::Seen, true)
            })
            .unwrap();
        check("set_marker");

        helper
            .run(false, "test", |tx| {
                tx.set_property(
                    info.node,
                    Property::Title,
                    PropValue::Text("hello".to_owned()),
                )
            })
            .unwrap();
        check("set_property");

        helper
            .run(false, "test", |tx| tx.delete_node(info.node))
            .unwrap();
        check("delete_node");

        helper
            .run(false, "test", |tx| tx.restore_node(info.node).map(|_| ()))
            .unwrap();
        check("restore_node");
    }

    #[test]
    fn restore_clears_deleted_and_seen() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        let info = helper
            .run(false, "test", |tx| {
                let info = tx.create_content(inbox, "a", b"x")?;
                tx.set_marker(info.node, Marker::Seen, true)?;
                tx.set_marker(info.node, Marker::Deleted, true)?;
                Ok(info)
            })
            .unwrap();
        helper
            .run(false, "test", |tx| tx.delete_node(info.node))
            .unwrap();
        let v1 = validity(&repo, inbox);

        let parent = helper
            .run(false, "test", |tx| tx.restore_node(info.node))
            .unwrap();
        assert_eq!(inbox, parent);

        let session = repo.begin(true).unwrap();
        assert!(!session.has_marker(info.node, Marker::Seen).unwrap());
        assert!(!session.has_marker(info.node, Marker::Deleted).unwrap());
        // The restored UID equals the high-water mark
        assert!(change_token::uid_validity(&*session, inbox).unwrap() > v1);
    }

    #[test]
    fn significant_property_change_forces_new_validity() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        let info = helper
            .run(false, "test", |tx| tx.create_content(inbox, "a", b"x"))
            .unwrap();
        let v1 = validity(&repo, inbox);

        let set_title = |title: &str| {
            helper
                .run(false, "test", |tx| {
                    tx.set_property(
                        info.node,
                        Property::Title,
                        PropValue::Text(title.to_owned()),
                    )
                })
                .unwrap();
        };

        set_title("first");
        let v2 = validity(&repo, inbox);
        assert!(v2 > v1);

        // Same value again is not a change
        set_title("first");
        assert_eq!(v2, validity(&repo, inbox));
    }

    #[test]
    fn moves_touch_both_folders() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        let archive = helper
            .run(false, "test", |tx| {
                tx.create_folder(repo.root(), "Archive").map(|i| i.node)
            })
            .unwrap();
        let info = helper
            .run(false, "test", |tx| tx.create_content(inbox, "a", b"x"))
            .unwrap();
        let inbox_token = token(&repo, inbox);

        helper
            .run(false, "test", |tx| {
                tx.move_node(info.node, archive)?;
                assert!(tx.has_tracker(inbox));
                assert!(tx.has_tracker(archive));
                Ok(())
            })
            .unwrap();

        assert_ne!(inbox_token, token(&repo, inbox));
        let session = repo.begin(true).unwrap();
        assert_eq!(
            Some(info.db_id),
            change_token::max_uid(&*session, archive).unwrap()
        );
    }

    #[test]
    fn moving_subfolder_keeps_uids() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        let (info, sub) = helper
            .run(false, "test", |tx| {
                let info = tx.create_content(inbox, "a", b"x")?;
                let sub = tx.create_folder(repo.root(), "Sub")?.node;
                Ok((info, sub))
            })
            .unwrap();
        let v1 = validity(&repo, inbox);
        let max1 = {
            let session = repo.begin(true).unwrap();
            change_token::max_uid(&*session, inbox).unwrap()
        };
        assert_eq!(Some(info.db_id), max1);

        helper
            .run(false, "test", |tx| {
                tx.move_node(sub, inbox)?;
                assert!(!tx.has_tracker(inbox));
                Ok(())
            })
            .unwrap();

        let session = repo.begin(true).unwrap();
        assert_eq!(vec![inbox], session.parents(sub).unwrap());
        assert_eq!(max1, change_token::max_uid(&*session, inbox).unwrap());
        assert_eq!(v1, validity(&repo, inbox));
    }

    #[test]
    fn move_into_same_folder_does_nothing() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        let info = helper
            .run(false, "test", |tx| tx.create_content(inbox, "a", b"x"))
            .unwrap();
        let v1 = validity(&repo, inbox);
        let t1 = token(&repo, inbox);

        helper
            .run(false, "test", |tx| {
                tx.move_node(info.node, inbox)?;
                assert!(!tx.has_tracker(inbox));
                Ok(())
            })
            .unwrap();

        assert_eq!(v1, validity(&repo, inbox));
        assert_eq!(t1, token(&repo, inbox));
    }

    #[test]
    fn read_only_transaction_writes_nothing() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        helper
            .run(true, "test", |tx| {
                tx.tracker(inbox).record_new_uid(99);
                Ok(())
            })
            .unwrap();
        assert_eq!(None, token(&repo, inbox));
    }

    #[test]
    fn rollback_on_error_discards_changes() {
        let (repo, inbox) = set_up();
        let helper = helper(&repo, 1);
        let result: Result<(), Error> = helper.run(false, "test", |tx| {
            tx.create_content(inbox, "a", b"x")?;
            Err(Error::MailboxReadOnly)
        });
        assert_matches!(Err(Error::MailboxReadOnly), result);

        let session = repo.begin(true).unwrap();
        assert!(session.list_children(inbox).unwrap().is_empty());
        assert_eq!(None, change_token::get_token(&*session, inbox).unwrap());
    }

    #[test]
    fn conflict_is_retried() {
        let (repo, inbox) = set_up();
        let attempts = Cell::new(0);

        let result = helper(&repo, 1).run(false, "test", |tx| {
            attempts.set(attempts.get() + 1);
            if 1 == attempts.get() {
                // Someone else commits a change to the same folder first
                let mut other = repo.begin(false)?;
                other.set_property(
                    inbox,
                    Property::Title,
                    PropValue::Text("other".to_owned()),
                )?;
                other.commit()?;
            }
            tx.create_content(inbox, "a", b"x")
        });

        assert!(result.is_ok());
        assert_eq!(2, attempts.get());
    }

    #[test]
    fn gives_up_after_retry_budget() {
        let (repo, inbox) = set_up();
        let attempts = Cell::new(0);

        let result = helper(&repo, 1).run(false, "test", |tx| {
            attempts.set(attempts.get() + 1);
            let mut other = repo.begin(false)?;
            other.set_marker(inbox, Marker::NonSelectable, false)?;
            other.commit()?;
            tx.create_content(inbox, "a", b"x")
        });

        assert_matches!(Err(Error::GaveUpRetrying), result);
        assert_eq!(2, attempts.get());
    }
}
