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

//! Per-transaction UIDVALIDITY bookkeeping for one folder.
//!
//! A tracker exists for every folder whose membership or child flags were
//! touched by the current transaction. Merely creating the tracker is enough
//! to guarantee the folder gets a new change token when the transaction
//! commits, which is all a deletion or flag change needs.
//!
//! New items additionally record their UID. At commit, the smallest UID
//! recorded is compared with the folder's `MaxUid`. UIDs come from a
//! repository-wide sequence and items can be moved or restored into a
//! folder, so a "new" item may have a UID at or below ones the client has
//! already seen. When that happens the UID ordering clients rely on is
//! broken and UIDVALIDITY must change.

use chrono::prelude::*;
use log::{debug, warn};

use super::change_token;
use crate::repository::{NodeRef, Session};
use crate::support::error::Error;

#[derive(Debug, Clone)]
pub struct UidValidityTracker {
    folder: NodeRef,
    change_token: String,
    min_uid: Option<u64>,
    max_uid: Option<u64>,
    force_new_uid_validity: bool,
}

impl UidValidityTracker {
    pub fn new(folder: NodeRef) -> Self {
        UidValidityTracker {
            folder,
            change_token: change_token::new_token(),
            min_uid: None,
            max_uid: None,
            force_new_uid_validity: false,
        }
    }

    pub fn folder(&self) -> NodeRef {
        self.folder
    }

    /// The token that will be written at commit.
    pub fn change_token(&self) -> &str {
        &self.change_token
    }

    /// Note that an item with the given UID entered the folder.
    pub fn record_new_uid(&mut self, uid: u64) {
        self.min_uid = Some(self.min_uid.map_or(uid, |m| m.min(uid)));
        self.max_uid = Some(self.max_uid.map_or(uid, |m| m.max(uid)));
    }

    /// Require UIDVALIDITY to change at commit regardless of the UIDs seen.
    ///
    /// Used when the content of an existing message changed in a way clients
    /// would not otherwise notice, since IMAP messages are immutable.
    pub fn force_new_uid_validity(&mut self) {
        self.force_new_uid_validity = true;
    }

    /// Flush this tracker into the folder's properties.
    ///
    /// Must be called exactly once, at the end of a read-write transaction
    /// and before the session commits, so the writes are atomic with the
    /// changes that caused them.
    pub fn before_commit(
        &self,
        session: &mut dyn Session,
        log_prefix: &str,
    ) -> Result<(), Error> {
        // The folder itself may have been deleted in this transaction
        if !session.exists(self.folder) {
            warn!(
                "{} Folder {} gone before commit; skipping UID bookkeeping",
                log_prefix, self.folder
            );
            return Ok(());
        }

        if self.force_new_uid_validity || self.min_uid.is_some() {
            let old_max = change_token::max_uid(session, self.folder)?;
            let out_of_order = match (self.min_uid, old_max) {
                (_, None) => true,
                (Some(min), Some(old_max)) => min <= old_max,
                (None, Some(_)) => false,
            };

            if self.force_new_uid_validity || out_of_order {
                let old = change_token::uid_validity(session, self.folder)?;
                let new = next_uid_validity(old);
                change_token::set_uid_validity(session, self.folder, new)?;
                debug!(
                    "{} UIDVALIDITY of {} changed {} -> {}",
                    log_prefix, self.folder, old, new
                );
            }

            if let Some(max) = self.max_uid {
                // Never lower the high-water mark
                let max = old_max.map_or(max, |old| old.max(max));
                change_token::set_max_uid(session, self.folder, max)?;
                debug!("{} MAXUID of {} is now {}", log_prefix, self.folder, max);
            }
        }

        change_token::set_token(session, self.folder, &self.change_token)
    }
}

/// Choose a new UIDVALIDITY strictly greater than `previous`.
///
/// This is the current time in milliseconds unless the clock is behind the
/// previous value.
pub fn next_uid_validity(previous: u64) -> u64 {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    now.max(previous.saturating_add(1))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::repository::memory::MemoryRepository;
    use crate::repository::Repository;

    fn set_up() -> (MemoryRepository, NodeRef) {
        let repo = MemoryRepository::new();
        let mut session = repo.begin(false).unwrap();
        let inbox = session.create_folder(repo.root(), "INBOX").unwrap().node;
        session.commit().unwrap();
        (repo, inbox)
    }

    fn flush(repo: &MemoryRepository, tracker: &UidValidityTracker) {
        let mut session = repo.begin(false).unwrap();
        tracker.before_commit(&mut *session, "test").unwrap();
        session.commit().unwrap();
    }

    fn props(repo: &MemoryRepository, folder: NodeRef) -> (u64, Option<u64>) {
        let session = repo.begin(true).unwrap();
        (
            change_token::uid_validity(&*session, folder).unwrap(),
            change_token::max_uid(&*session, folder).unwrap(),
        )
    }

    #[test]
    fn records_min_and_max() {
        let (repo, inbox) = set_up();
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(9);
        flush(&repo, &tracker);
        let (v1, _) = props(&repo, inbox);

        // The maximum lands in MaxUid; the minimum is above 9, so no bump
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(20);
        tracker.record_new_uid(10);
        tracker.record_new_uid(30);
        tracker.record_new_uid(25);
        flush(&repo, &tracker);
        assert_eq!((v1, Some(30)), props(&repo, inbox));

        // The minimum is at or below 30 even though the maximum is not
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(40);
        tracker.record_new_uid(30);
        flush(&repo, &tracker);
        let (v2, max) = props(&repo, inbox);
        assert!(v2 > v1);
        assert_eq!(Some(40), max);
    }

    #[test]
    fn first_uid_ever_sets_validity() {
        let (repo, inbox) = set_up();
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(5);
        flush(&repo, &tracker);

        let (validity, max) = props(&repo, inbox);
        assert!(validity > 0);
        assert_eq!(Some(5), max);
    }

    #[test]
    fn increasing_uids_keep_validity() {
        let (repo, inbox) = set_up();
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(5);
        flush(&repo, &tracker);
        let (validity, _) = props(&repo, inbox);

        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(6);
        tracker.record_new_uid(9);
        flush(&repo, &tracker);
        assert_eq!((validity, Some(9)), props(&repo, inbox));
    }

    #[test]
    fn lower_or_equal_uid_bumps_validity() {
        let (repo, inbox) = set_up();
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(50);
        flush(&repo, &tracker);
        let (v1, _) = props(&repo, inbox);

        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(40);
        flush(&repo, &tracker);
        let (v2, max) = props(&repo, inbox);
        assert!(v2 > v1);
        assert_eq!(Some(50), max);

        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(50);
        flush(&repo, &tracker);
        let (v3, _) = props(&repo, inbox);
        assert!(v3 > v2);
    }

    #[test]
    fn token_always_replaced() {
        let (repo, inbox) = set_up();
        let tracker = UidValidityTracker::new(inbox);
        flush(&repo, &tracker);

        let session = repo.begin(true).unwrap();
        assert_eq!(
            Some(tracker.change_token().to_owned()),
            change_token::get_token(&*session, inbox).unwrap()
        );
        // A tracker with no UIDs touches nothing else
        assert_eq!((0, None), props(&repo, inbox));
    }

    #[test]
    fn forced_validity_change() {
        let (repo, inbox) = set_up();
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(3);
        flush(&repo, &tracker);
        let (v1, _) = props(&repo, inbox);

        let mut tracker = UidValidityTracker::new(inbox);
        tracker.force_new_uid_validity();
        flush(&repo, &tracker);
        let (v2, max) = props(&repo, inbox);
        assert!(v2 > v1);
        assert_eq!(Some(3), max);
    }

    #[test]
    fn deleted_folder_skipped() {
        let (repo, inbox) = set_up();
        let mut tracker = UidValidityTracker::new(inbox);
        tracker.record_new_uid(3);

        let mut session = repo.begin(false).unwrap();
        session.delete_node(inbox).unwrap();
        tracker.before_commit(&mut *session, "test").unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn next_validity_strictly_increases() {
        let far_future = 1u64 << 60;
        assert_eq!(far_future + 1, next_uid_validity(far_future));
        assert!(next_uid_validity(0) > 0);
    }
}
