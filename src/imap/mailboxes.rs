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

//! Operations on the mailbox hierarchy: `LIST`, `LSUB`, `RENAME`, `DELETE`,
//! `SUBSCRIBE` and `UNSUBSCRIBE`.
//!
//! Mailbox names are the folder names from the hierarchy root down to the
//! folder, joined by `DELIMITER`.

use std::collections::BTreeSet;

use log::{debug, info};
use regex::Regex;

use super::service::{ImapService, DELIMITER};
use super::transaction::Transaction;
use crate::repository::{
    Access, Action, Marker, NodeRef, PropValue, Property, Session,
};
use crate::support::error::Error;

/// The mailbox whose rename keeps the original and moves only its
/// messages.
pub const INBOX: &str = "INBOX";

/// One entry of a `LIST` or `LSUB` response.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MailboxInfo {
    /// The full hierarchical name, e.g. `INBOX.Sub`.
    pub name: String,
    pub node: NodeRef,
    pub selectable: bool,
    pub subscribed: bool,
    /// Whether any subfolder is visible to the listing user.
    pub has_children: bool,
}

/// Build a matcher for a `LIST` pattern.
///
/// `*` matches anything; `%` matches anything except the hierarchy
/// delimiter. Everything else is literal.
pub fn mailbox_matcher(pattern: &str) -> Result<impl Fn(&str) -> bool, Error> {
    let not_delimiter =
        format!("[^{}]*", regex::escape(&DELIMITER.to_string()));

    let mut rx = "^".to_owned();
    let mut start = 0;
    for end in pattern
        .match_indices(|c| '%' == c || '*' == c)
        .map(|(ix, _)| ix)
        .chain(pattern.len()..=pattern.len())
    {
        rx.push_str(&regex::escape(&pattern[start..end]));
        start = (end + 1).min(pattern.len());

        match pattern.get(end..end + 1) {
            Some("*") => rx.push_str(".*"),
            Some("%") => rx.push_str(&not_delimiter),
            _ => (),
        }
    }
    rx.push('$');

    let rx =
        Regex::new(&rx).map_err(|_| Error::Invalid("bad mailbox pattern"))?;
    Ok(move |s: &str| rx.is_match(s))
}

fn unsubscribed_users(
    session: &dyn Session,
    folder: NodeRef,
) -> Result<BTreeSet<String>, Error> {
    Ok(match session.get_property(folder, Property::Unsubscribed)? {
        Some(v) => v.as_users(Property::Unsubscribed)?.clone(),
        None => BTreeSet::new(),
    })
}

impl ImapService {
    /// The `LIST` command: every folder under `root` which `user` can read
    /// and whose full name matches `pattern`, sorted by name.
    pub fn list_mailboxes(
        &self,
        tx: &Transaction<'_>,
        user: &str,
        root: NodeRef,
        pattern: &str,
    ) -> Result<Vec<MailboxInfo>, Error> {
        let matcher = mailbox_matcher(pattern)?;
        let mut accum = Vec::new();
        collect_mailboxes(tx.session(), user, root, "", &mut accum)?;
        accum.retain(|mb| matcher(&mb.name));
        accum.sort_unstable();

        debug!(
            "{} LIST {:?} matched {} mailboxes",
            tx.log_prefix(),
            pattern,
            accum.len()
        );
        Ok(accum)
    }

    /// The `LSUB` command.
    pub fn list_subscribed_mailboxes(
        &self,
        tx: &Transaction<'_>,
        user: &str,
        root: NodeRef,
        pattern: &str,
    ) -> Result<Vec<MailboxInfo>, Error> {
        let mut mailboxes = self.list_mailboxes(tx, user, root, pattern)?;
        mailboxes.retain(|mb| mb.subscribed);
        Ok(mailboxes)
    }

    pub fn subscribe(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        folder: NodeRef,
    ) -> Result<(), Error> {
        self.set_subscribed(tx, user, folder, true)
    }

    pub fn unsubscribe(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        folder: NodeRef,
    ) -> Result<(), Error> {
        self.set_subscribed(tx, user, folder, false)
    }

    fn set_subscribed(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        folder: NodeRef,
        subscribed: bool,
    ) -> Result<(), Error> {
        if tx.session().item(folder)?.is_content() {
            return Err(Error::NxFolder);
        }

        let mut users = unsubscribed_users(tx.session(), folder)?;
        let changed = if subscribed {
            users.remove(user)
        } else {
            users.insert(user.to_owned())
        };

        if changed {
            tx.set_property(
                folder,
                Property::Unsubscribed,
                PropValue::Users(users),
            )?;
        }

        debug!(
            "{} {} {} folder {}",
            tx.log_prefix(),
            user,
            if subscribed {
                "subscribed to"
            } else {
                "unsubscribed from"
            },
            folder
        );
        Ok(())
    }

    /// The `RENAME` command.
    ///
    /// Missing parents of `new_name` are created. The renamed folder gets a
    /// new UIDVALIDITY, since a client may have cached it under the old
    /// name.
    ///
    /// Renaming `INBOX` instead creates the new mailbox and moves the
    /// messages of `INBOX` into it, leaving `INBOX` and its subfolders in
    /// place.
    ///
    /// Returns the folder now known as `new_name`.
    pub fn rename_mailbox(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        root: NodeRef,
        old_name: &str,
        new_name: &str,
    ) -> Result<NodeRef, Error> {
        let src_parts = old_name.split(DELIMITER).collect::<Vec<_>>();
        let dst_parts = new_name.split(DELIMITER).collect::<Vec<_>>();

        if dst_parts.iter().any(|p| p.is_empty()) {
            return Err(Error::Invalid("bad mailbox name"));
        }

        if src_parts == dst_parts {
            return Err(Error::RenameToSelf);
        }

        if dst_parts.len() > src_parts.len()
            && dst_parts[..src_parts.len()] == src_parts[..]
        {
            return Err(Error::RenameIntoSelf);
        }

        let source = self.resolve_mailbox(tx, root, old_name)?;
        if Access::Denied
            == tx
                .session()
                .has_permission(user, source, Action::WriteProperties)
        {
            return Err(Error::PermissionDenied(format!(
                "No permission to rename {}",
                old_name
            )));
        }

        let (leaf, parents) = match dst_parts.split_last() {
            Some(split) => split,
            None => return Err(Error::Invalid("bad mailbox name")),
        };

        let mut parent = root;
        for &part in parents {
            parent = match self.child_folder(tx, parent, part)? {
                Some(existing) => existing,
                None => self.create_mailbox(tx, user, parent, part)?,
            };
        }

        if self.child_folder(tx, parent, leaf)?.is_some() {
            return Err(Error::NameInUse);
        }

        if 1 == src_parts.len() && INBOX == src_parts[0] {
            let target = self.create_mailbox(tx, user, parent, leaf)?;
            let children = tx.session().list_children(source)?;
            for child in children {
                if child.is_content() {
                    tx.move_node(child.node, target)?;
                }
            }

            info!(
                "{} Moved messages of {} into new mailbox {}",
                tx.log_prefix(),
                old_name,
                new_name
            );
            return Ok(target);
        }

        if !tx.session().parents(source)?.contains(&parent)
            && Access::Denied
                == tx
                    .session()
                    .has_permission(user, parent, Action::CreateChildren)
        {
            return Err(Error::PermissionDenied(format!(
                "No permission to create folders in {}",
                parent
            )));
        }

        tx.move_node(source, parent)?;
        tx.set_property(
            source,
            Property::Name,
            PropValue::Text((*leaf).to_owned()),
        )?;
        tx.tracker(source).force_new_uid_validity();

        info!("{} Renamed {} to {}", tx.log_prefix(), old_name, new_name);
        Ok(source)
    }

    /// The `DELETE` command.
    ///
    /// A folder without subfolders is deleted outright. A folder with
    /// subfolders loses its messages and becomes non-selectable; if it is
    /// already non-selectable, the deletion fails.
    pub fn delete_mailbox(
        &self,
        tx: &mut Transaction<'_>,
        user: &str,
        folder: NodeRef,
    ) -> Result<(), Error> {
        if Access::Denied
            == tx.session().has_permission(user, folder, Action::Delete)
        {
            return Err(Error::PermissionDenied(format!(
                "No permission to delete {}",
                folder
            )));
        }

        let children = tx.session().list_children(folder)?;
        if !children.iter().any(|c| !c.is_content()) {
            tx.delete_node(folder)?;
            info!("{} Deleted mailbox {}", tx.log_prefix(), folder);
            return Ok(());
        }

        if tx.session().has_marker(folder, Marker::NonSelectable)? {
            return Err(Error::MailboxHasInferiors);
        }

        for child in children.into_iter().filter(|c| c.is_content()) {
            tx.delete_node(child.node)?;
        }
        tx.set_marker(folder, Marker::NonSelectable, true)?;
        info!(
            "{} Emptied mailbox {}; it keeps its subfolders",
            tx.log_prefix(),
            folder
        );
        Ok(())
    }
}

fn collect_mailboxes(
    session: &dyn Session,
    user: &str,
    parent: NodeRef,
    prefix: &str,
    accum: &mut Vec<MailboxInfo>,
) -> Result<(), Error> {
    for child in session.list_children(parent)? {
        if child.is_content()
            || Access::Denied
                == session.has_permission(user, child.node, Action::Read)
        {
            continue;
        }

        let name = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{}{}{}", prefix, DELIMITER, child.name)
        };

        let before = accum.len();
        collect_mailboxes(session, user, child.node, &name, accum)?;
        let selectable =
            !session.has_marker(child.node, Marker::NonSelectable)?;
        let subscribed =
            !unsubscribed_users(session, child.node)?.contains(user);
        accum.push(MailboxInfo {
            has_children: accum.len() > before,
            selectable,
            subscribed,
            node: child.node,
            name,
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::imap::model::{FolderStatus, ViewMode};
    use crate::repository::memory::MemoryRepository;
    use crate::repository::Repository;
    use crate::support::system_config::ImapConfig;

    struct Setup {
        repo: Arc<MemoryRepository>,
        service: ImapService,
        root: NodeRef,
    }

    fn set_up() -> Setup {
        crate::init_test_log();

        let repo = Arc::new(MemoryRepository::new());
        let service = ImapService::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            &ImapConfig::default(),
        );
        let root = repo.root();
        Setup {
            repo,
            service,
            root,
        }
    }

    impl Setup {
        fn mkdir(&self, path: &str) -> NodeRef {
            let (parent, name) = match path.rfind(DELIMITER) {
                Some(ix) => (Some(&path[..ix]), &path[ix + 1..]),
                None => (None, path),
            };

            self.run(|tx| {
                let parent = match parent {
                    Some(parent) => {
                        self.service.resolve_mailbox(tx, self.root, parent)?
                    }
                    None => self.root,
                };
                self.service.create_mailbox(tx, "alice", parent, name)
            })
        }

        fn add(&self, folder: NodeRef, name: &str) -> NodeRef {
            self.run(|tx| {
                let info = tx.create_content(folder, name, b"content")?;
                tx.set_marker(info.node, Marker::MailContent, true)?;
                Ok(info.node)
            })
        }

        fn run<R>(
            &self,
            work: impl FnMut(&mut Transaction<'_>) -> Result<R, Error>,
        ) -> R {
            self.service.transactions().run(false, "test", work).unwrap()
        }

        fn try_run<R>(
            &self,
            work: impl FnMut(&mut Transaction<'_>) -> Result<R, Error>,
        ) -> Result<R, Error> {
            self.service.transactions().run(false, "test", work)
        }

        fn list(&self, user: &str, pattern: &str) -> Vec<String> {
            self.service
                .transactions()
                .run(true, "test", |tx| {
                    self.service.list_mailboxes(tx, user, self.root, pattern)
                })
                .unwrap()
                .into_iter()
                .map(|mb| mb.name)
                .collect()
        }

        fn lsub(&self, user: &str) -> Vec<String> {
            self.service
                .transactions()
                .run(true, "test", |tx| {
                    self.service
                        .list_subscribed_mailboxes(tx, user, self.root, "*")
                })
                .unwrap()
                .into_iter()
                .map(|mb| mb.name)
                .collect()
        }

        fn resolve(&self, path: &str) -> Result<NodeRef, Error> {
            self.service.transactions().run(true, "test", |tx| {
                self.service.resolve_mailbox(tx, self.root, path)
            })
        }

        fn status(&self, folder: NodeRef) -> Arc<FolderStatus> {
            self.service
                .transactions()
                .run(true, "test", |tx| {
                    self.service.folder_status(
                        tx,
                        "alice",
                        folder,
                        ViewMode::Archive,
                    )
                })
                .unwrap()
        }
    }

    #[test]
    fn mailbox_patterns() {
        fn matches(pat: &str, mb: &str) -> bool {
            mailbox_matcher(pat).unwrap()(mb)
        }

        assert!(matches("*", "INBOX"));
        assert!(matches("%", "INBOX"));

        assert!(matches("INB*X", "INBOX"));
        assert!(matches("INB*X", "INB.BOX"));
        assert!(!matches("INB*X", "INBOX.plugh"));
        assert!(matches("INB%X", "INBOX"));
        assert!(!matches("INB%X", "INB.BOX"));

        assert!(matches("INB*", "INBOX.plugh"));
        assert!(!matches("INB%", "INBOX.plugh"));
        assert!(matches("%X", "INBOX"));
        assert!(!matches("%X", "foo.boX"));

        assert!(matches("foo.bar", "foo.bar"));
        assert!(!matches("foo.bar", "fooXbar"));
        assert!(!matches("foo.*", "foo"));
        assert!(matches("foo.*", "foo.bar.baz"));
        assert!(matches("foo.%", "foo.bar"));
        assert!(!matches("foo.%", "foo.bar.baz"));

        // Regex syntax is literal
        assert!(matches("a+b", "a+b"));
        assert!(!matches("a+b", "aab"));
    }

    #[test]
    fn list_walks_hierarchy() {
        let setup = set_up();
        setup.mkdir("INBOX");
        setup.mkdir("INBOX.Sub");
        setup.mkdir("INBOX.Sub.Deep");
        setup.mkdir("Archive");

        assert_eq!(
            vec!["Archive", "INBOX", "INBOX.Sub", "INBOX.Sub.Deep"],
            setup.list("alice", "*")
        );
        assert_eq!(vec!["Archive", "INBOX"], setup.list("alice", "%"));
        assert_eq!(vec!["INBOX.Sub"], setup.list("alice", "INBOX.%"));
        assert!(setup.list("alice", "Nope").is_empty());

        let listed = setup
            .service
            .transactions()
            .run(true, "test", |tx| {
                setup.service.list_mailboxes(tx, "alice", setup.root, "*")
            })
            .unwrap();
        let with_children = listed
            .iter()
            .filter(|mb| mb.has_children)
            .map(|mb| mb.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(vec!["INBOX", "INBOX.Sub"], with_children);
        assert!(listed.iter().all(|mb| mb.selectable && mb.subscribed));
    }

    #[test]
    fn list_hides_unreadable_folders() {
        let setup = set_up();
        setup.mkdir("INBOX");
        let archive = setup.mkdir("Archive");
        setup.mkdir("Archive.2020");
        setup.repo.deny("bob", archive, Action::Read);

        assert_eq!(vec!["INBOX"], setup.list("bob", "*"));
        assert_eq!(3, setup.list("alice", "*").len());
    }

    #[test]
    fn subscriptions_are_per_user() {
        let setup = set_up();
        let inbox = setup.mkdir("INBOX");
        let archive = setup.mkdir("Archive");
        let before = setup.status(archive);

        setup.run(|tx| setup.service.unsubscribe(tx, "alice", archive));
        assert_eq!(vec!["INBOX"], setup.lsub("alice"));
        assert_eq!(vec!["Archive", "INBOX"], setup.lsub("bob"));
        // Still listed, just not subscribed
        assert_eq!(2, setup.list("alice", "*").len());
        // Subscriptions are not part of the folder status
        assert_eq!(before.change_token, setup.status(archive).change_token);

        // Repeating either is harmless
        setup.run(|tx| setup.service.unsubscribe(tx, "alice", archive));
        setup.run(|tx| setup.service.subscribe(tx, "alice", archive));
        setup.run(|tx| setup.service.subscribe(tx, "alice", archive));
        assert_eq!(vec!["Archive", "INBOX"], setup.lsub("alice"));

        let message = setup.add(inbox, "m");
        let result =
            setup.try_run(|tx| setup.service.subscribe(tx, "alice", message));
        assert_matches!(Err(Error::NxFolder), result);
    }

    #[test]
    fn rename_refreshes_uid_validity() {
        let setup = set_up();
        let archive = setup.mkdir("Archive");
        let message = setup.add(archive, "m");
        let before = setup.status(archive);
        assert!(before.uid_validity > 0);

        let renamed = setup.run(|tx| {
            setup
                .service
                .rename_mailbox(tx, "alice", setup.root, "Archive", "Old")
        });
        assert_eq!(archive, renamed);
        assert_eq!(archive, setup.resolve("Old").unwrap());
        assert_matches!(Err(Error::NxFolder), setup.resolve("Archive"));

        let after = setup.status(archive);
        assert_ne!(before.change_token, after.change_token);
        assert!(after.uid_validity > before.uid_validity);
        assert_eq!(
            vec![message],
            after.search.values().map(|i| i.node).collect::<Vec<_>>()
        );
    }

    #[test]
    fn rename_creates_missing_parents() {
        let setup = set_up();
        let archive = setup.mkdir("Archive");
        setup.mkdir("Old");

        setup.run(|tx| {
            setup.service.rename_mailbox(
                tx,
                "alice",
                setup.root,
                "Archive",
                "Old.Years.Archive",
            )
        });
        assert_eq!(
            vec!["Old", "Old.Years", "Old.Years.Archive"],
            setup.list("alice", "*")
        );
        assert_eq!(archive, setup.resolve("Old.Years.Archive").unwrap());
    }

    #[test]
    fn bad_renames_rejected() {
        let setup = set_up();
        setup.mkdir("Archive");
        setup.mkdir("Other");

        let rename = |from: &str, to: &str| {
            setup.try_run(|tx| {
                setup
                    .service
                    .rename_mailbox(tx, "alice", setup.root, from, to)
            })
        };

        assert_matches!(Err(Error::RenameToSelf), rename("Archive", "Archive"));
        assert_matches!(
            Err(Error::RenameIntoSelf),
            rename("Archive", "Archive.Sub")
        );
        assert_matches!(Err(Error::NameInUse), rename("Archive", "Other"));
        assert_matches!(Err(Error::NxFolder), rename("Nope", "Other2"));
        assert_matches!(Err(Error::Invalid(_)), rename("Archive", "a..b"));

        // Nothing was left behind by the failures
        assert_eq!(vec!["Archive", "Other"], setup.list("alice", "*"));
    }

    #[test]
    fn rename_inbox_moves_only_messages() {
        let setup = set_up();
        let inbox = setup.mkdir("INBOX");
        setup.mkdir("INBOX.Sub");
        let message = setup.add(inbox, "m");

        let saved = setup.run(|tx| {
            setup
                .service
                .rename_mailbox(tx, "alice", setup.root, "INBOX", "Saved")
        });
        assert_ne!(inbox, saved);
        assert_eq!(
            vec!["INBOX", "INBOX.Sub", "Saved"],
            setup.list("alice", "*")
        );

        assert_eq!(0, setup.status(inbox).message_count);
        let saved_status = setup.status(saved);
        assert_eq!(
            vec![message],
            saved_status.search.values().map(|i| i.node).collect::<Vec<_>>()
        );
    }

    #[test]
    fn delete_leaf_mailbox() {
        let setup = set_up();
        let archive = setup.mkdir("Archive");
        setup.add(archive, "m");

        setup.run(|tx| setup.service.delete_mailbox(tx, "alice", archive));
        assert!(setup.list("alice", "*").is_empty());
        assert_matches!(Err(Error::NxFolder), setup.resolve("Archive"));
    }

    #[test]
    fn delete_mailbox_with_inferiors() {
        let setup = set_up();
        let inbox = setup.mkdir("INBOX");
        setup.mkdir("INBOX.Sub");
        setup.add(inbox, "a");
        setup.add(inbox, "b");

        setup.run(|tx| setup.service.delete_mailbox(tx, "alice", inbox));
        assert_eq!(vec!["INBOX", "INBOX.Sub"], setup.list("alice", "*"));
        assert_eq!(0, setup.status(inbox).message_count);

        let listed = setup
            .service
            .transactions()
            .run(true, "test", |tx| {
                setup.service.list_mailboxes(tx, "alice", setup.root, "INBOX")
            })
            .unwrap();
        assert!(!listed[0].selectable);

        let result = setup
            .try_run(|tx| setup.service.delete_mailbox(tx, "alice", inbox));
        assert_matches!(Err(Error::MailboxHasInferiors), result);
    }

    #[test]
    fn delete_requires_permission() {
        let setup = set_up();
        let archive = setup.mkdir("Archive");
        setup.repo.deny("bob", archive, Action::Delete);

        let result = setup
            .try_run(|tx| setup.service.delete_mailbox(tx, "bob", archive));
        assert_matches!(Err(Error::PermissionDenied(_)), result);
        assert_eq!(vec!["Archive"], setup.list("alice", "*"));
    }
}
