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

//! Repository fixtures for the `status` command.
//!
//! A fixture is a TOML file listing folders and the items in them:
//!
//! ```toml
//! [[folder]]
//! path = "INBOX"
//! unsubscribed = ["carol"]
//!
//! [[folder.item]]
//! name = "hello"
//! uid = 10
//! flags = ["seen", "recent"]
//! hidden_from = ["bob"]
//! ```
//!
//! Items are created in order. An explicit `uid` must not be lower than any
//! identifier already allocated.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::imap::model::Flag;
use crate::imap::ImapService;
use crate::repository::memory::MemoryRepository;
use crate::repository::{Action, Marker, NodeRef};
use crate::support::error::Error;

#[derive(Deserialize, Debug, Default)]
pub struct Fixture {
    #[serde(default, rename = "folder")]
    pub folders: Vec<FixtureFolder>,
}

#[derive(Deserialize, Debug)]
pub struct FixtureFolder {
    /// Full name, components separated by `.`.
    pub path: String,
    #[serde(default)]
    pub non_selectable: bool,
    #[serde(default)]
    pub read_only_for: Vec<String>,
    /// Users who see the folder in `LIST` but not in `LSUB`.
    #[serde(default)]
    pub unsubscribed: Vec<String>,
    #[serde(default, rename = "item")]
    pub items: Vec<FixtureItem>,
}

#[derive(Deserialize, Debug)]
pub struct FixtureItem {
    pub name: String,
    pub uid: Option<u64>,
    /// Whether the item was created as a mail message.
    #[serde(default = "true_")]
    pub mail: bool,
    #[serde(default)]
    pub content: String,
    /// The exact flags of the item.
    #[serde(default)]
    pub flags: Vec<Flag>,
    #[serde(default)]
    pub hidden_from: Vec<String>,
}

fn true_() -> bool {
    true
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    /// Populate `repo` through `service`.
    pub fn apply(
        &self,
        repo: &Arc<MemoryRepository>,
        service: &ImapService,
    ) -> Result<(), Error> {
        for folder in &self.folders {
            let node = service.transactions().run(false, "fixture", |tx| {
                let mut current = repo.root();
                for part in folder.path.split(crate::imap::service::DELIMITER)
                {
                    current = match service.resolve_mailbox(tx, current, part)
                    {
                        Ok(node) => node,
                        Err(Error::NxFolder) => service
                            .create_mailbox(tx, "fixture", current, part)?,
                        Err(e) => return Err(e),
                    };
                }
                tx.set_marker(
                    current,
                    Marker::NonSelectable,
                    folder.non_selectable,
                )?;
                for user in &folder.unsubscribed {
                    service.unsubscribe(tx, user, current)?;
                }
                Ok(current)
            })?;

            for user in &folder.read_only_for {
                repo.deny(user, node, Action::CreateChildren);
            }

            for item in &folder.items {
                self.add_item(repo, service, node, item)?;
            }
        }

        Ok(())
    }

    fn add_item(
        &self,
        repo: &Arc<MemoryRepository>,
        service: &ImapService,
        folder: NodeRef,
        item: &FixtureItem,
    ) -> Result<(), Error> {
        if let Some(uid) = item.uid {
            repo.advance_sequence_to(uid);
        }

        let info = service.transactions().run(false, "fixture", |tx| {
            let info = tx.create_content(
                folder,
                &item.name,
                item.content.as_bytes(),
            )?;
            tx.set_marker(info.node, Marker::MailContent, item.mail)?;
            for &flag in Flag::all() {
                tx.set_marker(
                    info.node,
                    flag.marker(),
                    item.flags.contains(&flag),
                )?;
            }
            Ok(info)
        })?;

        if item.uid.map_or(false, |uid| uid != info.db_id) {
            return Err(Error::Invalid("fixture UIDs must be increasing"));
        }

        for user in &item.hidden_from {
            repo.deny(user, info.node, Action::Read);
        }

        Ok(())
    }
}
