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
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::repository::{ItemInfo, Marker};
use crate::support::error::Error;

/// Uniquely identifies a message within a single folder.
///
/// The UID of a message is the `db_id` of the underlying repository item.
/// Since those come from a repository-wide sequence, UIDs within a folder
/// are increasing but have gaps, and an item moved or restored into a
/// folder can arrive with a UID below ones already present. The latter is
/// what forces UIDVALIDITY changes.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 1-based position of a message within the UID-ordered view of a
/// folder.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqnum(pub u32);

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0)
    }
}

/// A single IMAP system flag.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Recent,
}

static ALL_FLAGS: [Flag; 6] = [
    Flag::Answered,
    Flag::Deleted,
    Flag::Draft,
    Flag::Flagged,
    Flag::Seen,
    Flag::Recent,
];

impl Flag {
    pub fn all() -> &'static [Flag] {
        &ALL_FLAGS
    }

    /// The repository marker which stores this flag.
    pub fn marker(self) -> Marker {
        match self {
            Flag::Answered => Marker::Answered,
            Flag::Deleted => Marker::Deleted,
            Flag::Draft => Marker::Draft,
            Flag::Flagged => Marker::Flagged,
            Flag::Seen => Marker::Seen,
            Flag::Recent => Marker::Recent,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Recent => write!(f, "\\Recent"),
        }
    }
}

bitflags! {
    /// A set of system flags.
    #[derive(Default)]
    pub struct Flags: u8 {
        const ANSWERED = 1 << 0;
        const DELETED = 1 << 1;
        const DRAFT = 1 << 2;
        const FLAGGED = 1 << 3;
        const SEEN = 1 << 4;
        const RECENT = 1 << 5;

        /// The flags clients may change and which persist across sessions.
        const PERMANENT = Self::ANSWERED.bits
            | Self::DELETED.bits
            | Self::DRAFT.bits
            | Self::FLAGGED.bits
            | Self::SEEN.bits;
    }
}

impl From<Flag> for Flags {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::Answered => Flags::ANSWERED,
            Flag::Deleted => Flags::DELETED,
            Flag::Draft => Flags::DRAFT,
            Flag::Flagged => Flags::FLAGGED,
            Flag::Seen => Flags::SEEN,
            Flag::Recent => Flags::RECENT,
        }
    }
}

impl Flags {
    /// Iterate the individual flags in this set.
    pub fn iter_flags(self) -> impl Iterator<Item = Flag> {
        ALL_FLAGS
            .iter()
            .copied()
            .filter(move |&f| self.contains(f.into()))
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (ix, flag) in self.iter_flags().enumerate() {
            if ix > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", flag)?;
        }
        write!(f, ")")
    }
}

/// Selects which children of a folder are presented as messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    /// Only items created as IMAP messages.
    Archive,
    /// Only ordinary documents, which are presented as synthesised messages.
    Virtual,
    /// Everything.
    Mixed,
}

impl Default for ViewMode {
    fn default() -> Self {
        ViewMode::Archive
    }
}

impl ViewMode {
    /// Whether an item with or without the `MailContent` marker is visible
    /// in this mode.
    pub fn includes(self, is_mail_content: bool) -> bool {
        match self {
            ViewMode::Archive => is_mail_content,
            ViewMode::Virtual => !is_mail_content,
            ViewMode::Mixed => true,
        }
    }
}

impl FromStr for ViewMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("archive") {
            Ok(ViewMode::Archive)
        } else if s.eq_ignore_ascii_case("virtual") {
            Ok(ViewMode::Virtual)
        } else if s.eq_ignore_ascii_case("mixed") {
            Ok(ViewMode::Mixed)
        } else {
            Err(Error::BadViewMode)
        }
    }
}

/// An immutable snapshot of the visible contents of one folder for one user.
///
/// `search` maps each visible UID to its item in ascending UID order.
/// `first_unseen` is the 1-based rank within `search` of the first item
/// without `\Seen`, or 0 if there is none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderStatus {
    pub message_count: u32,
    pub recent_count: u32,
    pub first_unseen: u32,
    pub unseen_count: u32,
    pub uid_validity: u64,
    pub change_token: String,
    pub search: BTreeMap<Uid, ItemInfo>,
}

impl FolderStatus {
    /// Return the sequence number of `uid`, if it is present.
    pub fn seqnum(&self, uid: Uid) -> Option<Seqnum> {
        if self.search.contains_key(&uid) {
            Some(Seqnum(self.search.range(..uid).count() as u32 + 1))
        } else {
            None
        }
    }

    /// Return one plus the greatest UID present, or 1 if the folder is
    /// empty.
    ///
    /// This is not persisted: if the message with the greatest UID is
    /// removed, the value goes back down.
    pub fn uid_next(&self) -> Uid {
        self.search
            .keys()
            .next_back()
            .map_or(Uid(1), |&Uid(max)| Uid(max + 1))
    }
}

/// Key of the folder status cache.
///
/// Different users may see different subsets of the same folder, and each
/// view mode selects a different subset again, so both are part of the key.
/// The change token stands in for the folder contents.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user: String,
    pub change_token: String,
    pub mode: ViewMode,
}

impl CacheKey {
    pub fn new(user: &str, change_token: &str, mode: ViewMode) -> Self {
        CacheKey {
            user: user.to_owned(),
            change_token: change_token.to_owned(),
            mode,
        }
    }
}

/// A message as presented to the mail-server framework.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub uid: Uid,
    pub item: ItemInfo,
    pub flags: Flags,
}
