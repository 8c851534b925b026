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

//! The IMAP view of the repository.
//!
//! `ImapService` is the process-wide entry point and owns the folder status
//! cache. `ImapFolder` is the per-session mailbox built on top of it. All
//! mutations go through `Transaction`, which maintains the change tokens and
//! UIDVALIDITY of affected folders.

pub mod change_token;
pub mod folder;
pub mod folder_cache;
pub mod listener;
pub mod mailboxes;
pub mod model;
pub mod service;
pub mod transaction;
pub mod uid_validity;


pub use self::folder::ImapFolder;
pub use self::service::ImapService;
