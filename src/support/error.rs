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

use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Folder no longer exists")]
    NxFolder,
    #[error("No such message")]
    NxMessage,
    #[error("No such node in repository")]
    NxNode,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Mailbox is read-only")]
    MailboxReadOnly,
    #[error("Attempted write in read-only transaction")]
    ReadOnlyTransaction,
    #[error("Concurrent modification of node; transaction must be retried")]
    TransientConflict,
    #[error("Gave up after repeated transaction conflicts")]
    GaveUpRetrying,
    #[error("Property {0} has unexpected type")]
    BadProperty(&'static str),
    #[error("Name already in use")]
    NameInUse,
    #[error("Invalid operation: {0}")]
    Invalid(&'static str),
    #[error("Invalid view mode")]
    BadViewMode,
    #[error("Mailbox cannot be renamed to itself")]
    RenameToSelf,
    #[error("Mailbox cannot be renamed beneath itself")]
    RenameIntoSelf,
    #[error("Non-selectable mailbox with inferiors cannot be deleted")]
    MailboxHasInferiors,
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the referenced folder or message is gone.
    ///
    /// Holders of a cached folder instance must discard it on such errors
    /// rather than retrying.
    pub fn is_not_found(&self) -> bool {
        matches!(*self, Error::NxFolder | Error::NxMessage | Error::NxNode)
    }
}

/// The failure type handed to the mail-server framework.
///
/// All repository-level errors are converted into this at the folder
/// boundary. The original message is retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderError {
    pub message: String,
    /// If true, the folder instance which produced this error is no longer
    /// usable and retrying the operation will not help.
    pub fatal: bool,
}

impl fmt::Display for FolderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FolderError {}

impl From<Error> for FolderError {
    fn from(e: Error) -> Self {
        FolderError {
            fatal: e.is_not_found(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn folder_error_carries_message() {
        let fe = FolderError::from(Error::PermissionDenied(
            "No permission to set DELETED flag".to_owned(),
        ));
        assert_eq!(
            "Permission denied: No permission to set DELETED flag",
            fe.to_string()
        );
        assert!(!fe.fatal);

        let fe = FolderError::from(Error::NxMessage);
        assert!(fe.fatal);
    }
}
