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

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The configuration for the IMAP adapter.
///
/// This is stored in a TOML file, by convention `repo-imap.toml`. Every
/// section is optional.
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct ImapConfig {
    /// Sizing of the process-wide folder status cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Retry policy for repository transactions.
    #[serde(default)]
    pub transaction: TransactionConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The maximum number of folder status snapshots retained.
    ///
    /// Each snapshot is keyed by user, change token and view mode, so a
    /// single folder viewed by several users occupies several entries. When
    /// full, entries which have not been hit recently are dropped first.
    pub folder_status_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            folder_status_capacity: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TransactionConfig {
    /// How many times a transaction is re-run after an optimistic
    /// concurrency conflict before the operation fails.
    pub max_retries: u32,
    /// Milliseconds to wait between attempts.
    pub retry_wait_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            max_retries: 1,
            retry_wait_ms: 0,
        }
    }
}

impl TransactionConfig {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }
}

impl ImapConfig {
    /// Load the configuration from the given TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(Error::from)
    }
}
