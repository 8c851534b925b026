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

use std::sync::{Arc, RwLock};

use quick_cache::sync::Cache;

use super::model::{CacheKey, FolderStatus};

/// A bounded, process-wide cache of computed folder statuses.
///
/// Entries are never updated in place: a key is (user, change token, view
/// mode), and a change to the folder produces a new token and therefore a
/// new key. Stale entries simply stop being looked up and are eventually
/// evicted by `quick_cache` once the capacity is reached.
///
/// All users and folders share one reader-writer lock. Hits only take the
/// read lock; the write lock is taken just long enough to check for a
/// competing entry and insert.
pub struct FolderStatusCache {
    inner: RwLock<Cache<CacheKey, Arc<FolderStatus>>>,
}

impl FolderStatusCache {
    pub fn new(capacity: usize) -> Self {
        FolderStatusCache {
            inner: RwLock::new(Cache::new(capacity.max(1))),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<FolderStatus>> {
        self.inner.read().unwrap().get(key)
    }

    /// Insert `status` under `key`, unless an entry is already present.
    ///
    /// Returns whichever value is in the cache afterwards. A caller which
    /// lost a race to compute the same entry thus ends up with the winner's
    /// value, and all callers for one key observe the same `Arc`.
    pub fn insert_or_adopt(
        &self,
        key: CacheKey,
        status: Arc<FolderStatus>,
    ) -> Arc<FolderStatus> {
        let inner = self.inner.write().unwrap();
        if let Some(existing) = inner.get(&key) {
            return existing;
        }

        inner.insert(key, Arc::clone(&status));
        status
    }
}
