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
use std::sync::{Arc, Mutex};

use super::model::{Flags, Seqnum, Uid};

/// Receives notifications about flag changes within a folder.
pub trait FolderListener: Send + Sync {
    fn flags_updated(&self, msn: Seqnum, flags: Flags, uid: Option<Uid>);
}

impl<F: Fn(Seqnum, Flags, Option<Uid>) + Send + Sync> FolderListener for F {
    fn flags_updated(&self, msn: Seqnum, flags: Flags, uid: Option<Uid>) {
        self(msn, flags, uid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// The set of listeners attached to one folder.
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<Registered>,
}

#[derive(Default)]
struct Registered {
    next_id: u64,
    listeners: BTreeMap<ListenerId, Arc<dyn FolderListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn FolderListener>) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.insert(id, listener);
        id
    }

    /// Returns whether `id` was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.lock().unwrap().listeners.remove(&id).is_some()
    }

    /// Notify every listener except `exclude` of a flag change.
    ///
    /// `exclude` is normally the session which made the change in response
    /// to a `.SILENT` store.
    pub fn notify_flag_update(
        &self,
        msn: Seqnum,
        flags: Flags,
        uid: Option<Uid>,
        exclude: Option<ListenerId>,
    ) {
        // Listeners may call back into the registry
        let targets: Vec<Arc<dyn FolderListener>> = self
            .inner
            .lock()
            .unwrap()
            .listeners
            .iter()
            .filter(|&(&id, _)| Some(id) != exclude)
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in targets {
            listener.flags_updated(msn, flags, uid);
        }
    }
}
