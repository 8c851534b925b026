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

//! The per-folder IMAP bookkeeping properties.
//!
//! Each IMAP-visible folder carries three properties:
//!
//! - `ChangeToken`: an opaque random string. It is replaced whenever a
//!   transaction commits any change to the membership of the folder or to
//!   the flags of its children, so the pair (user, token) can key a cache of
//!   computed folder contents. A folder without a token has never had its
//!   status computed.
//!
//! - `UidValidity`: the UIDVALIDITY reported to clients. Absent means 0.
//!
//! - `MaxUid`: the greatest UID ever observed in the folder. Used to detect
//!   UIDs which arrive out of order.
//!
//! All are written only by `UidValidityTracker` at commit time, except for
//! the initial token, which is established atomically by `establish()`
//! together with the `MaxUid` baseline and, if there is none yet, the first
//! `UidValidity`.

use rand::Rng;

use crate::repository::{NodeRef, PropValue, Property, Repository, Session};
use crate::support::error::Error;

/// Generate a fresh change token.
pub fn new_token() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

pub fn get_token(
    session: &dyn Session,
    folder: NodeRef,
) -> Result<Option<String>, Error> {
    session
        .get_property(folder, Property::ChangeToken)?
        .map(|v| v.as_text(Property::ChangeToken).map(str::to_owned))
        .transpose()
}

pub fn set_token(
    session: &mut dyn Session,
    folder: NodeRef,
    token: &str,
) -> Result<(), Error> {
    session.set_property(
        folder,
        Property::ChangeToken,
        PropValue::Text(token.to_owned()),
    )
}

/// Establish the first change token and the `MaxUid` baseline for a folder.
///
/// If `uid_validity` is given, it is written as well; callers pass one when
/// the folder has never had a UIDVALIDITY, so that clients are never shown
/// 0.
///
/// This only succeeds if the folder still has no token. Returns whether
/// this call won; if it did not, some other reader or a committing
/// transaction got there first.
pub fn establish(
    repo: &dyn Repository,
    folder: NodeRef,
    token: &str,
    max_uid: u64,
    uid_validity: Option<u64>,
) -> Result<bool, Error> {
    let mut writes = vec![
        (Property::ChangeToken, PropValue::Text(token.to_owned())),
        (Property::MaxUid, PropValue::Long(max_uid as i64)),
    ];
    if let Some(uid_validity) = uid_validity {
        writes.push((
            Property::UidValidity,
            PropValue::Long(uid_validity as i64),
        ));
    }

    repo.cas_properties(folder, (Property::ChangeToken, None), writes)
}

pub fn uid_validity(
    session: &dyn Session,
    folder: NodeRef,
) -> Result<u64, Error> {
    Ok(read_long(session, folder, Property::UidValidity)?.unwrap_or(0))
}

pub fn set_uid_validity(
    session: &mut dyn Session,
    folder: NodeRef,
    uid_validity: u64,
) -> Result<(), Error> {
    session.set_property(
        folder,
        Property::UidValidity,
        PropValue::Long(uid_validity as i64),
    )
}

pub fn max_uid(
    session: &dyn Session,
    folder: NodeRef,
) -> Result<Option<u64>, Error> {
    read_long(session, folder, Property::MaxUid)
}

pub fn set_max_uid(
    session: &mut dyn Session,
    folder: NodeRef,
    max_uid: u64,
) -> Result<(), Error> {
    session.set_property(
        folder,
        Property::MaxUid,
        PropValue::Long(max_uid as i64),
    )
}

fn read_long(
    session: &dyn Session,
    node: NodeRef,
    prop: Property,
) -> Result<Option<u64>, Error> {
    session
        .get_property(node, prop)?
        .map(|v| v.as_long(prop).map(|v| v as u64))
        .transpose()
}
