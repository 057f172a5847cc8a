// Deletion propagator. A message only ever gets deleted outright because a
// side tagged it `deleted` (a tag the user applies with `notmuch tag`, never
// one this program computes); this module decides whose copy goes under
// `--delete` and guards against clobbering a concurrent edit. Plain file
// loss without the tag is handled as a restore in reconcile::classify, not
// as a deletion here.

use crate::model::{ChangeSet, Database, MessageInfo};
use std::fs;

const DELETED_TAG: &str = "deleted";

/// Every id in `mine` that we tagged `deleted` since the last checkpoint.
/// Restricting to `mine` (rather than querying the whole database for the
/// tag) is deliberate: anything tagged `deleted` before the last successful
/// sync with this peer was already propagated then.
pub fn locally_deleted(mine: &ChangeSet) -> Vec<String> {
  mine
    .iter()
    .filter(|(_, record)| record.tags.iter().any(|tag| tag == DELETED_TAG))
    .map(|(id, _)| id.clone())
    .collect()
}

fn remove_files(db: &dyn Database, message: &MessageInfo) -> anyhow::Result<()> {
  for path in &message.files {
    fs::remove_file(path).or_else(|error| {
      if error.kind() == std::io::ErrorKind::NotFound {
        Ok(())
      } else {
        Err(error)
      }
    })?;
    db.remove_file(path)?;
  }
  Ok(())
}

/// Applies whole-message deletion decided by either side this sync: every id
/// we ourselves tagged `deleted` (`own_deleted`), and every id the peer
/// tagged `deleted` and asked us to mirror (`peer_deleted`). Returns how many
/// messages were actually removed.
///
/// Without `--delete` the tag itself is all that propagates — merge already
/// replicated it onto both sides' copies of the message — and nothing is
/// removed here.
///
/// The failsafe guards against clobbering a concurrent edit the other side
/// made for an unrelated reason, unless `no_check` lifts it for disaster
/// recovery: deleting our own tagged message is deferred if the peer's own
/// change set shows it touched the same id without agreeing to delete it;
/// mirroring the peer's deletion is deferred if we touched the same id
/// ourselves since the checkpoint.
pub fn apply(
  db: &dyn Database,
  own_deleted: &[String],
  peer_deleted: &[String],
  mine: &ChangeSet,
  theirs: &ChangeSet,
  delete: bool,
  no_check: bool,
) -> anyhow::Result<u64> {
  if !delete {
    return Ok(0);
  }
  let mut deleted = 0u64;

  for id in own_deleted {
    let Some(message) = db.find(id)? else {
      continue;
    };
    if message.ghost {
      continue;
    }
    if !no_check {
      if let Some(record) = theirs.get(id) {
        if !record.tags.iter().any(|tag| tag == DELETED_TAG) {
          continue;
        }
      }
    }
    remove_files(db, &message)?;
    deleted += 1;
  }

  for id in peer_deleted {
    if own_deleted.iter().any(|done| done == id) {
      continue; // already handled above
    }
    let Some(message) = db.find(id)? else {
      continue;
    };
    if message.ghost {
      continue;
    }
    if !no_check && mine.contains_key(id) {
      continue;
    }
    remove_files(db, &message)?;
    deleted += 1;
  }

  Ok(deleted)
}
