// Tag merger: a three-way merge anchored at the last checkpoint. No frame
// exchange of its own — both sides already hold the full change sets
// exchanged in the previous protocol step, and run this deterministically.

use crate::model::{ChangeSet, Database};
use std::collections;

/// theirs-first, then mine, duplicates skipped: this keeps the on-disk write
/// order of the resulting tag list stable across reruns, since `mine` and
/// `theirs` are themselves stable (sorted by however the DB emitted them).
fn merged_tags(mine: &[String], theirs: &[String]) -> Vec<String> {
  let mut result = Vec::with_capacity(mine.len() + theirs.len());
  for tag in theirs.iter().chain(mine.iter()) {
    if !result.contains(tag) {
      result.push(tag.clone());
    }
  }
  result
}

/// Applies the merge and returns how many messages actually had their tags
/// rewritten (a message whose merged set equals its current set is left
/// untouched).
pub fn merge(db: &dyn Database, mine: &ChangeSet, theirs: &ChangeSet) -> anyhow::Result<u64> {
  let ids: collections::BTreeSet<&str> = mine
    .keys()
    .map(String::as_str)
    .chain(theirs.keys().map(String::as_str))
    .collect();

  let mut changed = 0u64;
  for id in ids {
    let desired = match (mine.get(id), theirs.get(id)) {
      // We changed it, they didn't mention it: nothing for the merge to do.
      (Some(_), None) => continue,
      // They changed it and we didn't: take their tags verbatim, unless we
      // don't have (or no longer have) the message at all.
      (None, Some(theirs_record)) => theirs_record.tags.clone(),
      // Both sides touched it: union, theirs first.
      (Some(mine_record), Some(theirs_record)) => merged_tags(&mine_record.tags, &theirs_record.tags),
      (None, None) => unreachable!("id came from mine's or theirs' keys"),
    };

    let Some(message) = db.find(id)? else {
      continue;
    };
    if message.ghost {
      continue;
    }
    let current: collections::HashSet<&str> = message.tags.iter().map(String::as_str).collect();
    let wanted: collections::HashSet<&str> = desired.iter().map(String::as_str).collect();
    if current == wanted {
      continue;
    }
    db.set_tags(id, &desired)?;
    changed += 1;
  }
  Ok(changed)
}
