// Change extractor: turns "everything touched since the last checkpoint
// with this peer" into the change set that gets sent over the wire.

use crate::{
  checkpoint,
  hash,
  model::{ChangeRecord, ChangeSet, Database, Error, FileRecord},
};
use anyhow::Context as _;
use std::{fs, path};

pub struct Extracted {
  pub changes: ChangeSet,
  pub revision: u64,
  pub uuid: String,
}

/// Reads the checkpoint at `checkpoint_path` (named after the peer we're
/// about to sync with), validates it against the database's current
/// (revision, uuid), and builds the change set of everything touched since.
///
/// A missing checkpoint means this is the first sync with this peer: every
/// message is "changed".
pub fn extract(db: &dyn Database, checkpoint_path: &path::Path) -> anyhow::Result<Extracted> {
  let (revision, uuid) = db.revision()?;
  let lastmod = match checkpoint::read(checkpoint_path)? {
    Some(checkpoint) => {
      if checkpoint.uuid != uuid {
        anyhow::bail!(Error::UuidMismatch {
          old: checkpoint.uuid,
          current: uuid,
        });
      }
      if checkpoint.lastmod > revision {
        anyhow::bail!(Error::RevisionRegressed {
          old: checkpoint.lastmod,
          current: revision,
        });
      }
      checkpoint.lastmod
    }
    None => 0,
  };

  let db_root = db.default_path();
  let mut changes = ChangeSet::new();
  for message in db.changed_since(lastmod)? {
    let mut files = Vec::with_capacity(message.files.len());
    for path in &message.files {
      let name = path
        .strip_prefix(db_root)
        .with_context(|| format!("{path:?} is not under {db_root:?}"))?
        .to_string_lossy()
        .into_owned();
      let sha = hash::digest_reader(fs::File::open(path).with_context(|| format!("couldn't open {path:?}"))?)
        .with_context(|| format!("couldn't hash {path:?}"))?;
      files.push(FileRecord { name, sha });
    }
    changes.insert(
      message.id,
      ChangeRecord {
        tags: message.tags,
        files,
      },
    );
  }

  Ok(Extracted {
    changes,
    revision,
    uuid,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tests_support::MockDb;

  #[test]
  fn first_sync_has_no_checkpoint_and_includes_everything() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/a", b"hello")?;
    db.add_file(&path)?;
    let directory = tempfile::tempdir()?;
    let extracted = extract(&db, &directory.path().join("notmuch-sync-peer"))?;
    assert_eq!(1, extracted.changes.len());
    Ok(())
  }

  #[test]
  fn uuid_mismatch_is_fatal() -> anyhow::Result<()> {
    let db = MockDb::new();
    let directory = tempfile::tempdir()?;
    let path = directory.path().join("notmuch-sync-peer");
    checkpoint::write(&path, 0, "some-other-uuid")?;
    let error = extract(&db, &path).unwrap_err();
    assert!(error.downcast_ref::<Error>().is_some());
    Ok(())
  }

  #[test]
  fn revision_regressed_is_fatal() -> anyhow::Result<()> {
    let db = MockDb::new();
    let (_, uuid) = db.revision()?;
    let directory = tempfile::tempdir()?;
    let path = directory.path().join("notmuch-sync-peer");
    checkpoint::write(&path, 1_000_000, &uuid)?;
    let error = extract(&db, &path).unwrap_err();
    assert!(error.downcast_ref::<Error>().is_some());
    Ok(())
  }

  #[test]
  fn only_messages_since_checkpoint_are_included() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/a", b"hello")?;
    db.add_file(&path)?;
    let (revision, uuid) = db.revision()?;
    let directory = tempfile::tempdir()?;
    let checkpoint_path = directory.path().join("notmuch-sync-peer");
    checkpoint::write(&checkpoint_path, revision, &uuid)?;

    let path = db.write_file("cur/b", b"world")?;
    db.add_file(&path)?;
    let extracted = extract(&db, &checkpoint_path)?;
    assert_eq!(1, extracted.changes.len());
    Ok(())
  }

  #[test]
  fn ghost_messages_have_no_files() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/a", b"hello")?;
    let (message, _) = db.add_file(&path)?;
    db.remove_file(&path)?;
    let directory = tempfile::tempdir()?;
    let extracted = extract(&db, &directory.path().join("notmuch-sync-peer"))?;
    let record = &extracted.changes[&message.id];
    assert!(record.files.is_empty());
    Ok(())
  }
}
