// File reconciler — the heart of the system. Classifies files the peer told
// us about as already-present, copy/move-from-elsewhere, or genuinely
// missing, then (separately) drives the byte-transfer phase.

use crate::{
  codec::Frame,
  hash,
  model::{ChangeSet, Database, Error, FileRecord, MissingRecord},
};
use anyhow::Context as _;
use std::{
  collections, fs,
  io::{self, Read as _, Write as _},
  path,
};

pub struct Reconciled {
  pub missing: Vec<MissingRecord>,
  pub new_messages: u64,
  pub copied_or_moved: u64,
  pub deleted_files: u64,
}

fn relative_name(db_root: &path::Path, abs: &path::Path) -> anyhow::Result<String> {
  Ok(
    abs
      .strip_prefix(db_root)
      .with_context(|| format!("{abs:?} is not under {db_root:?}"))?
      .to_string_lossy()
      .into_owned(),
  )
}

fn hash_file(path: &path::Path) -> anyhow::Result<String> {
  hash::digest_reader(fs::File::open(path)?).with_context(|| format!("couldn't hash {path:?}"))
}

/// Classifies one side's view of the received change set. Mutates the local
/// filesystem/DB for copy/move/delete decisions; returns what still needs to
/// be fetched from the peer.
pub fn classify(
  db: &dyn Database,
  mine: &ChangeSet,
  theirs: &ChangeSet,
  delete: bool,
) -> anyhow::Result<Reconciled> {
  let db_root = db.default_path().to_path_buf();
  let mut missing = Vec::new();
  let mut new_messages = 0u64;
  let mut copied_or_moved = 0u64;
  let mut deleted_files = 0u64;

  for (id, record) in theirs {
    let local = db.find(id)?;
    let local = match local {
      Some(message) if !message.ghost => message,
      _ => {
        // New to us entirely (or known only as a ghost): request everything.
        new_messages += 1;
        missing.push(MissingRecord {
          id: id.clone(),
          tags: Some(record.tags.clone()),
          files: record.files.clone(),
        });
        continue;
      }
    };

    if record.files.is_empty() {
      // The peer has no files left for this message but we still do. If it
      // tagged the message `deleted`, whole-message deletion propagates
      // separately through delete::apply; if it didn't, the file loss on
      // the peer's side was never intentional and its own classify call
      // (seeing itself as a ghost there) is what re-requests our copy.
      // Either way there's nothing to reconcile on a per-file basis here,
      // and in particular our still-good files must not be deleted just
      // because the peer currently lists none.
      continue;
    }

    let local_names: collections::HashMap<String, path::PathBuf> = local
      .files
      .iter()
      .map(|path| Ok((relative_name(&db_root, path)?, path.clone())))
      .collect::<anyhow::Result<_>>()?;
    let mut unclaimed: collections::HashSet<String> = local_names.keys().cloned().collect();
    let mut shas: collections::HashMap<path::PathBuf, String> = collections::HashMap::new();
    let mut want = Vec::new();

    for entry in &record.files {
      match local_names.get(&entry.name) {
        Some(local_path) => {
          unclaimed.remove(&entry.name);
          let local_sha = shas
            .entry(local_path.clone())
            .or_insert(hash_file(local_path)?)
            .clone();
          if local_sha != entry.sha {
            // Present by name, different content.
            let mine_lists_it = mine
              .get(id)
              .map(|record| record.files.iter().any(|file| file.name == entry.name))
              .unwrap_or(false);
            if !mine_lists_it {
              anyhow::bail!(Error::Inconsistency {
                id: id.clone(),
                mine: mine.get(id).map(|r| r.files.clone()).unwrap_or_default(),
                theirs: record.files.clone(),
              });
            }
            // Otherwise: we legitimately changed this file ourselves since the
            // checkpoint; skip and let the next sync revisit.
          }
        }
        None => {
          // Absent by name: is there a local file (of this message) with matching content?
          let source = local
            .files
            .iter()
            .find(|path| {
              let sha = shas
                .entry((*path).clone())
                .or_insert_with(|| hash_file(path).unwrap_or_default());
              *sha == entry.sha
            })
            .cloned();
          match source {
            Some(source) => {
              let source_name = relative_name(&db_root, &source)?;
              let target = db_root.join(&entry.name);
              if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
              }
              let appears_elsewhere = record.files.iter().any(|file| file.name == source_name);
              if appears_elsewhere {
                fs::copy(&source, &target)
                  .with_context(|| format!("couldn't copy {source:?} to {target:?}"))?;
                db.add_file(&target)?;
              } else {
                fs::rename(&source, &target)
                  .with_context(|| format!("couldn't move {source:?} to {target:?}"))?;
                db.add_file(&target)?;
                db.remove_file(&source)?;
              }
              unclaimed.remove(&source_name);
              copied_or_moved += 1;
            }
            None => want.push(entry.clone()),
          }
        }
      }
    }

    if !want.is_empty() {
      missing.push(MissingRecord {
        id: id.clone(),
        tags: None,
        files: want,
      });
    }

    for name in unclaimed {
      let path = &local_names[&name];
      if delete {
        fs::remove_file(path).with_context(|| format!("couldn't remove {path:?}"))?;
        db.remove_file(path)?;
        deleted_files += 1;
      }
    }
  }

  Ok(Reconciled {
    missing,
    new_messages,
    copied_or_moved,
    deleted_files,
  })
}

fn flatten(missing: &[MissingRecord]) -> Vec<(&str, &FileRecord)> {
  missing
    .iter()
    .flat_map(|record| record.files.iter().map(move |file| (record.id.as_str(), file)))
    .collect()
}

fn send_requested<S>(
  frame: &mut Frame<S>,
  db_root: &path::Path,
  requested: &[MissingRecord],
) -> anyhow::Result<()>
where
  S: io::Read + io::Write,
{
  for (_, file) in flatten(requested) {
    let path = db_root.join(&file.name);
    let bytes = fs::read(&path).with_context(|| format!("couldn't read {path:?}"))?;
    frame.write_frame(&bytes)?;
  }
  Ok(())
}

fn receive_requested<S>(
  frame: &mut Frame<S>,
  db: &dyn Database,
  db_root: &path::Path,
  requested: &[MissingRecord],
) -> anyhow::Result<u64>
where
  S: io::Read + io::Write,
{
  let mut new_files = 0u64;
  let mut assigned_tags: collections::HashSet<&str> = collections::HashSet::new();
  for record in requested {
    for file in &record.files {
      let bytes = frame.read_frame()?;
      let got = hash::digest(&bytes);
      anyhow::ensure!(
        got == file.sha,
        Error::ChecksumMismatch {
          path: file.name.clone(),
          got,
          expected: file.sha.clone(),
        }
      );
      let target = db_root.join(&file.name);
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
      }
      match fs::metadata(&target) {
        Ok(_) => {
          let existing = fs::read(&target)?;
          anyhow::ensure!(
            hash::digest(&existing) == file.sha,
            Error::LocalFileClash {
              path: target.clone()
            }
          );
          // Same bytes already present: skip the write, still register.
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
          let mut out = fs::File::create(&target)?;
          out.write_all(&bytes)?;
          out.sync_all()?;
        }
        Err(error) => return Err(error).with_context(|| format!("couldn't stat {target:?}")),
      }
      let (message, is_new) = db.add_file(&target)?;
      new_files += 1;
      if is_new && !assigned_tags.contains(record.id.as_str()) {
        if let Some(tags) = &record.tags {
          db.set_tags(&message.id, tags)?;
          assigned_tags.insert(&record.id);
        }
      }
    }
  }
  Ok(new_files)
}

/// Drives the byte-transfer phase in a fixed, deadlock-free order. The
/// driver fully sends what the peer wants from it before reading what it
/// asked for; the remote mirrors the opposite order. Either ordering choice
/// is fine as long as both sides agree — this one additionally guarantees no
/// two-sided pipe-buffer deadlock on a large transfer.
pub fn transfer<S>(
  frame: &mut Frame<S>,
  db: &dyn Database,
  db_root: &path::Path,
  driver: bool,
  own_missing: &[MissingRecord],
  peer_missing: &[MissingRecord],
) -> anyhow::Result<u64>
where
  S: io::Read + io::Write,
{
  if driver {
    send_requested(frame, db_root, peer_missing)?;
    receive_requested(frame, db, db_root, own_missing)
  } else {
    let new_files = receive_requested(frame, db, db_root, own_missing)?;
    send_requested(frame, db_root, peer_missing)?;
    Ok(new_files)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tests_support::MockDb;
  use std::io::Cursor;

  #[test]
  fn new_message_is_requested_wholesale() -> anyhow::Result<()> {
    let db = MockDb::new();
    let mut theirs = ChangeSet::new();
    theirs.insert(
      "a@b".to_string(),
      crate::model::ChangeRecord {
        tags: vec!["inbox".to_string()],
        files: vec![FileRecord {
          name: "cur/a".to_string(),
          sha: "deadbeef".to_string(),
        }],
      },
    );
    let reconciled = classify(&db, &ChangeSet::new(), &theirs, false)?;
    assert_eq!(1, reconciled.new_messages);
    assert_eq!(1, reconciled.missing.len());
    assert_eq!(Some(vec!["inbox".to_string()]), reconciled.missing[0].tags);
    Ok(())
  }

  #[test]
  fn present_by_name_and_sha_needs_nothing() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/a", b"hello")?;
    db.add_file(&path)?;
    let sha = hash::digest(b"hello");
    let mut theirs = ChangeSet::new();
    theirs.insert(
      db.find(&db.id_for(&path)).unwrap().unwrap().id,
      crate::model::ChangeRecord {
        tags: vec![],
        files: vec![FileRecord {
          name: "cur/a".to_string(),
          sha,
        }],
      },
    );
    let reconciled = classify(&db, &ChangeSet::new(), &theirs, false)?;
    assert!(reconciled.missing.is_empty());
    assert_eq!(0, reconciled.copied_or_moved);
    Ok(())
  }

  #[test]
  fn absent_by_name_with_matching_content_elsewhere_is_a_move() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/old", b"hello")?;
    let (message, _) = db.add_file(&path)?;
    let sha = hash::digest(b"hello");
    let mut theirs = ChangeSet::new();
    theirs.insert(
      message.id.clone(),
      crate::model::ChangeRecord {
        tags: vec![],
        files: vec![FileRecord {
          name: "cur/new".to_string(),
          sha,
        }],
      },
    );
    let reconciled = classify(&db, &ChangeSet::new(), &theirs, false)?;
    assert_eq!(1, reconciled.copied_or_moved);
    assert!(reconciled.missing.is_empty());
    assert!(!db.root().join("cur/old").exists());
    assert!(db.root().join("cur/new").exists());
    Ok(())
  }

  #[test]
  fn absent_by_name_with_source_still_referenced_is_a_copy() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/kept", b"hello")?;
    let (message, _) = db.add_file(&path)?;
    let sha = hash::digest(b"hello");
    let mut theirs = ChangeSet::new();
    theirs.insert(
      message.id.clone(),
      crate::model::ChangeRecord {
        tags: vec![],
        files: vec![
          FileRecord {
            name: "cur/kept".to_string(),
            sha: sha.clone(),
          },
          FileRecord {
            name: "cur/extra".to_string(),
            sha,
          },
        ],
      },
    );
    let reconciled = classify(&db, &ChangeSet::new(), &theirs, false)?;
    assert_eq!(1, reconciled.copied_or_moved);
    assert!(db.root().join("cur/kept").exists());
    assert!(db.root().join("cur/extra").exists());
    Ok(())
  }

  #[test]
  fn inconsistency_is_fatal_unless_i_also_changed_it() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/a", b"mine")?;
    let (message, _) = db.add_file(&path)?;
    let mut theirs = ChangeSet::new();
    theirs.insert(
      message.id.clone(),
      crate::model::ChangeRecord {
        tags: vec![],
        files: vec![FileRecord {
          name: "cur/a".to_string(),
          sha: "not-mine-sha".to_string(),
        }],
      },
    );
    assert!(classify(&db, &ChangeSet::new(), &theirs, false).is_err());

    let mut mine = ChangeSet::new();
    mine.insert(
      message.id.clone(),
      crate::model::ChangeRecord {
        tags: vec![],
        files: vec![FileRecord {
          name: "cur/a".to_string(),
          sha: hash::digest(b"mine"),
        }],
      },
    );
    assert!(classify(&db, &mine, &theirs, false).is_ok());
    Ok(())
  }

  #[test]
  fn peer_reporting_no_files_is_left_alone_even_under_delete() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/a", b"hello")?;
    let (message, _) = db.add_file(&path)?;
    let theirs = {
      let mut changes = ChangeSet::new();
      changes.insert(
        message.id.clone(),
        crate::model::ChangeRecord {
          tags: vec![],
          files: vec![],
        },
      );
      changes
    };
    let reconciled = classify(&db, &ChangeSet::new(), &theirs, true)?;
    assert_eq!(0, reconciled.deleted_files);
    assert!(db.root().join("cur/a").exists());
    Ok(())
  }

  #[test]
  fn unreferenced_file_is_deleted_only_when_enabled() -> anyhow::Result<()> {
    let db = MockDb::new();
    let kept = db.write_file("cur/kept", b"hello")?;
    let (message, _) = db.add_file(&kept)?;
    let stray = db.write_file("cur/stray", b"hello")?;
    db.add_file(&stray)?;
    let theirs = {
      let mut changes = ChangeSet::new();
      changes.insert(
        message.id.clone(),
        crate::model::ChangeRecord {
          tags: vec![],
          files: vec![FileRecord {
            name: "cur/kept".to_string(),
            sha: hash::digest(b"hello"),
          }],
        },
      );
      changes
    };
    let reconciled = classify(&db, &ChangeSet::new(), &theirs, false)?;
    assert_eq!(0, reconciled.deleted_files);
    assert!(db.root().join("cur/stray").exists());

    let reconciled = classify(&db, &ChangeSet::new(), &theirs, true)?;
    assert_eq!(1, reconciled.deleted_files);
    assert!(db.root().join("cur/kept").exists());
    assert!(!db.root().join("cur/stray").exists());
    Ok(())
  }

  #[test]
  fn byte_transfer_roundtrips_and_assigns_tags_once() -> anyhow::Result<()> {
    let sender_db = MockDb::new();
    let receiver_db = MockDb::new();
    let path = sender_db.write_file("cur/a", b"body")?;
    sender_db.add_file(&path)?;

    let requested = vec![MissingRecord {
      id: "id@x".to_string(),
      tags: Some(vec!["inbox".to_string()]),
      files: vec![FileRecord {
        name: "cur/a".to_string(),
        sha: hash::digest(b"body"),
      }],
    }];

    let mut wire = Vec::new();
    send_requested(&mut Frame::new(Cursor::new(&mut wire)), sender_db.root(), &requested)?;
    let new_files =
      receive_requested(&mut Frame::new(Cursor::new(&wire)), &receiver_db, receiver_db.root(), &requested)?;
    assert_eq!(1, new_files);
    let message = receiver_db.find("id@x")?.unwrap();
    assert_eq!(vec!["inbox".to_string()], message.tags);
    Ok(())
  }

  #[test]
  fn checksum_mismatch_is_fatal() -> anyhow::Result<()> {
    let receiver_db = MockDb::new();
    let requested = vec![MissingRecord {
      id: "id@x".to_string(),
      tags: None,
      files: vec![FileRecord {
        name: "cur/a".to_string(),
        sha: "wrong".to_string(),
      }],
    }];
    let mut wire = Vec::new();
    Frame::new(Cursor::new(&mut wire)).write_frame(b"body")?;
    assert!(receive_requested(
      &mut Frame::new(Cursor::new(&wire)),
      &receiver_db,
      receiver_db.root(),
      &requested
    )
    .is_err());
    Ok(())
  }
}
