// Replica checkpoint: "<lastmod> <uuid>" at
// <db-root>/.notmuch/notmuch-sync-<peer-uuid>, written atomically via a
// sibling temp file + rename so a crash mid-write can't corrupt it.

use crate::model::Error;
use anyhow::Context as _;
use std::{fs, io::Write as _, path};

pub fn path_for(db_root: &path::Path, peer_uuid: &str) -> path::PathBuf {
  db_root
    .join(".notmuch")
    .join(format!("notmuch-sync-{peer_uuid}"))
}

/// Parsed checkpoint: what our lastmod and UUID were at the last successful
/// sync with this peer. `None` when no checkpoint file exists yet (first sync).
pub struct Checkpoint {
  pub lastmod: u64,
  pub uuid: String,
}

pub fn read(path: &path::Path) -> anyhow::Result<Option<Checkpoint>> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(error) => return Err(error).with_context(|| format!("couldn't read {path:?}")),
  };
  parse(&content)
    .map(Some)
    .ok_or_else(|| Error::CheckpointCorrupt {
      path: path.to_path_buf(),
    })
    .map_err(anyhow::Error::from)
}

fn parse(content: &str) -> Option<Checkpoint> {
  let (lastmod, uuid) = content.split_once(' ')?;
  if uuid.is_empty() || uuid.contains(' ') || uuid.contains('\n') {
    return None;
  }
  Some(Checkpoint {
    lastmod: lastmod.parse().ok()?,
    uuid: uuid.to_string(),
  })
}

/// Write the new checkpoint, overwriting any prior one. `rename` is atomic on
/// the same filesystem, so an interrupted write never leaves a half-written
/// checkpoint in place.
pub fn write(path: &path::Path, lastmod: u64, our_uuid: &str) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .with_context(|| format!("{path:?} has no parent directory"))?;
  fs::create_dir_all(parent)?;
  let temp_path = parent.join(format!(
    ".notmuch-sync-tmp-{}",
    uuid::Uuid::new_v4().simple()
  ));
  let mut file = fs::File::create(&temp_path)?;
  file.write_all(format!("{lastmod} {our_uuid}").as_bytes())?;
  file.sync_all()?;
  fs::rename(&temp_path, path)?;
  Ok(())
}
