// Test-only stand-ins for the two things the core modules never construct
// themselves: a real libnotmuch handle, and a real ssh subprocess. Mirrors
// the shape of notmuch::Database closely enough that the same test bodies
// would read naturally against either.

use crate::{
  hash,
  model::{Database, MessageInfo},
};
use anyhow::Context as _;
use std::{collections, fs, os::unix::net::UnixStream, path, sync::Mutex};

struct MockMessage {
  tags: Vec<String>,
  files: Vec<path::PathBuf>,
  changed_at: u64,
}

struct MockState {
  revision: u64,
  messages: collections::BTreeMap<String, MockMessage>,
}

/// An in-memory `Database`, content-addressed: a message's id is the hash of
/// its (first) file's bytes rather than a parsed `Message-ID` header, which
/// is close enough for exercising the reconciliation logic without linking
/// against libnotmuch in unit tests.
pub struct MockDb {
  root: tempfile::TempDir,
  uuid: String,
  state: Mutex<MockState>,
}

impl MockDb {
  pub fn new() -> Self {
    Self {
      root: tempfile::tempdir().expect("couldn't create a temp dir"),
      uuid: uuid::Uuid::new_v4().to_string(),
      state: Mutex::new(MockState {
        revision: 0,
        messages: collections::BTreeMap::new(),
      }),
    }
  }

  pub fn root(&self) -> &path::Path {
    self.root.path()
  }

  pub fn write_file(&self, relative: &str, bytes: &[u8]) -> anyhow::Result<path::PathBuf> {
    let path = self.root.path().join(relative);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::write(&path, bytes)?;
    Ok(path)
  }

  pub fn id_for(&self, path: &path::Path) -> String {
    hash::digest(&fs::read(path).expect("couldn't read file"))
  }
}

impl Database for MockDb {
  fn revision(&self) -> anyhow::Result<(u64, String)> {
    let state = self.state.lock().unwrap();
    Ok((state.revision, self.uuid.clone()))
  }

  fn default_path(&self) -> &path::Path {
    self.root.path()
  }

  fn changed_since(&self, lastmod: u64) -> anyhow::Result<Vec<MessageInfo>> {
    let state = self.state.lock().unwrap();
    Ok(
      state
        .messages
        .iter()
        .filter(|(_, message)| message.changed_at >= lastmod)
        .map(|(id, message)| MessageInfo {
          id: id.clone(),
          tags: message.tags.clone(),
          files: message.files.clone(),
          ghost: message.files.is_empty(),
        })
        .collect(),
    )
  }

  fn find(&self, id: &str) -> anyhow::Result<Option<MessageInfo>> {
    let state = self.state.lock().unwrap();
    Ok(state.messages.get(id).map(|message| MessageInfo {
      id: id.to_string(),
      tags: message.tags.clone(),
      files: message.files.clone(),
      ghost: message.files.is_empty(),
    }))
  }

  fn set_tags(&self, id: &str, tags: &[String]) -> anyhow::Result<()> {
    let mut state = self.state.lock().unwrap();
    let revision = state.revision + 1;
    state.revision = revision;
    let message = state
      .messages
      .get_mut(id)
      .with_context(|| format!("unknown message {id}"))?;
    message.tags = tags.to_vec();
    message.changed_at = revision;
    Ok(())
  }

  fn add_file(&self, abs_path: &path::Path) -> anyhow::Result<(MessageInfo, bool)> {
    let bytes = fs::read(abs_path).with_context(|| format!("couldn't read {abs_path:?}"))?;
    let id = hash::digest(&bytes);
    let mut state = self.state.lock().unwrap();
    let existed = state.messages.contains_key(&id);
    let revision = state.revision + 1;
    state.revision = revision;
    let message = state.messages.entry(id.clone()).or_insert_with(|| MockMessage {
      tags: Vec::new(),
      files: Vec::new(),
      changed_at: revision,
    });
    if !message.files.iter().any(|path| path == abs_path) {
      message.files.push(abs_path.to_path_buf());
    }
    message.changed_at = revision;
    Ok((
      MessageInfo {
        id,
        tags: message.tags.clone(),
        files: message.files.clone(),
        ghost: false,
      },
      !existed,
    ))
  }

  fn remove_file(&self, abs_path: &path::Path) -> anyhow::Result<()> {
    let mut state = self.state.lock().unwrap();
    let revision = state.revision + 1;
    for message in state.messages.values_mut() {
      if let Some(position) = message.files.iter().position(|path| path == abs_path) {
        message.files.remove(position);
        message.changed_at = revision;
        state.revision = revision;
        break;
      }
    }
    Ok(())
  }
}

/// Two ends of a real bidirectional OS pipe, so tests exercising the
/// driver/remote write-then-read orderings are subject to the same bounded
/// kernel buffer a subprocess's stdio pipe would impose.
pub fn duplex() -> (UnixStream, UnixStream) {
  UnixStream::pair().expect("couldn't create a socket pair")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn add_file_reports_is_new_only_for_a_brand_new_message() -> anyhow::Result<()> {
    let db = MockDb::new();
    let a = db.write_file("cur/a", b"hello")?;
    let b = db.write_file("cur/b", b"hello")?;
    let (_, first_is_new) = db.add_file(&a)?;
    let (_, second_is_new) = db.add_file(&b)?;
    assert!(first_is_new);
    assert!(!second_is_new);
    Ok(())
  }

  #[test]
  fn remove_file_turns_the_last_file_into_a_ghost() -> anyhow::Result<()> {
    let db = MockDb::new();
    let path = db.write_file("cur/a", b"hello")?;
    let (message, _) = db.add_file(&path)?;
    db.remove_file(&path)?;
    assert!(db.find(&message.id)?.unwrap().ghost);
    Ok(())
  }
}
