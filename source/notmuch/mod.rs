// The notmuch-backed `model::Database`. Every mutating call runs inside its
// own atomic section (bindings::Database::begin_atomic/end_atomic) and
// reopens the handle afterwards, mirroring how a writable notmuch database
// only actually commits on close/reopen if nothing failed in between.

use crate::model::{Database as _, MessageInfo};
use anyhow::Context as _;
use std::{collections, fs, path, sync::Mutex};

mod bindings;
pub use bindings::Error;

fn quote(str: &str) -> String {
  // property/id queries are quoted Xapian terms; only '"' needs escaping, by doubling it.
  let mut quoted = String::with_capacity(str.len());
  for char in str.chars() {
    if char == '"' {
      quoted.push('"');
    }
    quoted.push(char);
  }
  quoted
}

fn info(message: &bindings::Message<'_>) -> anyhow::Result<MessageInfo> {
  let files = message.paths()?;
  let ghost = files.is_empty();
  Ok(MessageInfo {
    id: message.id()?.to_string(),
    tags: message.tags()?.into_iter().map(String::from).collect(),
    files,
    ghost,
  })
}

fn find_info(inner: &bindings::Database, id: &str) -> anyhow::Result<Option<MessageInfo>> {
  let mut messages = inner.query(&format!("id:\"{}\"", quote(id)))?;
  messages.next().map(|message| info(&message)).transpose()
}

pub struct Database {
  inner: Mutex<bindings::Database>,
  default_path: path::PathBuf,
}

impl Database {
  pub fn open(path: Option<&path::Path>) -> anyhow::Result<Self> {
    let inner = bindings::Database::open(path)?;
    let default_path = inner.path().to_path_buf();
    Ok(Self {
      inner: Mutex::new(inner),
      default_path,
    })
  }

  pub fn create(path: &path::Path) -> anyhow::Result<Self> {
    fs::create_dir_all(path)?;
    let inner = bindings::Database::create(path)?;
    let default_path = inner.path().to_path_buf();
    Ok(Self {
      inner: Mutex::new(inner),
      default_path,
    })
  }

  /// Runs `body` inside begin_atomic/end_atomic, reopening the handle whether
  /// or not `body` succeeds. Nested calls would deadlock on the mutex, which
  /// is the same "nested transactions aren't supported" discipline as before,
  /// just enforced by the lock rather than an assert.
  fn transaction<B, R>(&self, mut body: B) -> anyhow::Result<R>
  where
    B: FnMut(&bindings::Database) -> anyhow::Result<R>,
  {
    let mut inner = self.inner.lock().unwrap();
    inner.begin_atomic()?;
    match body(&inner) {
      Ok(result) => {
        inner.end_atomic()?;
        inner.reopen()?;
        Ok(result)
      }
      Err(error) => {
        inner.reopen()?;
        Err(error)
      }
    }
  }
}

impl crate::model::Database for Database {
  fn revision(&self) -> anyhow::Result<(u64, String)> {
    let inner = self.inner.lock().unwrap();
    Ok(inner.revision()?)
  }

  fn default_path(&self) -> &path::Path {
    &self.default_path
  }

  fn changed_since(&self, lastmod: u64) -> anyhow::Result<Vec<MessageInfo>> {
    let inner = self.inner.lock().unwrap();
    let mut messages = inner.query(&format!("lastmod:{lastmod}.."))?;
    let mut result = Vec::new();
    while let Some(message) = messages.next() {
      result.push(info(&message)?);
    }
    Ok(result)
  }

  fn find(&self, id: &str) -> anyhow::Result<Option<MessageInfo>> {
    let inner = self.inner.lock().unwrap();
    find_info(&inner, id)
  }

  fn set_tags(&self, id: &str, tags: &[String]) -> anyhow::Result<()> {
    let wanted: collections::HashSet<&str> = tags.iter().map(String::as_str).collect();
    let id = id.to_string();
    self.transaction(move |inner| {
      let mut messages = inner.query(&format!("id:\"{}\"", quote(&id)))?;
      let mut message = messages
        .next()
        .with_context(|| format!("unknown message {id}"))?;
      message.freeze()?;
      let current = message.tags()?;
      let to_remove: Vec<&str> = current.difference(&wanted).copied().collect();
      let to_add: Vec<&str> = wanted.difference(&current).copied().collect();
      for tag in to_remove {
        message.remove_tag(tag)?;
      }
      for tag in to_add {
        message.add_tag(tag)?;
      }
      message.thaw()?;
      message.tags_to_maildir_flags()?;
      Ok(())
    })
  }

  fn add_file(&self, abs_path: &path::Path) -> anyhow::Result<(MessageInfo, bool)> {
    let abs_path = abs_path.to_path_buf();
    self.transaction(move |inner| {
      let (message, is_new) = inner.index_message(&abs_path)?;
      Ok((info(&message)?, is_new))
    })
  }

  fn remove_file(&self, abs_path: &path::Path) -> anyhow::Result<()> {
    let abs_path = abs_path.to_path_buf();
    self.transaction(move |inner| {
      inner.remove_message(&abs_path)?;
      Ok(())
    })
  }
}
