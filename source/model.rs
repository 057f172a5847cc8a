use serde::{Deserialize, Serialize};
use std::{collections, error, fmt, path};

/// A single file copy of a message, relative to the database root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
  pub name: String,
  pub sha: String,
}

/// A message's state as of some `lastmod`, keyed externally by Message-ID.
///
/// `tags` is a `Vec` rather than a set: the merge algorithm's repopulation order
/// (theirs, then mine, duplicates skipped) is only reproducible from an ordered
/// collection (see merge::merged_tags).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
  pub tags: Vec<String>,
  pub files: Vec<FileRecord>,
}

/// BTreeMap, not HashMap: JSON object key order and iteration order must be
/// deterministic so sync runs are reproducible and testable.
pub type ChangeSet = collections::BTreeMap<String, ChangeRecord>;

/// An instruction to the peer: send the listed files. `tags` is present only
/// when the message is entirely new to the receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRecord {
  pub id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<Vec<String>>,
  pub files: Vec<FileRecord>,
}

/// The DB's view of one message, resolved by id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
  pub id: String,
  pub tags: Vec<String>,
  /// Absolute paths.
  pub files: Vec<path::PathBuf>,
  pub ghost: bool,
}

/// The narrow interface the core depends on. Implemented once against
/// libnotmuch (notmuch::Database) and once in-memory for tests
/// (tests_support::MockDb).
pub trait Database {
  /// Current (lastmod, uuid) of the database.
  fn revision(&self) -> anyhow::Result<(u64, String)>;
  /// Absolute directory the database is rooted at, ending with a separator.
  fn default_path(&self) -> &path::Path;
  /// Every message with lastmod >= `lastmod`, in `messages("lastmod:<N>..")` order.
  fn changed_since(&self, lastmod: u64) -> anyhow::Result<Vec<MessageInfo>>;
  /// Look a message up by id.
  fn find(&self, id: &str) -> anyhow::Result<Option<MessageInfo>>;
  /// Replace a message's tag set and flush maildir flags. Idempotent: callers
  /// should only invoke this when the desired set differs from the current one.
  fn set_tags(&self, id: &str, tags: &[String]) -> anyhow::Result<()>;
  /// Register `abs_path` with the database, returning the resulting message and
  /// whether the message was new (as opposed to linking an extra file onto one
  /// already known by Message-ID).
  fn add_file(&self, abs_path: &path::Path) -> anyhow::Result<(MessageInfo, bool)>;
  /// Unlink `abs_path` from its message; the message becomes ghost when it was
  /// its last file.
  fn remove_file(&self, abs_path: &path::Path) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub enum Error {
  CheckpointCorrupt {
    path: path::PathBuf,
  },
  UuidMismatch {
    old: String,
    current: String,
  },
  RevisionRegressed {
    old: u64,
    current: u64,
  },
  ChecksumMismatch {
    path: String,
    got: String,
    expected: String,
  },
  LocalFileClash {
    path: path::PathBuf,
  },
  Inconsistency {
    id: String,
    mine: Vec<FileRecord>,
    theirs: Vec<FileRecord>,
  },
  Protocol(String),
}

impl fmt::Display for Error {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::CheckpointCorrupt { path } => write!(
        formatter,
        "Sync state file '{}' corrupted, delete to sync from scratch.",
        path.display()
      ),
      Error::UuidMismatch { old, current } => write!(
        formatter,
        "Last sync with UUID {old} but notmuch DB has UUID {current}, aborting..."
      ),
      Error::RevisionRegressed { old, current } => write!(
        formatter,
        "Last sync revision {old} larger than current DB revision {current}, aborting..."
      ),
      Error::ChecksumMismatch {
        path,
        got,
        expected,
      } => write!(
        formatter,
        "Checksum of received file '{path}' ({got}) does not match expected ({expected})!"
      ),
      Error::LocalFileClash { path } => write!(
        formatter,
        "Set to receive '{}', but already exists with different content!",
        path.display()
      ),
      Error::Inconsistency { id, mine, theirs } => write!(
        formatter,
        "inconsistent file list for {id}: mine={mine:?} theirs={theirs:?}"
      ),
      Error::Protocol(message) => write!(formatter, "protocol error: {message}"),
    }
  }
}

impl error::Error for Error {}
