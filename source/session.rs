// Session orchestrator: the fixed phase sequence both peers run in lockstep.
// Single-threaded, fully sequential — any deviation in frame order between
// the two sides is a protocol bug, not a recoverable error.

use crate::{
  changes, checkpoint,
  codec::Frame,
  delete, mbsync, merge,
  model::Database,
  reconcile,
};
use serde::{Deserialize, Serialize};
use std::io;

pub struct Options {
  pub driver: bool,
  pub delete: bool,
  pub no_check: bool,
  pub mbsync: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Summary {
  pub new_messages: u64,
  pub new_files: u64,
  pub copied_or_moved: u64,
  pub deleted_files: u64,
  pub tag_changes: u64,
  pub messages_deleted: u64,
}

impl Summary {
  fn line(&self, label: &str) -> String {
    format!(
      "{label}:\t{} new messages,\t{} new files,\t{} files copied/moved,\t{} files deleted,\t{} messages with tag changes,\t{} messages deleted",
      self.new_messages, self.new_files, self.copied_or_moved, self.deleted_files, self.tag_changes, self.messages_deleted
    )
  }
}

/// Exchange one JSON value with the peer. `driver` decides which side writes
/// first: on a pipe with a bounded kernel buffer, both sides writing before
/// either reads can deadlock once a payload outgrows that buffer, so exactly
/// one side must commit to write-then-read and the other to read-then-write.
pub fn exchange<S, T>(frame: &mut Frame<S>, driver: bool, mine: &T) -> anyhow::Result<T>
where
  S: io::Read + io::Write,
  T: Serialize + serde::de::DeserializeOwned,
{
  if driver {
    frame.write_json(mine)?;
    frame.read_json()
  } else {
    let theirs = frame.read_json()?;
    frame.write_json(mine)?;
    Ok(theirs)
  }
}

/// Runs one full sync over `frame`. Returns (our summary, peer's summary) so
/// callers can print the two-line status report.
pub fn run<S>(frame: &mut Frame<S>, db: &dyn Database, options: &Options) -> anyhow::Result<(Summary, Summary)>
where
  S: io::Read + io::Write,
{
  // Step 1: UUID handshake, unframed.
  let (_, our_uuid) = db.revision()?;
  let their_uuid = if options.driver {
    frame.write_uuid_raw(&our_uuid)?;
    frame.read_uuid_raw()?
  } else {
    let their_uuid = frame.read_uuid_raw()?;
    frame.write_uuid_raw(&our_uuid)?;
    their_uuid
  };
  log::debug!("handshake complete, peer uuid {their_uuid}");

  let checkpoint_path = checkpoint::path_for(db.default_path(), &their_uuid);
  let extracted = changes::extract(db, &checkpoint_path)?;

  // Step 2: change set exchange.
  log::debug!("exchanging change sets ({} of ours)", extracted.changes.len());
  let theirs = exchange(frame, options.driver, &extracted.changes)?;

  // Step 3: tag merge, no frames.
  let tag_changes = merge::merge(db, &extracted.changes, &theirs)?;
  log::debug!("merged tags on {tag_changes} messages");
  crate::interrupt(crate::Interruption::PostTagMerge)?;

  // Step 4: classify + missing-names exchange.
  let reconciled = reconcile::classify(db, &extracted.changes, &theirs, options.delete)?;
  log::debug!("requesting {} messages worth of files from peer", reconciled.missing.len());
  let peer_missing = exchange(frame, options.driver, &reconciled.missing)?;

  // Step 5: byte transfer.
  crate::interrupt(crate::Interruption::MidFileTransfer)?;
  let new_files = reconcile::transfer(
    frame,
    db,
    db.default_path(),
    options.driver,
    &reconciled.missing,
    &peer_missing,
  )?;
  log::debug!("received {new_files} files");

  // Step 6: deletion propagation.
  let our_deleted = delete::locally_deleted(&extracted.changes);
  let peer_deleted = exchange(frame, options.driver, &our_deleted)?;
  let messages_deleted = delete::apply(
    db,
    &our_deleted,
    &peer_deleted,
    &extracted.changes,
    &theirs,
    options.delete,
    options.no_check,
  )?;
  log::debug!("{messages_deleted} messages deleted locally this sync");

  if options.mbsync {
    log::debug!("syncing mbsync sidecar files");
    mbsync::run(frame, db.default_path(), options.driver)?;
  }

  let our_summary = Summary {
    new_messages: reconciled.new_messages,
    new_files,
    copied_or_moved: reconciled.copied_or_moved,
    deleted_files: reconciled.deleted_files,
    tag_changes,
    messages_deleted,
  };
  let peer_summary = exchange(frame, options.driver, &our_summary)?;

  // Step 7: new checkpoint, written last and atomically so an interruption
  // anywhere above leaves the prior checkpoint (and thus a safely rerunnable
  // state) in place.
  crate::interrupt(crate::Interruption::PreCheckpointWrite)?;
  let (new_revision, _) = db.revision()?;
  checkpoint::write(&checkpoint_path, new_revision, &our_uuid)?;

  Ok((our_summary, peer_summary))
}

/// The two-line status report. Only the driver prints this: the remote
/// side's stdout is the wire itself.
pub fn report(local: &Summary, remote: &Summary) -> String {
  format!("{}\n{}\n", local.line("local"), remote.line("remote"))
}
