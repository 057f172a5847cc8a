// mbsync sidecar sync: keeps `.mbsyncstate`/`.uidvalidity` files in step
// between replicas by mtime, independent of and best-effort relative to the
// message/tag reconciliation above.

use crate::{codec::Frame, session};
use anyhow::Context as _;
use std::{collections, fs, io, path};

const SIDECAR_NAMES: [&str; 2] = [".mbsyncstate", ".uidvalidity"];

fn is_sidecar(name: &std::ffi::OsStr) -> bool {
  SIDECAR_NAMES.iter().any(|candidate| name == *candidate)
}

fn walk(root: &path::Path, directory: &path::Path, into: &mut collections::BTreeMap<String, f64>) -> anyhow::Result<()> {
  for entry in fs::read_dir(directory).with_context(|| format!("couldn't read {directory:?}"))? {
    let entry = entry?;
    let path = entry.path();
    let file_type = entry.file_type()?;
    if file_type.is_dir() {
      walk(root, &path, into)?;
    } else if file_type.is_file() && is_sidecar(entry.file_name().as_os_str()) {
      let metadata = entry.metadata()?;
      let mtime = filetime::FileTime::from_last_modification_time(&metadata);
      let name = path
        .strip_prefix(root)
        .with_context(|| format!("{path:?} is not under {root:?}"))?
        .to_string_lossy()
        .into_owned();
      into.insert(name, mtime.seconds() as f64 + mtime.nanoseconds() as f64 / 1e9);
    }
  }
  Ok(())
}

fn collect_mtimes(root: &path::Path) -> anyhow::Result<collections::BTreeMap<String, f64>> {
  let mut mtimes = collections::BTreeMap::new();
  if root.is_dir() {
    walk(root, root, &mut mtimes)?;
  }
  Ok(mtimes)
}

fn send_files<S>(frame: &mut Frame<S>, root: &path::Path, names: &[String]) -> anyhow::Result<()>
where
  S: io::Read + io::Write,
{
  for name in names {
    let path = root.join(name);
    let bytes = fs::read(&path).with_context(|| format!("couldn't read {path:?}"))?;
    frame.write_frame(&bytes)?;
  }
  Ok(())
}

fn receive_files<S>(
  frame: &mut Frame<S>,
  root: &path::Path,
  names: &[String],
  peer_mtimes: &collections::BTreeMap<String, f64>,
) -> anyhow::Result<()>
where
  S: io::Read + io::Write,
{
  for name in names {
    let bytes = frame.read_frame()?;
    let path = root.join(name);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::write(&path, &bytes).with_context(|| format!("couldn't write {path:?}"))?;
    if let Some(&mtime) = peer_mtimes.get(name) {
      let time = filetime::FileTime::from_unix_time(mtime.trunc() as i64, (mtime.fract() * 1e9) as u32);
      filetime::set_file_mtime(&path, time).with_context(|| format!("couldn't set mtime on {path:?}"))?;
    }
  }
  Ok(())
}

/// Runs one mbsync sidecar sync over `frame`. Independent protocol phase:
/// its own mtime-map exchange, its own want-list exchange, its own transfer.
pub fn run<S>(frame: &mut Frame<S>, root: &path::Path, driver: bool) -> anyhow::Result<()>
where
  S: io::Read + io::Write,
{
  let local = collect_mtimes(root)?;
  let peer = session::exchange(frame, driver, &local)?;

  let want: Vec<String> = peer
    .iter()
    .filter(|(name, &peer_mtime)| match local.get(*name) {
      Some(&local_mtime) => peer_mtime > local_mtime,
      None => true,
    })
    .map(|(name, _)| name.clone())
    .collect();
  let peer_wants = session::exchange(frame, driver, &want)?;

  if driver {
    send_files(frame, root, &peer_wants)?;
    receive_files(frame, root, &want, &peer)?;
  } else {
    receive_files(frame, root, &want, &peer)?;
    send_files(frame, root, &peer_wants)?;
  }
  Ok(())
}
