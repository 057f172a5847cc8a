// Bidirectional reconciliation of a Maildir/notmuch replica against a peer
// reached over a subprocess's stdio, typically `ssh host notmuch-sync
// --remote /path/to/db`. See the component modules for the phases of one
// sync; this module is just argument parsing and wiring.

use std::{collections, error, fmt, path, thread};

pub mod changes;
pub mod checkpoint;
pub mod codec;
pub mod delete;
pub mod hash;
pub mod mbsync;
pub mod merge;
pub mod model;
pub mod notmuch;
pub mod reconcile;
pub mod session;
#[cfg(test)]
pub(crate) mod tests_support;
pub mod transport;

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "Path to the local notmuch database")]
  pub db_path: path::PathBuf,

  #[arg(
    long = "remote-cmd",
    help = "Spawn this command (via /bin/sh -c) and speak the protocol over its stdio; omit to run in remote mode over this process's own stdin/stdout"
  )]
  pub remote_cmd: Option<String>,

  #[arg(long = "verbose", help = "Emit phase-boundary progress lines")]
  pub verbose: bool,

  #[arg(
    long = "delete",
    help = "Actually remove files and propagate message deletions, instead of only tagging 'deleted'"
  )]
  pub delete: bool,

  #[arg(long = "mbsync", help = "Also sync .mbsyncstate/.uidvalidity sidecar files")]
  pub mbsync: bool,

  #[arg(
    long = "no-check",
    help = "Disable the deletion failsafe (dangerous: can delete messages the peer just changed)"
  )]
  pub no_check: bool,

  #[arg(long = "interruption", help = "Internal testing facility", hide = true)]
  pub interruption: Option<Interruption>,
}

/// Points in `session::run` where a test can force a fatal error, to assert
/// that the prior checkpoint survives an interrupted sync untouched.
#[derive(Copy, Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Interruption {
  PostTagMerge,
  MidFileTransfer,
  PreCheckpointWrite,
}

impl fmt::Display for Interruption {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "{self:?}")
  }
}

impl error::Error for Interruption {}

static INTERRUPTIONS: once_cell::sync::Lazy<
  std::sync::Mutex<collections::HashMap<thread::ThreadId, Interruption>>,
> = once_cell::sync::Lazy::new(|| std::sync::Mutex::new(collections::HashMap::new()));

pub fn interruption(name: &Option<Interruption>) {
  match (
    name,
    INTERRUPTIONS.lock().unwrap().entry(thread::current().id()),
  ) {
    (Some(interruption), collections::hash_map::Entry::Occupied(mut occupied)) => {
      occupied.insert(*interruption);
    }
    (Some(interruption), collections::hash_map::Entry::Vacant(vacant)) => {
      vacant.insert(*interruption);
    }
    (None, collections::hash_map::Entry::Occupied(occupied)) => {
      occupied.remove();
    }
    (None, collections::hash_map::Entry::Vacant(_)) => (),
  }
}

pub(crate) fn interrupt(interruption: Interruption) -> Result<(), Interruption> {
  match INTERRUPTIONS.lock().unwrap().get(&thread::current().id()) {
    Some(interruption_) if *interruption_ == interruption => Err(interruption),
    _ => Ok(()),
  }
}

fn open_or_create(path: &path::Path) -> anyhow::Result<notmuch::Database> {
  match notmuch::Database::open(Some(path)) {
    Ok(database) => Ok(database),
    Err(error) => match error.downcast_ref::<notmuch::Error>() {
      Some(error) if error.no_database() => notmuch::Database::create(path),
      _ => Err(error),
    },
  }
}

fn remote_command(arguments: &Arguments) -> String {
  let mut command = arguments.remote_cmd.clone().unwrap_or_default();
  if arguments.delete {
    command.push_str(" --delete");
  }
  if arguments.mbsync {
    command.push_str(" --mbsync");
  }
  if arguments.no_check {
    command.push_str(" --no-check");
  }
  command
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  interruption(&arguments.interruption);

  let db = open_or_create(&arguments.db_path)?;
  let options = session::Options {
    driver: arguments.remote_cmd.is_some(),
    delete: arguments.delete,
    no_check: arguments.no_check,
    mbsync: arguments.mbsync,
  };

  match &arguments.remote_cmd {
    Some(_) => {
      let command = remote_command(arguments);
      log::debug!("spawning {command:?}");
      let mut child = transport::Child::spawn(&command)?;
      let (ours, theirs) = session::run(&mut codec::Frame::new(child.pipe()), &db, &options)?;
      child.wait()?;
      print!("{}", session::report(&ours, &theirs));
      Ok(())
    }
    None => {
      session::run(&mut codec::Frame::new(transport::stdio()), &db, &options)?;
      Ok(())
    }
  }
}
