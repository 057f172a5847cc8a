// The byte stream the codec frames run over: either our own stdin/stdout
// (remote mode) or a subprocess we spawned to get to the other side (driver
// mode, normally `ssh host notmuch-sync --remote ...`).

use anyhow::Context as _;
use std::{
  io::{self, Read as _, Write as _},
  process,
};

/// Glues together a separate readable and writable half into the single
/// `Read + Write` type the frame codec wants.
pub struct Pipe<R, W> {
  recv: R,
  send: W,
}

impl<R, W> Pipe<R, W> {
  pub fn new(recv: R, send: W) -> Self {
    Self { recv, send }
  }
}

impl<R, W> io::Read for Pipe<R, W>
where
  R: io::Read,
{
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.recv.read(buf)
  }
}

impl<R, W> io::Write for Pipe<R, W>
where
  W: io::Write,
{
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.send.write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.send.flush()
  }
}

pub type Stdio = Pipe<io::Stdin, io::Stdout>;

pub fn stdio() -> Stdio {
  Pipe::new(io::stdin(), io::stdout())
}

pub type Subprocess = Pipe<process::ChildStdout, process::ChildStdin>;

/// Spawns `remote_cmd` through the shell (so it can itself contain e.g. `ssh
/// host notmuch-sync --remote /path`) and wires its stdio into a `Pipe`. The
/// child is kept alive inside the returned handle; dropping it waits for exit.
pub struct Child {
  child: process::Child,
  pipe: Subprocess,
}

impl Child {
  pub fn spawn(remote_cmd: &str) -> anyhow::Result<Self> {
    let mut child = process::Command::new("/bin/sh")
      .arg("-c")
      .arg(remote_cmd)
      .stdin(process::Stdio::piped())
      .stdout(process::Stdio::piped())
      .spawn()
      .with_context(|| format!("couldn't spawn {remote_cmd:?}"))?;
    let stdout = child.stdout.take().context("child has no stdout")?;
    let stdin = child.stdin.take().context("child has no stdin")?;
    Ok(Self {
      child,
      pipe: Pipe::new(stdout, stdin),
    })
  }

  pub fn pipe(&mut self) -> &mut Subprocess {
    &mut self.pipe
  }

  /// Waits for the child to exit and surfaces a non-zero status as an error.
  /// Intended to be called after the protocol has run to completion.
  pub fn wait(mut self) -> anyhow::Result<()> {
    drop(self.pipe);
    let status = self.child.wait()?;
    anyhow::ensure!(status.success(), "{status}");
    Ok(())
  }
}
