// Length-prefixed framing over whatever bidirectional byte stream the
// transport hands us (a subprocess's piped stdio, or an in-memory duplex in
// tests). The protocol is positional, not self-describing: callers decide
// whether a frame's payload is JSON or opaque bytes.

use anyhow::Context as _;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{self, Read as _, Write as _};

/// Guards against a corrupt or adversarial length prefix turning into an
/// unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub struct Frame<S> {
  stream: S,
}

impl<S> Frame<S>
where
  S: io::Read + io::Write,
{
  pub fn new(stream: S) -> Self {
    Self { stream }
  }

  pub fn into_inner(self) -> S {
    self.stream
  }

  /// The one unframed primitive: 36 raw ASCII bytes, used only for the
  /// initial UUID handshake at the very start of a session.
  pub fn write_uuid_raw(&mut self, uuid: &str) -> anyhow::Result<()> {
    anyhow::ensure!(uuid.len() == 36, "{uuid:?} is not a 36-byte UUID");
    self.stream.write_all(uuid.as_bytes())?;
    Ok(())
  }

  pub fn read_uuid_raw(&mut self) -> anyhow::Result<String> {
    let mut buffer = [0u8; 36];
    self
      .stream
      .read_exact(&mut buffer)
      .with_context(|| "short read while reading peer UUID")?;
    String::from_utf8(buffer.to_vec()).with_context(|| "peer UUID is not valid UTF-8")
  }

  pub fn write_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
    let len: u32 = payload
      .len()
      .try_into()
      .with_context(|| "frame payload too large to fit a u32 length prefix")?;
    self.stream.write_all(&len.to_be_bytes())?;
    self.stream.write_all(payload)?;
    Ok(())
  }

  pub fn read_frame(&mut self) -> anyhow::Result<Vec<u8>> {
    let mut length = [0u8; 4];
    self
      .stream
      .read_exact(&mut length)
      .with_context(|| "short read while reading frame length")?;
    let length = u32::from_be_bytes(length);
    anyhow::ensure!(
      length <= MAX_FRAME_LEN,
      "frame of {length} bytes exceeds the {MAX_FRAME_LEN} byte limit"
    );
    let mut payload = vec![0u8; length as usize];
    self
      .stream
      .read_exact(&mut payload)
      .with_context(|| format!("short read while reading a {length}-byte frame"))?;
    Ok(payload)
  }

  pub fn write_json<T>(&mut self, value: &T) -> anyhow::Result<()>
  where
    T: Serialize,
  {
    self.write_frame(&serde_json::to_vec(value)?)
  }

  pub fn read_json<T>(&mut self) -> anyhow::Result<T>
  where
    T: DeserializeOwned,
  {
    let payload = self.read_frame()?;
    serde_json::from_slice(&payload)
      .with_context(|| format!("{:?} is not valid JSON for the expected frame", String::from_utf8_lossy(&payload)))
  }
}
