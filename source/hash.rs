// Canonical SHA-256 of a mail file: identical to a plain SHA-256 except the
// first `X-TUID: ...` header line is elided, since some delivery tooling
// rewrites it without the message being logically different.
//
// Streaming: callers feed bytes incrementally (`update`), so hashing a large
// file never requires buffering the whole thing.

use sha2::Digest as _;
use std::io;

const X_TUID_PREFIX: &[u8] = b"X-TUID: ";

pub struct Hasher {
  inner: sha2::Sha256,
  in_headers: bool,
  // Bytes of the current line seen so far, held back until we know whether
  // the line is an X-TUID header (and thus must be dropped) or not.
  pending: Vec<u8>,
}

impl Hasher {
  pub fn new() -> Self {
    Self {
      inner: sha2::Sha256::new(),
      in_headers: true,
      pending: Vec::new(),
    }
  }

  pub fn update(&mut self, mut bytes: &[u8]) {
    while self.in_headers && !bytes.is_empty() {
      match memchr::memchr(b'\n', bytes) {
        Some(at) => {
          self.pending.extend_from_slice(&bytes[..=at]);
          bytes = &bytes[at + 1..];
          self.flush_pending_line();
        }
        None => {
          self.pending.extend_from_slice(bytes);
          return;
        }
      }
    }
    if !bytes.is_empty() {
      self.inner.update(bytes);
    }
  }

  fn flush_pending_line(&mut self) {
    let line = std::mem::take(&mut self.pending);
    if line == b"\n" || line == b"\r\n" {
      // The blank line ending the header block: everything after feeds the
      // hash unmodified from here on.
      self.in_headers = false;
      self.inner.update(&line);
      return;
    }
    if line.starts_with(X_TUID_PREFIX) {
      return; // Dropped.
    }
    self.inner.update(&line);
  }

  pub fn finalize(mut self) -> String {
    if !self.pending.is_empty() {
      let line = std::mem::take(&mut self.pending);
      if !line.starts_with(X_TUID_PREFIX) {
        self.inner.update(&line);
      }
    }
    hex::encode(self.inner.finalize())
  }
}

impl Default for Hasher {
  fn default() -> Self {
    Self::new()
  }
}

/// Hash a complete in-memory buffer.
pub fn digest(bytes: &[u8]) -> String {
  let mut hasher = Hasher::new();
  hasher.update(bytes);
  hasher.finalize()
}

/// Hash a reader's content without loading it whole; used when reading
/// straight from a mail file on disk.
pub fn digest_reader<R>(mut reader: R) -> io::Result<String>
where
  R: io::Read,
{
  let mut hasher = Hasher::new();
  let mut buffer = [0u8; 64 * 1024];
  loop {
    let read = reader.read(&mut buffer)?;
    if read == 0 {
      break;
    }
    hasher.update(&buffer[..read]);
  }
  Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn matches_plain_sha256_without_x_tuid() {
    let message = b"From: a\r\nTo: b\r\n\r\nbody";
    let mut plain = sha2::Sha256::new();
    plain.update(message);
    assert_eq!(hex::encode(plain.finalize()), digest(message));
  }

  #[test]
  fn elides_x_tuid_header_line() {
    let with = b"From: a\nX-TUID: abcdef\nTo: b\n\nbody";
    let without = b"From: a\nTo: b\n\nbody";
    assert_eq!(digest(without), digest(with));
  }

  #[test]
  fn does_not_elide_x_tuid_like_text_in_the_body() {
    let with = b"From: a\n\nX-TUID: this is body text, not a header";
    let without = b"From: a\n\n";
    assert_ne!(digest(without), digest(with));
  }

  #[test]
  fn streaming_matches_whole_buffer() {
    let message = b"From: a\nX-TUID: abcdef\nSubject: hi\n\nbody line one\nbody line two\n";
    let whole = digest(message);
    let mut hasher = Hasher::new();
    for chunk in message.chunks(3) {
      hasher.update(chunk);
    }
    assert_eq!(whole, hasher.finalize());
  }

  #[test]
  fn no_header_block_at_all() {
    // A buffer with no blank line still hashes deterministically and streams fine.
    let message = b"not really a mail message";
    assert_eq!(digest(message), digest(message));
  }
}
