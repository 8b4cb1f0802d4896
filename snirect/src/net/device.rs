//! The host-supplied virtual interface as a raw framed device (spec §4.F).
//! Grounded on `core/stack.go`'s `TunStack` read loop, re-expressed around
//! tokio's `AsyncFd` so reads/writes suspend instead of blocking a thread.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

const MAX_FRAME: usize = 2048;

/// Shared upload/download byte counters, sampled once per second by the
/// speed ticker (spec §4.G.5).
#[derive(Default)]
pub struct ByteCounters {
  pub uploaded: AtomicU64,
  pub downloaded: AtomicU64,
}

/// A raw fd wrapper implementing blocking read/write through `AsyncFd`,
/// taking ownership of the descriptor for the engine's lifetime (spec §6,
/// `StartEngine` "takes ownership of the device handle").
pub struct TunDevice {
  inner: AsyncFd<OwnedFd>,
  pub counters: Arc<ByteCounters>,
}

impl TunDevice {
  /// # Safety
  /// `fd` must be a valid, open file descriptor the caller is transferring
  /// ownership of; the host guarantees its lifecycle per spec §2 ("Out of
  /// scope").
  pub unsafe fn from_raw_fd(fd: RawFd, counters: Arc<ByteCounters>) -> std::io::Result<Self> {
    let owned = OwnedFd::from_raw_fd(fd);
    Ok(Self {
      inner: AsyncFd::with_interest(owned, Interest::READABLE | Interest::WRITABLE)?,
      counters,
    })
  }

  pub fn raw_fd(&self) -> RawFd {
    self.inner.get_ref().as_raw_fd()
  }

  /// Reads one IP frame, counting its bytes into `uploaded` (device → stack,
  /// spec §4.F "Read loop").
  pub async fn read_frame(&self, buf: &mut [u8; MAX_FRAME]) -> std::io::Result<usize> {
    loop {
      let mut guard = self.inner.readable().await?;
      match guard.try_io(|inner| nix_read(inner.get_ref().as_raw_fd(), buf)) {
        Ok(result) => {
          let n = result?;
          self.counters.uploaded.fetch_add(n as u64, Ordering::Relaxed);
          return Ok(n);
        }
        Err(_would_block) => continue,
      }
    }
  }

  /// Writes one IP frame, counting its bytes into `downloaded` (stack →
  /// device, spec §4.F "Write loop").
  pub async fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
    loop {
      let mut guard = self.inner.writable().await?;
      match guard.try_io(|inner| nix_write(inner.get_ref().as_raw_fd(), frame)) {
        Ok(result) => {
          result?;
          self.counters.downloaded.fetch_add(frame.len() as u64, Ordering::Relaxed);
          return Ok(());
        }
        Err(_would_block) => continue,
      }
    }
  }
}

fn nix_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
  let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
  if n < 0 {
    Err(std::io::Error::last_os_error())
  } else {
    Ok(n as usize)
  }
}

fn nix_write(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
  let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
  if n < 0 {
    Err(std::io::Error::last_os_error())
  } else {
    Ok(n as usize)
  }
}

pub const fn max_frame_size() -> usize {
  MAX_FRAME
}
