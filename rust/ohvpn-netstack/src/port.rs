//! Raw packet I/O on the TUN file descriptor.
//!
//! A [`PacketPort`] moves whole IP packets: one read returns one packet and
//! one vectored write emits one packet assembled from its segments.

use crate::error::{NetStackError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Capacity of a freshly allocated vector description
const IOVEC_CAPACITY: usize = 64;
/// Upper bound on idle vector descriptions kept for reuse
const MAX_POOLED_IOVECS: usize = 32;

#[async_trait]
pub trait PacketPort: Send + Sync + 'static {
    /// Read one packet into `buf`, returning its length.
    ///
    /// An error is terminal: the descriptor is closed or broken and the
    /// caller must stop reading.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet made of `segments`, in order, with a single
    /// vectored write. Empty segments are skipped and an empty list is a
    /// no-op returning `Ok(0)`.
    async fn write_packets(&self, segments: &[&[u8]]) -> io::Result<usize>;
}

/// Vector description handed to `writev`.
struct IoVecs(Vec<libc::iovec>);

// SAFETY: the pointers are only populated for the duration of one `writev`
// call and the vector is cleared before it goes back to the pool.
unsafe impl Send for IoVecs {}

/// Pool of reusable `iovec` arrays for the write path.
pub(crate) struct IoVecPool {
    free: Mutex<Vec<IoVecs>>,
}

impl IoVecPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` with an `iovec` array describing the non-empty `segments`.
    fn with_iovecs<R>(&self, segments: &[&[u8]], f: impl FnOnce(&[libc::iovec]) -> R) -> R {
        let mut iovecs = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| IoVecs(Vec::with_capacity(IOVEC_CAPACITY.max(segments.len()))));

        iovecs.0.extend(segments.iter().filter(|s| !s.is_empty()).map(|s| libc::iovec {
            iov_base: s.as_ptr() as *mut libc::c_void,
            iov_len: s.len(),
        }));

        let result = f(&iovecs.0);

        iovecs.0.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_IOVECS {
            free.push(iovecs);
        }
        result
    }

    #[cfg(test)]
    fn retained_entries(&self) -> usize {
        self.free.lock().iter().map(|v| v.0.len()).sum()
    }
}

/// [`PacketPort`] over a file descriptor owned by the caller.
///
/// The descriptor is duplicated, so dropping the port never closes the
/// caller's handle.
pub struct FdPacketPort {
    fd: AsyncFd<OwnedFd>,
    iovecs: IoVecPool,
}

impl FdPacketPort {
    /// Must be called from within a tokio runtime.
    pub fn from_raw_fd(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(NetStackError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file descriptor {}", fd),
            )));
        }

        // SAFETY: dup only reads the descriptor table
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        debug!("Duplicated TUN fd: {} -> {}", fd, dup_fd);

        // SAFETY: dup_fd is a fresh descriptor we own
        let owned = unsafe { OwnedFd::from_raw_fd(dup_fd) };
        set_nonblocking(owned.as_raw_fd())?;

        Ok(Self {
            fd: AsyncFd::new(owned)?,
            iovecs: IoVecPool::new(),
        })
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn cvt(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[async_trait]
impl PacketPort for FdPacketPort {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                // SAFETY: buf is valid for buf.len() bytes
                cvt(unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                })
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packets(&self, segments: &[&[u8]]) -> io::Result<usize> {
        if segments.iter().all(|s| s.is_empty()) {
            return Ok(0);
        }

        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                self.iovecs.with_iovecs(segments, |iov| {
                    // SAFETY: every iovec points into a live segment borrowed for this call
                    cvt(unsafe {
                        libc::writev(inner.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int)
                    })
                })
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn test_iovec_pool_skips_empty_and_clears() {
        let pool = IoVecPool::new();
        let segments: [&[u8]; 4] = [b"ab", b"", b"cde", b""];

        let total = pool.with_iovecs(&segments, |iov| {
            assert_eq!(iov.len(), 2);
            iov.iter().map(|v| v.iov_len).sum::<usize>()
        });

        assert_eq!(total, 5);
        assert_eq!(pool.retained_entries(), 0);
    }

    #[tokio::test]
    async fn test_fd_port_writes_one_datagram() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let port = FdPacketPort::from_raw_fd(ours.as_raw_fd()).unwrap();

        let header = [0x45u8, 0, 0, 8];
        let payload = [1u8, 2, 3, 4];
        let empty: &[u8] = &[];
        let n = port
            .write_packets(&[&header[..], empty, &payload[..]])
            .await
            .unwrap();
        assert_eq!(n, 8);

        let mut buf = [0u8; 64];
        let n = theirs.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x45, 0, 0, 8, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_fd_port_empty_write_is_noop() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        let port = FdPacketPort::from_raw_fd(ours.as_raw_fd()).unwrap();

        let empty: &[u8] = &[];
        assert_eq!(port.write_packets(&[]).await.unwrap(), 0);
        assert_eq!(port.write_packets(&[empty, empty]).await.unwrap(), 0);

        let mut buf = [0u8; 16];
        let err = theirs.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_fd_port_reads_and_keeps_caller_fd() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let port = FdPacketPort::from_raw_fd(ours.as_raw_fd()).unwrap();

        theirs.send(&[0x60, 1, 2]).unwrap();
        let mut buf = [0u8; 16];
        let n = port.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x60, 1, 2]);

        drop(port);
        // The original descriptor stays usable after the port is gone.
        ours.send(&[0x45]).unwrap();
        let n = theirs.recv(&mut buf).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_negative_fd_rejected() {
        assert!(FdPacketPort::from_raw_fd(-1).is_err());
    }
}
