//! Modem channel manager.
//!
//! Owns the AT-command file descriptor. Writes are retried until the whole
//! command is out (or [`WRITE_TIMEOUT`] passes); reads take at most
//! [`RECV_BUF_LEN`] bytes per readiness event. Anything still pending in the
//! kernel stays there and is returned by the next [`ModemChannel::read_chunk`].

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::unix::AsyncFd;

use crate::error::BridgeError;

/// Receive buffer size; one read never returns more than this.
pub const RECV_BUF_LEN: usize = 1024;

/// Upper bound on how long a single command write may take.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Anything that can stand in for the modem TTY.
///
/// The descriptor must already be in non-blocking mode.
pub trait ModemDevice: Read + Write + AsRawFd + Send {}

impl ModemDevice for std::fs::File {}
impl ModemDevice for std::os::unix::net::UnixStream {}

struct DeviceIo(Box<dyn ModemDevice>);

impl DeviceIo {
    fn register(device: Box<dyn ModemDevice>) -> io::Result<AsyncFd<DeviceIo>> {
        // SAFETY: the boxed device owns its descriptor and is never replaced,
        // so the fd stays open and unchanged until the AsyncFd is dropped.
        let fd = unsafe { AsyncFd::register(DeviceIo(device)) }?;
        Ok(fd)
    }
}

impl AsRawFd for DeviceIo {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Result of one readiness event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Bytes),
    /// The device reported end-of-file; the channel is now closed.
    Closed,
}

pub struct ModemChannel {
    path: Option<PathBuf>,
    io: Option<AsyncFd<DeviceIo>>,
    buf: Vec<u8>,
}

impl std::fmt::Debug for ModemChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModemChannel")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ModemChannel {
    /// A channel with no device: every send fails with `NotConnected`.
    pub fn disabled() -> Self {
        Self {
            path: None,
            io: None,
            buf: vec![0; RECV_BUF_LEN],
        }
    }

    /// A closed channel that remembers `path` for a later [`ModemChannel::reopen`].
    pub fn unopened(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::disabled()
        }
    }

    /// Open `path` for non-blocking read/write.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let mut channel = Self::unopened(path);
        channel.reopen()?;
        Ok(channel)
    }

    /// Wrap an already-open device. `path` is only used for logging and
    /// for [`ModemChannel::reopen`].
    pub fn attach(device: impl ModemDevice + 'static, path: Option<PathBuf>) -> io::Result<Self> {
        let io = DeviceIo::register(Box::new(device))?;
        Ok(Self {
            path,
            io: Some(io),
            buf: vec![0; RECV_BUF_LEN],
        })
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    pub fn device_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// (Re)open the configured device path.
    pub fn reopen(&mut self) -> Result<(), BridgeError> {
        let Some(path) = self.path.clone() else {
            return Err(BridgeError::NotConnected);
        };
        let unavailable = |source| BridgeError::ChannelUnavailable {
            path: path.clone(),
            source,
        };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(&path)
            .map_err(unavailable)?;
        let io = DeviceIo::register(Box::new(file)).map_err(unavailable)?;
        self.io = Some(io);
        tracing::info!(device = %path.display(), "modem channel open");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.io.take().is_some() {
            tracing::info!(device = ?self.path, "modem channel closed");
        }
    }

    /// Write `command` in full.
    ///
    /// Interrupted and would-block conditions are retried. A short write that
    /// cannot be completed within [`WRITE_TIMEOUT`] fails with
    /// `IncompleteWrite`; success is only reported once every byte is out.
    pub async fn send(&mut self, command: &str) -> Result<(), BridgeError> {
        let fd = self.io.as_mut().ok_or(BridgeError::NotConnected)?;
        let bytes = command.as_bytes();
        let expected = bytes.len();
        let mut written = 0usize;

        let outcome = tokio::time::timeout(WRITE_TIMEOUT, async {
            while written < expected {
                let mut guard = fd.writable_mut().await?;
                match guard.try_io(|inner| inner.get_mut().0.write(&bytes[written..])) {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => written += n,
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => continue,
                }
            }
            Ok(())
        })
        .await;

        match outcome {
            Ok(Ok(())) if written == expected => Ok(()),
            Ok(Ok(())) | Err(_) => Err(BridgeError::IncompleteWrite { written, expected }),
            Ok(Err(e)) => Err(BridgeError::Io(e)),
        }
    }

    /// Wait for the device to become readable and take one chunk.
    ///
    /// Never resolves while the channel is closed. A hard read error closes
    /// the channel and is returned to the caller.
    pub async fn read_chunk(&mut self) -> Result<ReadOutcome, BridgeError> {
        let Some(fd) = self.io.as_mut() else {
            return std::future::pending().await;
        };
        let buf = &mut self.buf;

        let result = loop {
            let mut guard = match fd.readable_mut().await {
                Ok(guard) => guard,
                Err(e) => break Err(e),
            };
            match guard.try_io(|inner| inner.get_mut().0.read(&mut buf[..])) {
                Ok(Ok(n)) => break Ok(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => break Err(e),
                Err(_would_block) => continue,
            }
        };

        match result {
            Ok(0) => {
                self.close();
                Ok(ReadOutcome::Closed)
            }
            Ok(n) => Ok(ReadOutcome::Data(Bytes::copy_from_slice(&self.buf[..n]))),
            Err(e) => {
                self.close();
                Err(BridgeError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (ModemChannel, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let channel = ModemChannel::attach(ours, Some("/dev/ttyTEST".into())).unwrap();
        (channel, theirs)
    }

    #[tokio::test]
    async fn send_on_disabled_channel_is_not_connected() {
        let mut channel = ModemChannel::disabled();
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send("AT+CSQ\r\n").await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn open_missing_device_is_unavailable() {
        let err = ModemChannel::open("/nonexistent/ttyUSB9").unwrap_err();
        assert!(matches!(err, BridgeError::ChannelUnavailable { .. }));
    }

    #[tokio::test]
    async fn send_writes_whole_command() {
        let (mut channel, mut modem) = pair();
        channel.send("AT+CSQ\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = modem.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"AT+CSQ\r\n");
    }

    #[tokio::test]
    async fn large_command_survives_partial_writes() {
        let (mut channel, modem) = pair();
        // Bigger than the socket buffer, so the writer sees WouldBlock.
        let command = "A".repeat(512 * 1024);
        let expected = command.len();

        let reader = std::thread::spawn(move || {
            let mut modem = modem;
            let mut total = 0;
            let mut buf = [0u8; 8192];
            while total < expected {
                match modem.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(_) => break,
                }
            }
            total
        });

        channel.send(&command).await.unwrap();
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[tokio::test]
    async fn stalled_write_reports_incomplete() {
        let (mut channel, _modem) = pair();
        // Nobody reads, so the socket buffer fills and the write stalls.
        let command = "B".repeat(4 * 1024 * 1024);
        match channel.send(&command).await {
            Err(BridgeError::IncompleteWrite { written, expected }) => {
                assert!(written < expected);
                assert_eq!(expected, command.len());
            }
            other => panic!("expected IncompleteWrite, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_is_bounded_by_buffer() {
        let (mut channel, mut modem) = pair();
        let payload = vec![b'x'; RECV_BUF_LEN + 100];
        modem.write_all(&payload).unwrap();

        let mut total = 0;
        while total < payload.len() {
            match channel.read_chunk().await.unwrap() {
                ReadOutcome::Data(chunk) => {
                    assert!(chunk.len() <= RECV_BUF_LEN);
                    total += chunk.len();
                }
                ReadOutcome::Closed => panic!("unexpected close"),
            }
        }
        assert_eq!(total, payload.len());
    }

    #[tokio::test]
    async fn eof_closes_channel() {
        let (mut channel, modem) = pair();
        drop(modem);
        assert_eq!(channel.read_chunk().await.unwrap(), ReadOutcome::Closed);
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send("AT\r\n").await,
            Err(BridgeError::NotConnected)
        ));
    }
}
