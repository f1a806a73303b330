use std::io::{ErrorKind, Read, Write};
use std::process::Child;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode_header, encode_frame, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Thread-safe framed transport over one inbound and one outbound stream.
///
/// The two halves are guarded by independent locks: one thread may send
/// while another receives. A receive consumes header and body as one unit
/// under the receive lock, so interleaved readers never tear a frame.
pub struct Connection {
    send_half: Mutex<Option<Box<dyn Write + Send>>>,
    recv_half: Mutex<Option<Box<dyn Read + Send>>>,
    config: FrameConfig,
}

impl Connection {
    /// Create a connection over an arbitrary stream pair.
    pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self::with_config(reader, writer, FrameConfig::default())
    }

    /// Create a connection with explicit configuration.
    pub fn with_config(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        config: FrameConfig,
    ) -> Self {
        Self {
            send_half: Mutex::new(Some(Box::new(writer))),
            recv_half: Mutex::new(Some(Box::new(reader))),
            config,
        }
    }

    /// Worker-side constructor: frames travel over this process's own
    /// stdin/stdout.
    ///
    /// Once the connection owns stdout, the process must not print to it —
    /// diagnostics belong on stderr.
    pub fn stdio() -> Self {
        Self::new(std::io::stdin(), std::io::stdout())
    }

    /// Parent-side constructor: takes the piped stdin/stdout of a spawned
    /// worker. Fails with [`FrameError::NotPiped`] if either pipe is absent.
    ///
    /// The child handle itself stays with the caller; process lifecycle is
    /// not this crate's concern.
    pub fn from_child(child: &mut Child) -> Result<Self> {
        let stdin = child.stdin.take().ok_or(FrameError::NotPiped)?;
        let stdout = child.stdout.take().ok_or(FrameError::NotPiped)?;
        Ok(Self::new(stdout, stdin))
    }

    /// Send one frame: 8-byte length header plus exactly `payload`, flushed.
    ///
    /// Serialized against other senders by the send lock; receivers are not
    /// blocked.
    pub fn send_bytes(&self, payload: &[u8]) -> Result<()> {
        let mut guard = lock(&self.send_half);
        let writer = guard.as_mut().ok_or(FrameError::Closed)?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        encode_frame(payload, &mut buf);
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Receive one frame and return its payload.
    ///
    /// Header and body are read as one unit under the receive lock. A short
    /// read before stream end fails with [`FrameError::Eof`] — this is how
    /// peer disconnect surfaces. A header exceeding the configured
    /// `max_frame_len` closes the connection and fails the receive.
    pub fn recv_bytes(&self) -> Result<Bytes> {
        let mut guard = lock(&self.recv_half);
        let reader = guard.as_mut().ok_or(FrameError::Closed)?;

        let mut header = [0u8; HEADER_SIZE];
        read_exact_or_eof(reader, &mut header)?;
        let len = decode_header(header);

        if let Some(max) = self.config.max_frame_len {
            if len > max {
                tracing::warn!(len, max, "oversized frame header, closing connection");
                return Err(self.close_from_recv(guard, len, max));
            }
        }
        let Ok(body_len) = usize::try_from(len) else {
            // Length does not fit the address space; treat like an
            // over-ceiling header rather than attempting the allocation.
            tracing::warn!(len, "unaddressable frame length, closing connection");
            return Err(self.close_from_recv(guard, len, usize::MAX as u64));
        };

        let mut body = BytesMut::zeroed(body_len);
        read_exact_or_eof(reader, &mut body)?;
        Ok(body.freeze())
    }

    /// Serialize a structured value and send it as one frame.
    pub fn send_value<T: Serialize>(&self, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.send_bytes(&encoded)
    }

    /// Receive one frame and decode it as a structured value.
    pub fn recv_value<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.recv_bytes()?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Close both directions. Idempotent; later sends and receives fail
    /// with [`FrameError::Closed`].
    pub fn close(&self) {
        lock(&self.send_half).take();
        lock(&self.recv_half).take();
    }

    /// Drop both halves while already holding the receive guard, then
    /// report the offending length.
    fn close_from_recv(
        &self,
        mut recv_guard: MutexGuard<'_, Option<Box<dyn Read + Send>>>,
        len: u64,
        max: u64,
    ) -> FrameError {
        recv_guard.take();
        drop(recv_guard);
        lock(&self.send_half).take();
        FrameError::FrameTooLarge { len, max }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_exact_or_eof<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            FrameError::Eof
        } else {
            FrameError::Io(err)
        }
    })
}
