//! # Packet Buffer
//!
//! [`Packet`] is the unit of data exchanged through every transport in this
//! library: an owning, growable byte buffer with a read/write cursor, typed
//! accessors, prefix-encoded strings and in-place encryption.
//!
//! Three counters describe the buffer, and the invariant
//! `cursor <= used_size <= memory_size` holds at every observable point:
//!
//! - `memory_size` — allocated capacity
//! - `used_size` — bytes that carry valid data
//! - `used_size` is extended by writes at the cursor; reads past it fail
//!   with [`NetError::PacketUnderflow`] and leave the packet unchanged
//!
//! Typed accessors serialize scalars in the host's native byte order. This
//! is a deliberate, documented compatibility property: the wire format is
//! bit-exact only between hosts of the same endianness. Size-typed integers
//! are the exception — they are always 8 bytes little-endian so that peers
//! with different pointer widths agree on string prefixes and headers.
//!
//! A packet delivered by a transport carries routing tags: the client it
//! came from (`0` meaning "the server" or "not a client"), the datagram
//! operation, the instance, and the receipt time.
//!
//! While a background cipher task started by [`Packet::encrypt`] or
//! [`Packet::decrypt`] with `block = false` is outstanding, the packet is
//! *busy*: every data access fails with [`NetError::PacketBusy`] until
//! [`Packet::poll_cipher`] reports completion.

use std::time::{Duration, Instant};

use crate::crypto::{self, CipherKey, CipherOp, CipherStatus, CipherTask, TaskPoll};
use crate::error::{NetError, Result};

/// Scalar types a [`Packet`] can append and read natively.
///
/// Implemented for the fixed-width integers and floats; all use the host's
/// native byte order.
pub trait Scalar: Copy {
    /// Serialized width in bytes.
    const SIZE: usize;

    #[doc(hidden)]
    fn write_native(self, out: &mut [u8]);
    #[doc(hidden)]
    fn read_native(from: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {
        $(impl Scalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn write_native(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }

            fn read_native(from: &[u8]) -> Self {
                <$ty>::from_ne_bytes(from.try_into().unwrap())
            }
        })*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// An owning byte buffer with a cursor, typed accessors and routing tags.
///
/// See the [module documentation](self) for the data model.
#[derive(Default)]
pub struct Packet {
    buf: Vec<u8>,
    used: usize,
    cursor: usize,
    client_from: usize,
    operation_from: usize,
    instance_from: usize,
    received_at: Option<Instant>,
    cipher: Option<CipherTask>,
}

impl Packet {
    /// An empty packet with no allocation.
    pub fn new() -> Packet {
        Packet::default()
    }

    /// An empty packet with `memory_size` bytes preallocated.
    pub fn with_memory(memory_size: usize) -> Packet {
        Packet {
            buf: vec![0; memory_size],
            ..Packet::default()
        }
    }

    /// A packet holding `bytes`, cursor at the start.
    pub fn from_bytes(bytes: &[u8]) -> Packet {
        Packet {
            buf: bytes.to_vec(),
            used: bytes.len(),
            ..Packet::default()
        }
    }

    // Busy gate. Harvests a finished cipher task so callers that never poll
    // still regain access once the task is done.
    fn ensure_idle(&mut self) -> Result<()> {
        if self.cipher.is_some() {
            match self.poll_cipher() {
                CipherStatus::Pending => return Err(NetError::PacketBusy),
                CipherStatus::Done | CipherStatus::Failed => {}
            }
        }
        Ok(())
    }

    /// Allocated capacity in bytes.
    pub fn memory_size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes of valid data.
    pub fn used_size(&self) -> usize {
        self.used
    }

    /// Next read/write index.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Valid bytes left between cursor and `used_size`.
    pub fn remaining(&self) -> usize {
        self.used - self.cursor
    }

    /// The valid bytes, `[0, used_size)`.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Move the cursor. Clamped to `used_size` so reads stay in bounds.
    pub fn set_cursor(&mut self, cursor: usize) -> Result<()> {
        self.ensure_idle()?;
        self.cursor = cursor.min(self.used);
        Ok(())
    }

    /// Declare `used_size`. Allocation grows if needed; the invariant with
    /// the cursor is preserved.
    pub fn set_used_size(&mut self, used: usize) -> Result<()> {
        self.ensure_idle()?;
        if used > self.buf.len() {
            self.buf.resize(used, 0);
        }
        self.used = used;
        self.cursor = self.cursor.min(self.used);
        Ok(())
    }

    /// Reallocate to exactly `memory_size` bytes, discarding contents.
    pub fn set_memory_size(&mut self, memory_size: usize) -> Result<()> {
        self.ensure_idle()?;
        self.buf = vec![0; memory_size];
        self.used = 0;
        self.cursor = 0;
        Ok(())
    }

    /// Resize the allocation to `memory_size` bytes, preserving as much
    /// data as fits.
    pub fn change_memory_size(&mut self, memory_size: usize) -> Result<()> {
        self.ensure_idle()?;
        self.buf.resize(memory_size, 0);
        self.used = self.used.min(memory_size);
        self.cursor = self.cursor.min(self.used);
        Ok(())
    }

    /// Reset cursor and `used_size`, keeping the allocation.
    pub fn clear(&mut self) {
        self.used = 0;
        self.cursor = 0;
    }

    fn grow_for(&mut self, end: usize) {
        if end > self.buf.len() {
            // Amortized doubling keeps repeated small appends linear.
            let target = end.max(self.buf.len() * 2);
            self.buf.resize(target, 0);
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.cursor + bytes.len();
        self.grow_for(end);
        self.buf[self.cursor..end].copy_from_slice(bytes);
        self.cursor = end;
        self.used = self.used.max(end);
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.remaining() {
            return Err(NetError::PacketUnderflow {
                requested: len,
                available: self.remaining(),
            });
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.buf[start..start + len])
    }

    /// Append a scalar at the cursor in native byte order.
    pub fn add<T: Scalar>(&mut self, value: T) -> Result<()> {
        self.ensure_idle()?;
        let mut scratch = [0u8; 8];
        value.write_native(&mut scratch[..T::SIZE]);
        self.write_bytes(&scratch[..T::SIZE]);
        Ok(())
    }

    /// Read a scalar at the cursor in native byte order.
    pub fn get<T: Scalar>(&mut self) -> Result<T> {
        self.ensure_idle()?;
        let bytes = self.read_bytes(T::SIZE)?;
        Ok(T::read_native(bytes))
    }

    /// Append a size-typed integer: always 8 bytes, little-endian,
    /// regardless of platform width.
    pub fn add_size(&mut self, value: u64) -> Result<()> {
        self.ensure_idle()?;
        self.write_bytes(&value.to_le_bytes());
        Ok(())
    }

    /// Read a size-typed integer (8 bytes, little-endian).
    pub fn get_size(&mut self) -> Result<u64> {
        self.ensure_idle()?;
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Append raw bytes, optionally preceded by an 8-byte length prefix
    /// that [`Packet::get_str`] with `length == 0` consumes.
    pub fn add_str(&mut self, bytes: &[u8], prefix: bool) -> Result<()> {
        self.ensure_idle()?;
        if prefix {
            self.write_bytes(&(bytes.len() as u64).to_le_bytes());
        }
        self.write_bytes(bytes);
        Ok(())
    }

    /// Read string bytes.
    ///
    /// `length == 0` means "read the 8-byte length prefix first"; a nonzero
    /// `length` reads exactly that many raw bytes. With `null_terminated`
    /// the returned buffer gains a trailing NUL, for handing to C callers.
    pub fn get_str(&mut self, length: usize, null_terminated: bool) -> Result<Vec<u8>> {
        self.ensure_idle()?;
        let saved = self.cursor;
        let result = (|| {
            let len = if length == 0 {
                let bytes = self.read_bytes(8)?;
                u64::from_le_bytes(bytes.try_into().unwrap()) as usize
            } else {
                length
            };
            let mut out = self.read_bytes(len)?.to_vec();
            if null_terminated {
                out.push(0);
            }
            Ok(out)
        })();
        if result.is_err() {
            // Failed reads leave the packet unchanged, including the
            // partial prefix consumption.
            self.cursor = saved;
        }
        result
    }

    /// Read the length prefix at the cursor without advancing.
    pub fn str_size(&mut self) -> Result<u64> {
        self.ensure_idle()?;
        if self.remaining() < 8 {
            return Err(NetError::PacketUnderflow {
                requested: 8,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.cursor..self.cursor + 8];
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Remove `count` bytes starting at `start`, shifting the tail down.
    pub fn erase(&mut self, start: usize, count: usize) -> Result<()> {
        self.ensure_idle()?;
        if start + count > self.used {
            return Err(NetError::PacketUnderflow {
                requested: start + count,
                available: self.used,
            });
        }
        self.buf.copy_within(start + count..self.used, start);
        self.used -= count;
        if self.cursor > start {
            self.cursor = self.cursor.saturating_sub(count).max(start);
        }
        self.cursor = self.cursor.min(self.used);
        Ok(())
    }

    /// Open a gap of `count` zero bytes at the cursor; `used_size` grows,
    /// the cursor does not move.
    pub fn insert(&mut self, count: usize) -> Result<()> {
        self.ensure_idle()?;
        let new_used = self.used + count;
        self.grow_for(new_used);
        self.buf
            .copy_within(self.cursor..self.used, self.cursor + count);
        self.buf[self.cursor..self.cursor + count].fill(0);
        self.used = new_used;
        Ok(())
    }

    /// Append the other packet's valid bytes at the cursor.
    pub fn concat(&mut self, other: &Packet) -> Result<()> {
        self.ensure_idle()?;
        // A busy source has no observable bytes.
        if other.cipher.is_some() {
            return Err(NetError::PacketBusy);
        }
        let bytes = other.data().to_vec();
        self.write_bytes(&bytes);
        Ok(())
    }

    /// Replace the contents with `text`'s bytes (no prefix), cursor at 0.
    pub fn assign_str(&mut self, text: &str) -> Result<()> {
        self.ensure_idle()?;
        self.clear();
        self.write_bytes(text.as_bytes());
        self.cursor = 0;
        Ok(())
    }

    /// Compare the valid bytes against `text`.
    pub fn eq_str(&self, text: &str) -> bool {
        self.cipher.is_none() && self.data() == text.as_bytes()
    }

    // ---- routing tags ---------------------------------------------------

    /// Client the packet came from; `0` means the server or "not a client".
    pub fn client_from(&self) -> usize {
        self.client_from
    }

    /// Datagram operation the packet was routed under.
    pub fn operation_from(&self) -> usize {
        self.operation_from
    }

    /// Instance the packet was received on.
    pub fn instance_from(&self) -> usize {
        self.instance_from
    }

    /// Time since the transport delivered this packet, if it was received
    /// rather than locally built.
    pub fn age(&self) -> Option<Duration> {
        self.received_at.map(|at| at.elapsed())
    }

    pub(crate) fn tag_received(&mut self, client: usize, operation: usize, instance: usize) {
        self.client_from = client;
        self.operation_from = operation;
        self.instance_from = instance;
        self.received_at = Some(Instant::now());
    }

    // ---- encryption -----------------------------------------------------

    fn start_cipher(&mut self, key: &CipherKey, block: bool, op: CipherOp) -> Result<()> {
        self.ensure_idle()?;
        let mut data = std::mem::take(&mut self.buf);
        data.truncate(self.used);
        if block {
            match op {
                CipherOp::Encrypt => crypto::encrypt_in_place(key, &mut data),
                CipherOp::Decrypt => crypto::decrypt_in_place(key, &mut data),
            }
            self.finish_cipher(data);
        } else {
            // The buffer lives inside the task until completion; the
            // counters must agree with the (empty) buffer meanwhile.
            self.used = 0;
            self.cursor = 0;
            self.cipher = Some(CipherTask::spawn(key.clone(), data, op));
        }
        Ok(())
    }

    fn finish_cipher(&mut self, data: Vec<u8>) {
        self.used = data.len();
        self.buf = data;
        self.cursor = self.cursor.min(self.used);
    }

    /// Encrypt the valid bytes in place, zero-padding to the cipher block
    /// size first (`used_size` grows to the padded length).
    ///
    /// With `block = false` the work happens on a background thread and the
    /// packet is busy until [`Packet::poll_cipher`] reports [`CipherStatus::Done`].
    pub fn encrypt(&mut self, key: &CipherKey, block: bool) -> Result<()> {
        self.start_cipher(key, block, CipherOp::Encrypt)
    }

    /// Decrypt the valid bytes in place. Same padding and busy semantics as
    /// [`Packet::encrypt`].
    pub fn decrypt(&mut self, key: &CipherKey, block: bool) -> Result<()> {
        self.start_cipher(key, block, CipherOp::Decrypt)
    }

    /// Poll the outstanding cipher task, if any.
    ///
    /// Returns [`CipherStatus::Done`] both when a task just completed and
    /// when no task was outstanding.
    pub fn poll_cipher(&mut self) -> CipherStatus {
        match self.cipher.as_mut().map(CipherTask::poll) {
            None => CipherStatus::Done,
            Some(TaskPoll::Pending) => CipherStatus::Pending,
            Some(TaskPoll::Ready(data)) => {
                self.cipher = None;
                self.finish_cipher(data);
                CipherStatus::Done
            }
            Some(TaskPoll::Failed) => {
                self.cipher = None;
                CipherStatus::Failed
            }
        }
    }

    /// Block until the outstanding cipher task (if any) completes.
    pub fn wait_cipher(&mut self) -> CipherStatus {
        match self.cipher.as_mut().map(CipherTask::wait) {
            None => CipherStatus::Done,
            Some(TaskPoll::Ready(data)) => {
                self.cipher = None;
                self.finish_cipher(data);
                CipherStatus::Done
            }
            Some(TaskPoll::Pending) | Some(TaskPoll::Failed) => {
                self.cipher = None;
                CipherStatus::Failed
            }
        }
    }
}

/// Packets compare by valid bytes only; routing tags are ignored.
impl PartialEq for Packet {
    fn eq(&self, other: &Packet) -> bool {
        self.used == other.used && self.data() == other.data()
    }
}

impl Eq for Packet {}

impl Clone for Packet {
    /// Clones data and tags. An outstanding cipher task is not cloneable;
    /// the clone starts idle with whatever bytes were last observable.
    fn clone(&self) -> Packet {
        Packet {
            buf: self.buf.clone(),
            used: self.used,
            cursor: self.cursor,
            client_from: self.client_from,
            operation_from: self.operation_from,
            instance_from: self.instance_from,
            received_at: self.received_at,
            cipher: None,
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("memory_size", &self.buf.len())
            .field("used_size", &self.used)
            .field("cursor", &self.cursor)
            .field("client_from", &self.client_from)
            .field("busy", &self.cipher.is_some())
            .finish()
    }
}

impl From<&str> for Packet {
    fn from(text: &str) -> Packet {
        Packet::from_bytes(text.as_bytes())
    }
}
