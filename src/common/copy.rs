//! Bidirectional copy engine
//!
//! Streams bytes between two endpoints in both directions at once. Each
//! direction leases one buffer from a size-tiered pool and returns it
//! when the copy ends, so steady-state relaying allocates nothing.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffer tiers, smallest to largest.
const TIER_SIZES: [usize; 4] = [4 * 1024, 8 * 1024, 16 * 1024, 32 * 1024];

/// Default buffer size for relay operations (32KB)
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

static POOLS: OnceLock<[BufferPool; 4]> = OnceLock::new();

fn pools() -> &'static [BufferPool; 4] {
    POOLS.get_or_init(|| TIER_SIZES.map(BufferPool::new))
}

/// Lease a buffer of at least `size` bytes from the smallest fitting
/// tier. Sizes above the largest tier fall back to it.
pub fn lease(size: usize) -> PooledBuf {
    let pools = pools();
    let pool = pools
        .iter()
        .find(|p| p.size >= size)
        .unwrap_or(&pools[TIER_SIZES.len() - 1]);
    pool.acquire()
}

/// One tier of reusable byte buffers.
struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&'static self) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuf { buf, pool: self }
    }

    fn release(&self, buf: Vec<u8>) {
        debug_assert_eq!(buf.len(), self.size);
        self.free.lock().push(buf);
    }
}

/// A leased buffer. Returns itself to its pool on drop, exactly once,
/// including when the owning copy future is cancelled.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: &'static BufferPool,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

/// Relay bytes between `a` and `b` until either direction ends.
///
/// Returns the outcome of the first direction to finish, with clean
/// end-of-stream folded to success. The other direction is simply
/// dropped; the caller closing both endpoints is what tears it down,
/// so only one error is ever observed.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        r = copy_one_way(&mut a_read, &mut b_write) => r,
        r = copy_one_way(&mut b_read, &mut a_write) => r,
    }
}

async fn copy_one_way<R, W>(src: &mut R, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = lease(RELAY_BUFFER_SIZE);
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
    }
}
