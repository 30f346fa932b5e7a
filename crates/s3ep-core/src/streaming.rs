//! Streaming Engine: memory-bounded encrypt/decrypt reader adapters
//! backed by a reusable, zero-on-release buffer pool.
//!
//! The sequential-segment discipline and zeroize-after-use pattern are
//! grounded on `quantum-shield/src/streaming.rs`'s `encrypt_stream`/
//! `decrypt_stream`, which frame and verify per chunk; here the framing is
//! implicit (one contiguous CTR keystream, one HMAC tag for the whole
//! object) since the wire format has no per-segment headers. Segmentation
//! is purely an in-process memory bound, not part of the ciphertext layout.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crossbeam_queue::ArrayQueue;
use tokio::io::{AsyncRead, ReadBuf};
use zeroize::Zeroize;

use crate::crypto::CtrCipher;
use crate::hmac_policy::HmacAccumulator;

const POOL_CAPACITY: usize = 8;

/// Fixed-size pool of segment-sized buffers, always zeroed on release.
/// Acquire/release never blocks: the queue is bounded and lock-free, and a
/// pool miss simply allocates a fresh buffer instead of waiting.
pub struct BufferPool {
    segment_size: usize,
    free: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    pub fn new(segment_size: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            segment_size,
            free: ArrayQueue::new(POOL_CAPACITY),
        })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn acquire(&self) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.segment_size, 0);
                buf
            }
            None => vec![0u8; self.segment_size],
        }
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.zeroize();
        let _ = self.free.push(buf);
    }
}

/// Cooperative cancellation signal. Cloning shares the same underlying flag;
/// `cancel()` is idempotent and visible to every reader built from the same
/// token.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn cancelled_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "operation cancelled")
}

fn integrity_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "hmac verification failed")
}

/// Metadata resolved once an [`EncryptingReader`] reaches EOF: the final
/// HMAC tag (if the policy attached one) and the total plaintext length.
#[derive(Debug, Clone, Default)]
pub struct FinalStreamMeta {
    pub hmac: Option<[u8; 32]>,
    pub total_len: u64,
}

/// Handle returned alongside an [`EncryptingReader`]; resolves to the
/// final metadata once the reader has been fully drained by its consumer.
#[derive(Clone)]
pub struct MetadataHandle(Arc<std::sync::Mutex<Option<FinalStreamMeta>>>);

impl MetadataHandle {
    fn new() -> (Self, Arc<std::sync::Mutex<Option<FinalStreamMeta>>>) {
        let inner = Arc::new(std::sync::Mutex::new(None));
        (MetadataHandle(inner.clone()), inner)
    }

    /// `None` until the reader has reached EOF.
    pub fn try_get(&self) -> Option<FinalStreamMeta> {
        self.0.lock().expect("metadata handle mutex poisoned").clone()
    }
}

enum FillOutcome {
    Full,
    PartialEof(usize),
}

/// Drives repeated `poll_read` calls into `buf[filled..]` until `buf` is
/// full or the source signals EOF (a zero-length read). Returns `Pending`
/// exactly when the underlying reader does; `filled` carries fill progress
/// across `Pending` returns.
fn poll_fill<R: AsyncRead + Unpin>(
    inner: &mut R,
    cx: &mut Context<'_>,
    buf: &mut [u8],
    filled: &mut usize,
) -> Poll<std::io::Result<FillOutcome>> {
    loop {
        if *filled == buf.len() {
            return Poll::Ready(Ok(FillOutcome::Full));
        }
        let mut read_buf = ReadBuf::new(&mut buf[*filled..]);
        match Pin::new(&mut *inner).poll_read(cx, &mut read_buf) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    return Poll::Ready(Ok(FillOutcome::PartialEof(*filled)));
                }
                *filled += n;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum EncPhase {
    Filling { filled: usize },
    Draining { len: usize, pos: usize },
    Done,
}

/// Wraps a plaintext source reader and yields ciphertext, transforming with
/// AES-256-CTR (keeping counter state across calls) and updating HMAC
/// across segment boundaries.
pub struct EncryptingReader<R> {
    inner: R,
    cipher: CtrCipher,
    hmac: Option<HmacAccumulator>,
    pool: Arc<BufferPool>,
    segment: Vec<u8>,
    phase: EncPhase,
    total_len: u64,
    cancel: CancellationToken,
    result: Arc<std::sync::Mutex<Option<FinalStreamMeta>>>,
}

impl<R: AsyncRead + Unpin> EncryptingReader<R> {
    pub fn new(
        inner: R,
        dek: &[u8; 32],
        iv: &[u8; 16],
        pool: Arc<BufferPool>,
        with_hmac: bool,
        cancel: CancellationToken,
    ) -> Result<(Self, MetadataHandle), crate::error::CoreError> {
        let cipher = CtrCipher::new(dek, iv)?;
        let hmac = with_hmac.then(|| HmacAccumulator::new(dek));
        let segment = pool.acquire();
        let (handle, result) = MetadataHandle::new();
        Ok((
            EncryptingReader {
                inner,
                cipher,
                hmac,
                pool,
                segment,
                phase: EncPhase::Filling { filled: 0 },
                total_len: 0,
                cancel,
                result,
            },
            handle,
        ))
    }

    fn finish(&mut self) {
        let hmac = self.hmac.as_mut().map(|h| h.finalize());
        let mut guard = self.result.lock().expect("metadata handle mutex poisoned");
        *guard = Some(FinalStreamMeta {
            hmac,
            total_len: self.total_len,
        });
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptingReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, dst: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.cancel.is_cancelled() {
                return Poll::Ready(Err(cancelled_error()));
            }
            match this.phase {
                EncPhase::Filling { mut filled } => match poll_fill(&mut this.inner, cx, &mut this.segment, &mut filled) {
                    Poll::Pending => {
                        this.phase = EncPhase::Filling { filled };
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(FillOutcome::Full)) => {
                        let len = this.segment.len();
                        if let Some(h) = this.hmac.as_mut() {
                            h.update(&this.segment[..len]);
                        }
                        this.cipher.apply(&mut this.segment[..len]);
                        this.total_len += len as u64;
                        this.phase = EncPhase::Draining { len, pos: 0 };
                    }
                    Poll::Ready(Ok(FillOutcome::PartialEof(len))) => {
                        if len > 0 {
                            if let Some(h) = this.hmac.as_mut() {
                                h.update(&this.segment[..len]);
                            }
                            this.cipher.apply(&mut this.segment[..len]);
                            this.total_len += len as u64;
                        }
                        this.finish();
                        this.phase = if len > 0 {
                            EncPhase::Draining { len, pos: 0 }
                        } else {
                            EncPhase::Done
                        };
                    }
                },
                EncPhase::Draining { len, mut pos } => {
                    let remaining = len - pos;
                    if remaining == 0 {
                        this.phase = EncPhase::Filling { filled: 0 };
                        continue;
                    }
                    let take = remaining.min(dst.remaining());
                    if take == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    dst.put_slice(&this.segment[pos..pos + take]);
                    pos += take;
                    this.phase = EncPhase::Draining { len, pos };
                    return Poll::Ready(Ok(()));
                }
                EncPhase::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<R> Drop for EncryptingReader<R> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.segment);
        self.pool.release(buf);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DecState {
    Active,
    Done,
    Failed,
}

/// Symmetric counterpart of [`EncryptingReader`]. When `expected_hmac` is
/// `Some`, decrypted segments are held in `held` (the most recent segment
/// not yet confirmed non-final) until either another segment is
/// successfully read after it (confirming it's not last, so it moves to
/// `ready` for release) or EOF is reached, at which point the full tail is
/// verified against the tag before anything in it is released.
pub struct DecryptingReader<R> {
    inner: R,
    cipher: CtrCipher,
    hmac: Option<HmacAccumulator>,
    expected_hmac: Option<[u8; 32]>,
    pool: Arc<BufferPool>,
    raw: Vec<u8>,
    fill_progress: usize,
    held: Option<(Vec<u8>, usize)>,
    ready: VecDeque<(Vec<u8>, usize)>,
    drain_pos: usize,
    eof_reached: bool,
    state: DecState,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin> DecryptingReader<R> {
    pub fn new(
        inner: R,
        dek: &[u8; 32],
        iv: &[u8; 16],
        pool: Arc<BufferPool>,
        expected_hmac: Option<[u8; 32]>,
        cancel: CancellationToken,
    ) -> Result<Self, crate::error::CoreError> {
        let cipher = CtrCipher::new(dek, iv)?;
        let hmac = expected_hmac.map(|_| HmacAccumulator::new(dek));
        let raw = pool.acquire();
        Ok(DecryptingReader {
            inner,
            cipher,
            hmac,
            expected_hmac,
            pool,
            raw,
            fill_progress: 0,
            held: None,
            ready: VecDeque::new(),
            drain_pos: 0,
            eof_reached: false,
            state: DecState::Active,
            cancel,
        })
    }

    fn decrypt_segment(&mut self, len: usize) -> Vec<u8> {
        let mut plain = self.raw[..len].to_vec();
        self.cipher.apply(&mut plain);
        if let Some(h) = self.hmac.as_mut() {
            h.update(&plain);
        }
        plain
    }

    /// Reached EOF: `last` is the final plaintext segment read (possibly
    /// empty for a zero-length tail), `held` (if any) is the segment read
    /// immediately before it. Verifies the accumulated tag (if one is
    /// expected) before queuing either for release.
    fn finalize_tail(&mut self, held: Option<(Vec<u8>, usize)>, last: Option<(Vec<u8>, usize)>) -> Poll<std::io::Result<()>> {
        if let Some(expected) = self.expected_hmac {
            let actual = self
                .hmac
                .as_mut()
                .expect("hmac accumulator present when expected_hmac is Some")
                .finalize();
            if !HmacAccumulator::verify(&expected, &actual) {
                self.state = DecState::Failed;
                return Poll::Ready(Err(integrity_error()));
            }
        }
        if let Some(h) = held {
            self.ready.push_back(h);
        }
        if let Some(l) = last {
            self.ready.push_back(l);
        }
        self.eof_reached = true;
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, dst: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.cancel.is_cancelled() {
                return Poll::Ready(Err(cancelled_error()));
            }
            match this.state {
                DecState::Failed => return Poll::Ready(Err(integrity_error())),
                DecState::Done => return Poll::Ready(Ok(())),
                DecState::Active => {}
            }

            if let Some((buf, len)) = this.ready.front() {
                if this.drain_pos < *len {
                    let take = (*len - this.drain_pos).min(dst.remaining());
                    if take == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    dst.put_slice(&buf[this.drain_pos..this.drain_pos + take]);
                    this.drain_pos += take;
                    return Poll::Ready(Ok(()));
                } else {
                    this.ready.pop_front();
                    this.drain_pos = 0;
                    continue;
                }
            }

            if this.eof_reached && this.held.is_none() {
                this.state = DecState::Done;
                continue;
            }

            match poll_fill(&mut this.inner, cx, &mut this.raw, &mut this.fill_progress) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(FillOutcome::Full)) => {
                    let len = this.raw.len();
                    let plain = this.decrypt_segment(len);
                    this.fill_progress = 0;
                    match this.held.take() {
                        Some(prev) => {
                            this.ready.push_back(prev);
                            this.held = Some((plain, len));
                        }
                        None => this.held = Some((plain, len)),
                    }
                }
                Poll::Ready(Ok(FillOutcome::PartialEof(len))) => {
                    this.fill_progress = 0;
                    let last = if len > 0 { Some((this.decrypt_segment(len), len)) } else { None };
                    let held = this.held.take();
                    match this.finalize_tail(held, last) {
                        Poll::Ready(Ok(())) => {}
                        other => return other,
                    }
                }
            }
        }
    }
}

impl<R> Drop for DecryptingReader<R> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.raw);
        self.pool.release(buf);
    }
}
