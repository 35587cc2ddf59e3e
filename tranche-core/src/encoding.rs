//! Encoding stream chain: source bytes -> [encryption] -> [compression] -> chunk sink.
//!
//! Every stage is a `Write` that forwards to the next one. Hash taps sit after
//! the source and after each transform, so each applied encoding reports the
//! hash and size of its own output. The `None` tap's hash is the file's
//! canonical content hash.

use crate::hash::ContentHash;
use crate::model::{Encoding, EncodingKind};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::io::{self, Write};
use thiserror::Error;

/// Plaintext bytes sealed per AEAD segment.
pub const SEGMENT_SIZE: usize = 64 * 1024;
pub const TAG_SIZE: usize = 16;
pub const ZSTD_LEVEL: i32 = 3;

const KEY_CONTEXT: &str = "tranche-core 2024 file encryption key";

/// Deterministic suffix appended after a file's bytes: BLAKE3 of the
/// passphrase, or nothing when the upload is not encrypted.
pub fn padding_for(passphrase: Option<&str>) -> Vec<u8> {
    match passphrase {
        Some(p) if !p.is_empty() => blake3::hash(p.as_bytes()).as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EncodingOptions<'a> {
    pub passphrase: Option<&'a str>,
    pub compress: bool,
    /// Binds the encryption key to the file's place in the data set.
    pub dataset_path: &'a str,
}

impl EncodingOptions<'_> {
    fn encrypts(&self) -> bool {
        matches!(self.passphrase, Some(p) if !p.is_empty())
    }
}

fn file_cipher(passphrase: &str, dataset_path: &str) -> ChaCha20Poly1305 {
    let mut material = Vec::with_capacity(passphrase.len() + 1 + dataset_path.len());
    material.extend_from_slice(passphrase.as_bytes());
    material.push(0);
    material.extend_from_slice(dataset_path.as_bytes());
    let key = blake3::derive_key(KEY_CONTEXT, &material);
    ChaCha20Poly1305::new(Key::from_slice(&key))
}

fn segment_nonce(counter: u64, last: bool) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[..8].copy_from_slice(&counter.to_le_bytes());
    n[8] = last as u8;
    n
}

trait Stage: Write {
    /// Flush buffered output downstream, finish the rest of the chain, and
    /// report the encodings recorded along the way.
    fn finish(self: Box<Self>) -> io::Result<Vec<Encoding>>;
}

struct HashTap {
    kind: EncodingKind,
    hasher: blake3::Hasher,
    size: u64,
    next: Box<dyn Stage>,
}

impl Write for HashTap {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        self.next.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stage for HashTap {
    fn finish(self: Box<Self>) -> io::Result<Vec<Encoding>> {
        let mut out = self.next.finish()?;
        out.push(Encoding {
            kind: self.kind,
            hash: ContentHash::from(self.hasher.finalize()),
            size: self.size,
        });
        Ok(out)
    }
}

struct EncryptStage {
    cipher: ChaCha20Poly1305,
    pending: Vec<u8>,
    counter: u64,
    next: Box<dyn Stage>,
}

impl EncryptStage {
    fn seal(&mut self, len: usize, last: bool) -> io::Result<()> {
        let nonce = segment_nonce(self.counter, last);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), &self.pending[..len])
            .map_err(|_| io::Error::other("segment encryption failed"))?;
        self.pending.drain(..len);
        self.counter += 1;
        self.next.write_all(&sealed)
    }
}

impl Write for EncryptStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        // hold back one full segment: only `finish` knows which segment is last
        while self.pending.len() > SEGMENT_SIZE {
            self.seal(SEGMENT_SIZE, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stage for EncryptStage {
    fn finish(mut self: Box<Self>) -> io::Result<Vec<Encoding>> {
        let len = self.pending.len();
        self.seal(len, true)?;
        self.next.finish()
    }
}

struct CompressStage {
    encoder: zstd::stream::write::Encoder<'static, Box<dyn Stage>>,
}

impl Write for CompressStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl Stage for CompressStage {
    fn finish(self: Box<Self>) -> io::Result<Vec<Encoding>> {
        let next = self.encoder.finish()?;
        next.finish()
    }
}

/// Terminal stage: slices the final stream into fixed-size chunks.
struct ChunkSink<F> {
    chunk_size: usize,
    buf: Vec<u8>,
    emit: F,
}

impl<F: FnMut(Vec<u8>) -> io::Result<()>> Write for ChunkSink<F> {
    fn write(&mut self, mut data: &[u8]) -> io::Result<usize> {
        let total = data.len();
        while !data.is_empty() {
            let take = (self.chunk_size - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.chunk_size {
                let full = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
                (self.emit)(full)?;
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F: FnMut(Vec<u8>) -> io::Result<()>> Stage for ChunkSink<F> {
    fn finish(mut self: Box<Self>) -> io::Result<Vec<Encoding>> {
        if !self.buf.is_empty() {
            let last = std::mem::take(&mut self.buf);
            (self.emit)(last)?;
        }
        Ok(Vec::new())
    }
}

/// A ready-to-write encoding chain for one file.
pub struct EncodingChain {
    head: Box<dyn Stage>,
}

impl EncodingChain {
    /// `emit` receives each finished chunk in stream order; an error from it aborts the file.
    pub fn new<F>(opts: &EncodingOptions<'_>, chunk_size: usize, emit: F) -> io::Result<Self>
    where
        F: FnMut(Vec<u8>) -> io::Result<()> + 'static,
    {
        let chunk_size = chunk_size.max(1);
        let mut head: Box<dyn Stage> =
            Box::new(ChunkSink { chunk_size, buf: Vec::with_capacity(chunk_size), emit });
        if opts.compress {
            head = tap(EncodingKind::Compression, head);
            let encoder = zstd::stream::write::Encoder::new(head, ZSTD_LEVEL)?;
            head = Box::new(CompressStage { encoder });
        }
        if let (true, Some(pass)) = (opts.encrypts(), opts.passphrase) {
            head = tap(EncodingKind::Encryption, head);
            head = Box::new(EncryptStage {
                cipher: file_cipher(pass, opts.dataset_path),
                pending: Vec::with_capacity(SEGMENT_SIZE + 1),
                counter: 0,
                next: head,
            });
        }
        head = tap(EncodingKind::None, head);
        Ok(Self { head })
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.head.write_all(bytes)
    }

    /// Flush every stage and return the applied encodings: `None`, then
    /// `Compression` and `Encryption` if used.
    pub fn finish(self) -> io::Result<Vec<Encoding>> {
        let mut encodings = self.head.finish()?;
        encodings.sort_by_key(|e| e.kind);
        Ok(encodings)
    }
}

fn tap(kind: EncodingKind, next: Box<dyn Stage>) -> Box<dyn Stage> {
    Box::new(HashTap { kind, hasher: blake3::Hasher::new(), size: 0, next })
}

/// Canonical content hash: the `None` encoding's hash.
pub fn content_hash(encodings: &[Encoding]) -> Option<ContentHash> {
    encodings.iter().find(|e| e.kind == EncodingKind::None).map(|e| e.hash)
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream is encrypted but no passphrase was given")]
    MissingPassphrase,
    #[error("segment {0} failed authentication")]
    Authentication(u64),
    #[error("encrypted stream is truncated")]
    Truncated,
    #[error("decoded bytes do not match the recorded content hash")]
    HashMismatch,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Invert a recorded encoding list. Returns the pre-transform stream
/// (file bytes followed by padding), checked against the `None` hash.
pub fn decode(
    encodings: &[Encoding],
    opts: &EncodingOptions<'_>,
    bytes: &[u8],
) -> Result<Vec<u8>, DecodeError> {
    let has = |k: EncodingKind| encodings.iter().any(|e| e.kind == k);
    let mut cur = bytes.to_vec();
    if has(EncodingKind::Compression) {
        cur = zstd::stream::decode_all(&cur[..])?;
    }
    if has(EncodingKind::Encryption) {
        let pass = opts.passphrase.filter(|p| !p.is_empty()).ok_or(DecodeError::MissingPassphrase)?;
        cur = decrypt(&file_cipher(pass, opts.dataset_path), &cur)?;
    }
    match content_hash(encodings) {
        Some(h) if h != ContentHash::of(&cur) => Err(DecodeError::HashMismatch),
        _ => Ok(cur),
    }
}

fn decrypt(cipher: &ChaCha20Poly1305, sealed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if sealed.len() < TAG_SIZE {
        return Err(DecodeError::Truncated);
    }
    let seg = SEGMENT_SIZE + TAG_SIZE;
    let count = sealed.len().div_ceil(seg);
    let mut out = Vec::with_capacity(sealed.len());
    for (i, piece) in sealed.chunks(seg).enumerate() {
        let last = i + 1 == count;
        let nonce = segment_nonce(i as u64, last);
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), piece)
            .map_err(|_| DecodeError::Authentication(i as u64))?;
        out.extend_from_slice(&plain);
    }
    Ok(out)
}
