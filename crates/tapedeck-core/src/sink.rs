//! Non-intrusive capture of PTY output chunks.
//!
//! A reader task owns the blocking PTY read loop and pushes raw buffers on a
//! bounded channel; the transport forwards them here. Each contiguous read
//! becomes one chunk with a monotonic delay from its predecessor (the first
//! chunk of an exchange measures from send completion). The sink does no
//! parsing and no blocking work.
//!
//! Memory is bounded: past the configured byte ceiling, the oldest chunks
//! spill into an anonymous temp file as length-prefixed frames and are read
//! back at exchange close.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::Result;

/// Bound for the PTY reader channel, in chunks.
pub const READER_CHANNEL_DEPTH: usize = 256;

/// Read size for the PTY loop; the PTY's natural chunking usually stays well
/// under this.
const READ_BUF_SIZE: usize = 8192;

/// Event pushed by the PTY reader task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// One contiguous read's worth of output.
    Output(Vec<u8>),
    /// The PTY closed (child exited or the master was dropped).
    Eof,
}

/// A captured chunk before it becomes a tape [`crate::tape::Chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkChunk {
    pub delay_ms: u64,
    pub data: Vec<u8>,
    pub is_utf8: bool,
}

/// Per-exchange chunk buffer with a byte ceiling.
pub struct ChunkSink {
    ceiling: usize,
    last: Instant,
    chunks: VecDeque<SinkChunk>,
    buffered: usize,
    spill: Option<SpillFile>,
    total_bytes: u64,
}

impl ChunkSink {
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            last: Instant::now(),
            chunks: VecDeque::new(),
            buffered: 0,
            spill: None,
            total_bytes: 0,
        }
    }

    /// Start a new exchange; the first chunk's delay is measured from `sent`.
    pub fn begin_exchange(&mut self, sent: Instant) {
        self.last = sent;
        self.chunks.clear();
        self.buffered = 0;
        self.spill = None;
        self.total_bytes = 0;
    }

    /// Append one contiguous read.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let delay_ms = now.duration_since(self.last).as_millis() as u64;
        self.last = now;

        self.total_bytes += data.len() as u64;
        self.buffered += data.len();
        self.chunks.push_back(SinkChunk {
            delay_ms,
            data: data.to_vec(),
            is_utf8: std::str::from_utf8(data).is_ok(),
        });

        while self.buffered > self.ceiling && self.chunks.len() > 1 {
            let oldest = self.chunks.pop_front().expect("non-empty");
            self.buffered -= oldest.data.len();
            self.spill.get_or_insert_with(SpillFile::default).append(&oldest)?;
        }
        Ok(())
    }

    /// Total bytes captured in the current exchange.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Freeze the exchange: spilled chunks first, then the in-memory tail,
    /// in capture order. Leaves the sink empty.
    pub fn take(&mut self) -> Result<Vec<SinkChunk>> {
        let mut out = match self.spill.take() {
            Some(spill) => spill.read_back()?,
            None => Vec::new(),
        };
        out.extend(self.chunks.drain(..));
        self.buffered = 0;
        Ok(out)
    }
}

impl std::fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSink")
            .field("chunks", &self.chunks.len())
            .field("buffered", &self.buffered)
            .field("spilled", &self.spill.is_some())
            .finish()
    }
}

/// Overflow chunks as length-prefixed frames in an anonymous temp file:
/// `delay_ms: u64 le | len: u32 le | is_utf8: u8 | bytes`.
#[derive(Default)]
struct SpillFile {
    file: Option<File>,
    frames: usize,
}

impl SpillFile {
    fn append(&mut self, chunk: &SinkChunk) -> Result<()> {
        if self.file.is_none() {
            self.file = Some(tempfile::tempfile()?);
            tracing::debug!("exchange output exceeded ceiling; spilling to temp file");
        }
        let file = self.file.as_mut().expect("just created");
        file.write_all(&chunk.delay_ms.to_le_bytes())?;
        file.write_all(&(chunk.data.len() as u32).to_le_bytes())?;
        file.write_all(&[u8::from(chunk.is_utf8)])?;
        file.write_all(&chunk.data)?;
        self.frames += 1;
        Ok(())
    }

    fn read_back(mut self) -> Result<Vec<SinkChunk>> {
        let Some(mut file) = self.file.take() else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(self.frames);
        for _ in 0..self.frames {
            let mut header = [0u8; 13];
            file.read_exact(&mut header)?;
            let delay_ms = u64::from_le_bytes(header[0..8].try_into().expect("8 bytes"));
            let len = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes")) as usize;
            let is_utf8 = header[12] != 0;
            let mut data = vec![0u8; len];
            file.read_exact(&mut data)?;
            out.push(SinkChunk {
                delay_ms,
                data,
                is_utf8,
            });
        }
        Ok(out)
    }
}

/// Spawn the blocking PTY read loop on its own thread. The loop ends when
/// the PTY reports EOF/error or the receiver side is dropped; cancellation
/// is channel close.
pub fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<SinkEvent>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(SinkEvent::Eof);
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(SinkEvent::Output(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // A PTY master read commonly fails with EIO once the
                    // child exits; treat any error as end of stream.
                    tracing::debug!(error = %e, "pty read loop ended");
                    let _ = tx.blocking_send(SinkEvent::Eof);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn captures_chunks_in_order() {
        let mut sink = ChunkSink::new(1024);
        sink.begin_exchange(Instant::now());
        sink.push(b"first").unwrap();
        sink.push(b"second").unwrap();
        let chunks = sink.take().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, b"first");
        assert_eq!(chunks[1].data, b"second");
        assert!(chunks[0].is_utf8);
    }

    #[test]
    fn first_chunk_delay_measured_from_send() {
        let mut sink = ChunkSink::new(1024);
        let sent = Instant::now() - Duration::from_millis(50);
        sink.begin_exchange(sent);
        sink.push(b"x").unwrap();
        let chunks = sink.take().unwrap();
        assert!(chunks[0].delay_ms >= 50, "delay {}", chunks[0].delay_ms);
    }

    #[test]
    fn empty_reads_are_ignored() {
        let mut sink = ChunkSink::new(1024);
        sink.begin_exchange(Instant::now());
        sink.push(b"").unwrap();
        assert!(sink.take().unwrap().is_empty());
    }

    #[test]
    fn utf8_flag_tracks_payload() {
        let mut sink = ChunkSink::new(1024);
        sink.begin_exchange(Instant::now());
        sink.push(&[0xff, 0xfe]).unwrap();
        let chunks = sink.take().unwrap();
        assert!(!chunks[0].is_utf8);
    }

    #[test]
    fn spills_beyond_ceiling_and_reads_back_in_order() {
        let mut sink = ChunkSink::new(64);
        sink.begin_exchange(Instant::now());
        for i in 0..10u8 {
            sink.push(&[b'a' + i; 32]).unwrap();
        }
        assert_eq!(sink.total_bytes(), 320);
        let chunks = sink.take().unwrap();
        assert_eq!(chunks.len(), 10);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.data, vec![b'a' + i as u8; 32], "chunk {i}");
        }
    }

    #[test]
    fn begin_exchange_resets_state() {
        let mut sink = ChunkSink::new(64);
        sink.begin_exchange(Instant::now());
        for _ in 0..10 {
            sink.push(&[0u8; 32]).unwrap();
        }
        sink.begin_exchange(Instant::now());
        assert_eq!(sink.total_bytes(), 0);
        sink.push(b"fresh").unwrap();
        let chunks = sink.take().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, b"fresh");
    }

    #[tokio::test]
    async fn reader_forwards_output_then_eof() {
        let (tx, mut rx) = mpsc::channel(READER_CHANNEL_DEPTH);
        let data: &[u8] = b"hello from pty";
        let handle = spawn_reader(Box::new(std::io::Cursor::new(data.to_vec())), tx);

        let mut collected = Vec::new();
        loop {
            match rx.recv().await {
                Some(SinkEvent::Output(bytes)) => collected.extend(bytes),
                Some(SinkEvent::Eof) => break,
                None => panic!("channel closed before EOF"),
            }
        }
        assert_eq!(collected, data);
        handle.join().unwrap();
    }
}
