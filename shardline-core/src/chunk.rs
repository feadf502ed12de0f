//! Block chunking
//!
//! Blocks are the unit of deduplication and redundancy coding. A
//! [`BlockChunker`] lazily splits a byte stream into bounded-size
//! [`PlainBlock`]s; each block carries its content hash (`VHP`) and its
//! convergent content key (`KD`), both pure functions of the bytes.

use crate::crypto::{content_key, BlockKey, ContentHash};
use crate::error::{Result, ShardlineError};
use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use bytes::Bytes;
use std::fmt;
use std::io::{ErrorKind, Read};

/// A bounded-size plaintext block
#[derive(Clone)]
pub struct PlainBlock {
    /// Position of the block within its object (0-based)
    pub ordinal: u32,
    /// Raw plaintext
    pub data: Bytes,
    /// Content hash of the plaintext (`VHP`)
    pub vhp: ContentHash,
    /// Content-derived key (`KD`)
    pub kd: BlockKey,
}

impl PlainBlock {
    /// Create a block from data, computing its hash and content key
    pub fn new(ordinal: u32, data: impl Into<Bytes>) -> Result<Self> {
        let data: Bytes = data.into();

        if data.len() > MAX_BLOCK_SIZE {
            return Err(ShardlineError::Argument(format!(
                "block too large: {} bytes (max: {})",
                data.len(),
                MAX_BLOCK_SIZE
            )));
        }

        let vhp = if data.len() > 1024 * 1024 {
            ContentHash::compute_parallel(&data)
        } else {
            ContentHash::compute(&data)
        };
        let kd = content_key(&data);

        Ok(Self {
            ordinal,
            data,
            vhp,
            kd,
        })
    }

    /// Original (plaintext) length in bytes
    pub fn original_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Verify the block's integrity by recomputing its hash
    pub fn verify(&self) -> bool {
        self.vhp.verify(&self.data)
    }
}

impl fmt::Debug for PlainBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainBlock")
            .field("ordinal", &self.ordinal)
            .field("size", &self.data.len())
            .field("vhp", &self.vhp)
            .finish()
    }
}

/// Lazy, finite, non-restartable splitter over a byte stream.
///
/// Every block except the last is exactly `block_size` bytes; an empty
/// stream yields no blocks. After the first error the chunker is fused.
pub struct BlockChunker<R> {
    reader: R,
    block_size: usize,
    next_ordinal: u32,
    finished: bool,
}

impl<R: Read> BlockChunker<R> {
    /// Create a chunker; `block_size` is clamped to the supported range
    pub fn new(reader: R, block_size: usize) -> Self {
        Self {
            reader,
            block_size: block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE),
            next_ordinal: 0,
            finished: false,
        }
    }

    /// Effective block size after clamping
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Fill a buffer up to `block_size`, tolerating short reads
    fn read_block(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for BlockChunker<R> {
    type Item = Result<PlainBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let data = match self.read_block() {
            Ok(data) => data,
            Err(e) => {
                self.finished = true;
                return Some(Err(ShardlineError::Codec(format!(
                    "stream read failed at block {}: {}",
                    self.next_ordinal, e
                ))));
            }
        };

        if data.len() < self.block_size {
            self.finished = true;
        }
        if data.is_empty() {
            return None;
        }

        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        Some(PlainBlock::new(ordinal, data))
    }
}

/// Number of blocks a stream of `length` bytes splits into
pub fn block_count(length: u64, block_size: usize) -> u64 {
    let block_size = block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE) as u64;
    length.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    /// Reader that returns at most `step` bytes per call
    struct TrickleReader {
        inner: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for TrickleReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.step);
            self.inner.read(&mut buf[..n])
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn test_split_exact_multiple() {
        let data = vec![1u8; 4096];
        let blocks: Vec<_> = BlockChunker::new(Cursor::new(data), 1024)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 4);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.ordinal, i as u32);
            assert_eq!(block.data.len(), 1024);
            assert!(block.verify());
        }
    }

    #[test]
    fn test_split_with_remainder() {
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let blocks: Vec<_> = BlockChunker::new(Cursor::new(data.clone()), 1024)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].data.len(), 452);

        let joined: Vec<u8> = blocks.iter().flat_map(|b| b.data.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_empty_stream_yields_nothing() {
        let mut chunker = BlockChunker::new(Cursor::new(Vec::new()), 1024);
        assert!(chunker.next().is_none());
        assert!(chunker.next().is_none());
    }

    #[test]
    fn test_short_reads_are_coalesced() {
        let data = vec![3u8; 3000];
        let reader = TrickleReader {
            inner: Cursor::new(data),
            step: 7,
        };
        let sizes: Vec<usize> = BlockChunker::new(reader, 1024)
            .map(|b| b.unwrap().data.len())
            .collect();
        assert_eq!(sizes, vec![1024, 1024, 952]);
    }

    #[test]
    fn test_read_failure_is_codec_error() {
        let mut chunker = BlockChunker::new(FailingReader, 1024);
        assert!(matches!(
            chunker.next(),
            Some(Err(ShardlineError::Codec(_)))
        ));
        assert!(chunker.next().is_none());
    }

    #[test]
    fn test_identical_content_identical_keys() {
        let a = PlainBlock::new(0, b"same".to_vec()).unwrap();
        let b = PlainBlock::new(7, b"same".to_vec()).unwrap();
        assert_eq!(a.vhp, b.vhp);
        assert_eq!(a.kd, b.kd);
    }

    #[test]
    fn test_block_too_large() {
        let data = vec![0u8; MAX_BLOCK_SIZE + 1];
        assert!(matches!(
            PlainBlock::new(0, data),
            Err(ShardlineError::Argument(_))
        ));
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(0, 1024), 0);
        assert_eq!(block_count(1024, 1024), 1);
        assert_eq!(block_count(1025, 1024), 2);
    }

    proptest! {
        #[test]
        fn prop_blocks_cover_stream_in_order(
            data in proptest::collection::vec(any::<u8>(), 0..6000),
            block_size in 1024usize..2048,
        ) {
            let blocks: Vec<_> = BlockChunker::new(Cursor::new(data.clone()), block_size)
                .collect::<Result<_>>()
                .unwrap();

            prop_assert_eq!(blocks.len() as u64, block_count(data.len() as u64, block_size));
            let total: usize = blocks.iter().map(|b| b.data.len()).sum();
            prop_assert_eq!(total, data.len());

            let mut offset = 0;
            for (i, block) in blocks.iter().enumerate() {
                prop_assert_eq!(block.ordinal as usize, i);
                prop_assert_eq!(&block.data[..], &data[offset..offset + block.data.len()]);
                offset += block.data.len();
            }
        }
    }
}
