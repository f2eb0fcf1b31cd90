//! Block-wise transfers (RFC 7959). Oversized payloads are fragmented into
//! sequentially numbered blocks with an explicit more-data flag, and
//! reassembled by the receiver. Reassembly tolerates out-of-order and
//! duplicate delivery, bounds its memory use, and expires incomplete
//! transfers.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;

use crate::errdata;
use crate::error::{Error, Result};

/// The minimum block size (SZX 0).
pub const MIN_BLOCK_SIZE: usize = 16;

/// The maximum block size (SZX 6).
pub const MAX_BLOCK_SIZE: usize = 1024;

/// A Block1/Block2 option value (RFC 7959 §2.2):
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     NUM       |M|    SZX      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// NUM is the block number, M the more-data flag, and SZX the size exponent
/// with block size 2^(SZX+4), i.e. 16 through 1024 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockOption {
    /// The zero-based block number.
    pub number: u32,
    /// Whether more blocks follow.
    pub more: bool,
    /// The block size in bytes. A power of two in 16..=1024.
    pub size: usize,
}

impl BlockOption {
    /// Encodes the option value as a minimal-length big-endian uint.
    pub fn encode(&self) -> Vec<u8> {
        assert!(self.size.is_power_of_two(), "block size must be a power of two");
        assert!((MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.size), "invalid block size");
        assert!(self.number < 1 << 20, "block number exceeds 20 bits");
        let szx = self.size.trailing_zeros() - 4;
        let value = (self.number << 4) | (u32::from(self.more) << 3) | szx;
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
        bytes[skip..].to_vec()
    }

    /// Decodes an option value. SZX 7 is reserved and rejected as malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > 3 {
            return errdata!("block option longer than 3 bytes");
        }
        let mut value = 0u32;
        for b in bytes {
            value = (value << 8) | *b as u32;
        }
        let szx = value & 0x7;
        if szx == 7 {
            return errdata!("reserved block size exponent 7");
        }
        Ok(Self {
            number: value >> 4,
            more: (value >> 3) & 0x1 != 0,
            size: MIN_BLOCK_SIZE << szx,
        })
    }
}

/// Returns whether a payload must be sent block-wise at the given block
/// size.
pub fn should_use_block_transfer(payload: &[u8], block_size: usize) -> bool {
    payload.len() > block_size
}

/// Splits a payload into ordered blocks of the given size, each carrying its
/// block number and more-data flag. The final block may be short. An empty
/// payload yields a single empty block.
pub fn split_into_blocks(payload: &[u8], block_size: usize) -> Vec<(BlockOption, &[u8])> {
    assert!((MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size), "invalid block size");
    if payload.is_empty() {
        return vec![(BlockOption { number: 0, more: false, size: block_size }, payload)];
    }
    let count = payload.len().div_ceil(block_size);
    payload
        .chunks(block_size)
        .enumerate()
        .map(|(i, chunk)| {
            let block = BlockOption { number: i as u32, more: i + 1 < count, size: block_size };
            (block, chunk)
        })
        .collect()
}

/// An in-progress block transfer.
struct Transfer {
    /// Received blocks by number. Duplicates are ignored idempotently.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The negotiated block size. All blocks of a transfer must agree.
    block_size: usize,
    /// The final block number, once the block without a more-flag arrives.
    last_number: Option<u32>,
    /// Total buffered bytes, for memory accounting.
    bytes: usize,
    /// The last block arrival, for expiry.
    last_activity: Instant,
}

/// Reassembles block-wise transfers, keyed by peer address and token.
/// Tolerates arbitrary reordering and duplication of blocks. Memory use is
/// bounded: transfers that would exceed the limit are rejected as
/// overloaded, and incomplete transfers are discarded after a timeout.
pub struct Reassembler {
    transfers: HashMap<(SocketAddr, Vec<u8>), Transfer>,
    /// Total buffered bytes across all transfers.
    bytes: usize,
    max_bytes: usize,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(max_bytes: usize, timeout: Duration) -> Self {
        Self { transfers: HashMap::new(), bytes: 0, max_bytes, timeout }
    }

    /// Adds a received block to its transfer, creating the transfer on the
    /// first block. Returns the reassembled payload once all blocks from 0
    /// through the final block have arrived.
    ///
    /// Duplicate blocks are ignored. Blocks that contradict the transfer
    /// (mismatched block size, non-final block that isn't full-size) are
    /// rejected as malformed. Blocks that would exceed the memory budget
    /// are rejected as overloaded.
    pub fn insert(
        &mut self,
        peer: SocketAddr,
        token: &[u8],
        block: BlockOption,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        // All blocks except the final one must be exactly one block long.
        if block.more && data.len() != block.size {
            return errdata!("non-final block of {} bytes, expected {}", data.len(), block.size);
        }
        if !block.more && data.len() > block.size {
            return errdata!("final block exceeds block size");
        }

        let key = (peer, token.to_vec());
        let transfer = self.transfers.entry(key).or_insert_with(|| Transfer {
            blocks: BTreeMap::new(),
            block_size: block.size,
            last_number: None,
            bytes: 0,
            last_activity: Instant::now(),
        });
        transfer.last_activity = Instant::now();

        if block.size != transfer.block_size {
            return errdata!("block size changed mid-transfer");
        }
        if !block.more {
            transfer.last_number = Some(block.number);
        }

        // Duplicates are idempotently ignored.
        if !transfer.blocks.contains_key(&block.number) {
            if self.bytes + data.len() > self.max_bytes {
                return Err(Error::Overloaded);
            }
            transfer.blocks.insert(block.number, data.to_vec());
            transfer.bytes += data.len();
            self.bytes += data.len();
        }

        // Complete once blocks 0..=last have all arrived.
        let Some(last) = transfer.last_number else { return Ok(None) };
        if transfer.blocks.len() as u32 != last + 1 {
            return Ok(None);
        }
        let key = (peer, token.to_vec());
        let transfer = self.transfers.remove(&key).expect("transfer must exist");
        self.bytes -= transfer.bytes;
        // BTreeMap iteration yields the blocks in number order.
        Ok(Some(transfer.blocks.into_values().flatten().collect()))
    }

    /// Discards incomplete transfers that haven't seen a block within the
    /// timeout, freeing their memory. Returns the number discarded.
    pub fn cleanup_expired(&mut self) -> usize {
        let cutoff = Instant::now() - self.timeout;
        let expired: Vec<_> = self
            .transfers
            .iter()
            .filter(|(_, t)| t.last_activity < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(transfer) = self.transfers.remove(key) {
                debug!("expiring incomplete block transfer from {}", key.0);
                self.bytes -= transfer.bytes;
            }
        }
        expired.len()
    }

    /// Returns the total buffered bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Returns the number of in-progress transfers.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
