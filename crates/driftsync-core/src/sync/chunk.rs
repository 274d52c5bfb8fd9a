//! Chunking protocol for oversized manual transfers
//!
//! A payload larger than the transfer capacity is split into self-describing
//! text chunks that can each be rendered as one visual code and scanned in
//! any order.
//!
//! ## Chunk text format
//!
//! ```text
//! dsc|<version>|<bundleId>|<index>|<total>|<payload>
//! ```
//!
//! `index` is 1-based. The payload is everything after the fifth delimiter
//! and may itself contain `|`. A payload that fits the capacity is emitted
//! bare, with no header at all.
//!
//! The minimum chunk count is found by fixed-point iteration: the header
//! prints `index` and `total` as decimal digits, so the header length depends
//! on the chunk count it describes.

use std::collections::BTreeMap;

use ulid::Ulid;

use crate::error::{SyncError, SyncResult};

/// Tag marking a chunked payload
pub const CHUNK_TAG: &str = "dsc";
/// Current chunk protocol version
pub const CHUNK_VERSION: u32 = 1;
/// Default transfer capacity: the largest payload a single code can carry
pub const DEFAULT_CAPACITY: usize = 2953;

const CHUNK_PREFIX: &str = "dsc|";

/// One fragment of an oversized payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Random id shared by all chunks of one bundle
    pub bundle_id: String,
    /// 1-based position of this chunk
    pub index: usize,
    /// Total chunks in the bundle
    pub total: usize,
    /// This chunk's slice of the bundle
    pub payload: String,
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

fn header_len(bundle_id: &str, total: usize) -> usize {
    // dsc|1|<bundle>|<index>|<total>|
    CHUNK_TAG.len()
        + 1
        + digits(CHUNK_VERSION as usize)
        + 1
        + bundle_id.len()
        + 1
        + digits(total)
        + 1
        + digits(total)
        + 1
}

fn slice_payloads(bundle: &str, per_chunk: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = bundle;
    while !rest.is_empty() {
        if rest.len() <= per_chunk {
            parts.push(rest);
            break;
        }
        let mut cut = per_chunk;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        parts.push(head);
        rest = tail;
    }
    parts
}

/// Split a bundle into transferable frames
///
/// Returns a single bare frame when the bundle fits the capacity, otherwise
/// the minimum number of headered chunks whose every frame fits it.
///
/// # Errors
///
/// Returns `SyncError::CapacityTooSmall` when the capacity cannot hold a
/// chunk header plus at least one character of payload. That is a
/// configuration error, not a data error.
pub fn split(bundle: &str, capacity: usize) -> SyncResult<Vec<String>> {
    if bundle.len() <= capacity {
        return Ok(vec![bundle.to_string()]);
    }

    let bundle_id = Ulid::new().to_string().to_lowercase();
    let mut total = 2usize;
    let parts = loop {
        let header = header_len(&bundle_id, total);
        // Room for at least one full character of payload beside the header.
        if capacity < header + 4 {
            return Err(SyncError::CapacityTooSmall(capacity));
        }
        let parts = slice_payloads(bundle, capacity - header);
        if parts.len() <= total {
            break parts;
        }
        total = parts.len();
    };

    let total = parts.len();
    Ok(parts
        .iter()
        .enumerate()
        .map(|(i, payload)| {
            format!(
                "{CHUNK_TAG}|{CHUNK_VERSION}|{bundle_id}|{index}|{total}|{payload}",
                index = i + 1
            )
        })
        .collect())
}

/// Parse a scanned frame into a chunk
///
/// Returns `None` for a bare frame with no chunk header; such frames are a
/// complete bundle on their own.
///
/// # Errors
///
/// Returns `SyncError::InvalidChunk` on an unsupported version, a
/// non-numeric index or total, or an index outside `[1, total]`.
pub fn parse_header(text: &str) -> SyncResult<Option<Chunk>> {
    let Some(rest) = text.strip_prefix(CHUNK_PREFIX) else {
        return Ok(None);
    };

    let mut parts = rest.splitn(5, '|');
    let mut field = |name: &str| {
        parts
            .next()
            .ok_or_else(|| SyncError::InvalidChunk(format!("truncated header, missing {name}")))
    };
    let version = field("version")?;
    let bundle_id = field("bundle id")?;
    let index = field("index")?;
    let total = field("total")?;
    let payload = field("payload")?;

    let version: u32 = version
        .parse()
        .map_err(|_| SyncError::InvalidChunk(format!("non-numeric version: {version}")))?;
    if version != CHUNK_VERSION {
        return Err(SyncError::InvalidChunk(format!(
            "unsupported chunk version: {version}"
        )));
    }

    let index: usize = index
        .parse()
        .map_err(|_| SyncError::InvalidChunk(format!("non-numeric index: {index}")))?;
    let total: usize = total
        .parse()
        .map_err(|_| SyncError::InvalidChunk(format!("non-numeric total: {total}")))?;
    if total == 0 || index == 0 || index > total {
        return Err(SyncError::InvalidChunk(format!(
            "index {index} outside 1..={total}"
        )));
    }

    Ok(Some(Chunk {
        bundle_id: bundle_id.to_string(),
        index,
        total,
        payload: payload.to_string(),
    }))
}

/// Reassemble a complete chunk set into the original bundle
///
/// Input order never matters; payloads are concatenated by ascending index.
///
/// # Errors
///
/// Returns `SyncError::InvalidChunk` when chunks disagree on bundle id or
/// total, and `SyncError::MissingChunks` when fewer than `total` unique
/// indices are present.
pub fn assemble(chunks: &[Chunk]) -> SyncResult<String> {
    let Some(first) = chunks.first() else {
        return Err(SyncError::MissingChunks {
            received: 0,
            total: 0,
        });
    };

    let mut by_index: BTreeMap<usize, &str> = BTreeMap::new();
    for chunk in chunks {
        if chunk.bundle_id != first.bundle_id {
            return Err(SyncError::InvalidChunk(format!(
                "bundle id mismatch: {} vs {}",
                chunk.bundle_id, first.bundle_id
            )));
        }
        if chunk.total != first.total {
            return Err(SyncError::InvalidChunk(format!(
                "total mismatch: {} vs {}",
                chunk.total, first.total
            )));
        }
        if chunk.index == 0 || chunk.index > chunk.total {
            return Err(SyncError::InvalidChunk(format!(
                "index {} outside 1..={}",
                chunk.index, chunk.total
            )));
        }
        by_index.entry(chunk.index).or_insert(chunk.payload.as_str());
    }

    if by_index.len() < first.total {
        return Err(SyncError::MissingChunks {
            received: by_index.len(),
            total: first.total,
        });
    }

    Ok(by_index.values().copied().collect())
}

/// Accumulates chunks across multiple scans until a bundle completes
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    bundle_id: Option<String>,
    total: Option<usize>,
    parts: BTreeMap<usize, String>,
}

impl ChunkAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scanned chunk
    ///
    /// Re-scanning an already-held index is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidChunk` when the chunk disagrees with the
    /// bundle already being assembled.
    pub fn push(&mut self, chunk: Chunk) -> SyncResult<()> {
        if chunk.index == 0 || chunk.index > chunk.total {
            return Err(SyncError::InvalidChunk(format!(
                "index {} outside 1..={}",
                chunk.index, chunk.total
            )));
        }
        match (&self.bundle_id, self.total) {
            (Some(bundle_id), Some(total)) => {
                if *bundle_id != chunk.bundle_id {
                    return Err(SyncError::InvalidChunk(format!(
                        "bundle id mismatch: {} vs {}",
                        chunk.bundle_id, bundle_id
                    )));
                }
                if total != chunk.total {
                    return Err(SyncError::InvalidChunk(format!(
                        "total mismatch: {} vs {}",
                        chunk.total, total
                    )));
                }
            }
            _ => {
                self.bundle_id = Some(chunk.bundle_id.clone());
                self.total = Some(chunk.total);
            }
        }
        self.parts.entry(chunk.index).or_insert(chunk.payload);
        Ok(())
    }

    /// Unique chunk indices received so far
    pub fn received(&self) -> usize {
        self.parts.len()
    }

    /// Total chunks the bundle declares, once known
    pub fn total(&self) -> Option<usize> {
        self.total
    }

    /// Whether every chunk of the bundle has arrived
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|t| self.parts.len() >= t)
    }

    /// Reassemble the bundle
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MissingChunks` while chunks are still outstanding.
    pub fn assemble(&self) -> SyncResult<String> {
        let total = self.total.ok_or(SyncError::MissingChunks {
            received: 0,
            total: 0,
        })?;
        if self.parts.len() < total {
            return Err(SyncError::MissingChunks {
                received: self.parts.len(),
                total,
            });
        }
        Ok(self.parts.values().map(String::as_str).collect())
    }
}
