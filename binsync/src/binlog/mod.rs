//! Binlog file positions and replication locations.
//!
//! Binlog files are named `basename.NNNNNN` with a monotonically increasing
//! numeric sequence. Positions persisted while reading from a relay carry an
//! embedded relay uuid suffix, `basename|SSSSSS.NNNNNN`, identifying the
//! relay subdirectory the file came from. Ordering compares the uuid suffix
//! first, then the file sequence, then the byte offset.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Lowest possible relay uuid suffix, used when no checkpoint exists yet.
pub const MIN_UUID_SUFFIX: u32 = 1;

/// Separator between the binlog basename and the relay uuid suffix.
const UUID_SUFFIX_SEPARATOR: char = '|';

/// Errors from binlog name parsing.
#[derive(Debug, Clone, Error)]
pub enum BinlogError {
    /// The uuid suffix embedded in a binlog file name is not numeric.
    #[error("invalid uuid suffix in binlog file name {0:?}")]
    InvalidUuidSuffix(String),
}

/// A position inside the upstream binlog stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name, possibly carrying a relay uuid suffix.
    pub name: String,
    /// Byte offset inside the file.
    pub pos: u32,
}

impl BinlogPosition {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// Splits the name into `(basename, uuid suffix, sequence)`.
    ///
    /// `mysql-bin|000003.000123` parses to `("mysql-bin", Some("000003"),
    /// Some("000123"))`; a name without a dot yields no sequence.
    fn parts(&self) -> (&str, Option<&str>, Option<&str>) {
        let (head, seq) = match self.name.rsplit_once('.') {
            Some((head, seq)) => (head, Some(seq)),
            None => (self.name.as_str(), None),
        };
        match head.split_once(UUID_SUFFIX_SEPARATOR) {
            Some((base, suffix)) => (base, Some(suffix), seq),
            None => (head, None, seq),
        }
    }

    /// Numeric sequence of the binlog file, e.g. 123 for `mysql-bin.000123`.
    pub fn sequence(&self) -> Option<u64> {
        let (_, _, seq) = self.parts();
        seq.and_then(|s| s.parse::<u64>().ok())
    }

    /// Relay uuid suffix embedded in the name, if any.
    pub fn uuid_suffix(&self) -> Result<Option<u32>, BinlogError> {
        let (_, suffix, _) = self.parts();
        match suffix {
            None => Ok(None),
            Some(s) => s
                .parse::<u32>()
                .map(Some)
                .map_err(|_| BinlogError::InvalidUuidSuffix(self.name.clone())),
        }
    }

    /// Comparison key: `(uuid suffix, file sequence, offset)`.
    ///
    /// A name without a suffix sorts as [`MIN_UUID_SUFFIX`]; a name whose
    /// suffix or sequence is not numeric falls back to `u64::MAX` so that
    /// malformed names never win a minimum search.
    fn order_key(&self) -> (u64, u64, u32) {
        let suffix = match self.uuid_suffix() {
            Ok(Some(s)) => u64::from(s),
            Ok(None) => u64::from(MIN_UUID_SUFFIX),
            Err(_) => u64::MAX,
        };
        let seq = self.sequence().unwrap_or(u64::MAX);
        (suffix, seq, self.pos)
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

/// A binlog position together with the GTID set reached at that position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogLocation {
    pub position: BinlogPosition,
    /// Serialized GTID set. Empty when GTID mode is disabled.
    pub gtid_set: String,
}

impl BinlogLocation {
    pub fn new(position: BinlogPosition, gtid_set: impl Into<String>) -> Self {
        Self {
            position,
            gtid_set: gtid_set.into(),
        }
    }
}

impl PartialOrd for BinlogLocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogLocation {
    fn cmp(&self, other: &Self) -> Ordering {
        // The position dominates; the GTID set only breaks exact ties.
        self.position
            .cmp(&other.position)
            .then_with(|| self.gtid_set.cmp(&other.gtid_set))
    }
}

impl std::fmt::Display for BinlogLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} gtid={}", self.position, self.gtid_set)
    }
}

/// Extracts the relay uuid suffix from a binlog file name.
///
/// Returns [`MIN_UUID_SUFFIX`] for names that carry no suffix, so positions
/// recorded from a direct upstream read stay usable.
pub fn extract_suffix(name: &str) -> Result<u32, BinlogError> {
    let pos = BinlogPosition::new(name, 0);
    Ok(pos.uuid_suffix()?.unwrap_or(MIN_UUID_SUFFIX))
}

/// Strips the relay uuid suffix from a position, yielding the plain binlog
/// file name the relay stores on disk.
///
/// `mysql-bin|000003.000123` adjusts to `mysql-bin.000123`; names without a
/// suffix pass through unchanged.
pub fn adjust_position(position: &BinlogPosition) -> BinlogPosition {
    let (base, suffix, seq) = position.parts();
    match (suffix, seq) {
        (Some(_), Some(seq)) => BinlogPosition::new(format!("{base}.{seq}"), position.pos),
        _ => position.clone(),
    }
}

/// Pointwise minimum of two optional locations.
pub fn min_location(
    a: Option<BinlogLocation>,
    b: Option<BinlogLocation>,
) -> Option<BinlogLocation> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b < a { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}
