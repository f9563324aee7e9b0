// vim: tw=80
//! Common type definitions used throughout the harness

use serde_derive::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
    time::Duration,
};
use thiserror::Error;

/// Identifies one logical volume of the storage service under test.
pub type VolumeId = u32;

/// The harness's error type.
///
/// Data-consistency failures are not errors.  They are reported as
/// [`VerificationOutcome`](crate::verifier::VerificationOutcome)s.  Everything
/// here means that a scenario could not run to completion.
#[derive(Debug, Error)]
pub enum Error {
    /// The write primitive failed.  No `WriteRecord` exists for the region.
    #[error("write to {region} failed: {source}")]
    Write {
        region: Region,
        #[source]
        source: io::Error,
    },
    /// A state wait never observed its target condition.
    #[error("timed out after {elapsed:?} waiting for {target}")]
    Timeout {
        target:  ArrayCondition,
        elapsed: Duration,
    },
    /// An administrative call that the scenario depends on, such as
    /// remounting a volume after a crash, returned a non-zero response code.
    #[error("{step} failed with response code {code}")]
    Reattach { step: String, code: i32 },
    /// A gateway request could not be issued, or its reply was unintelligible
    #[error("gateway error: {0}")]
    Gateway(String),
    /// The storage service process could not be started or killed
    #[error("process control error: {0}")]
    Process(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// A short, stable name for the error's category.  Used in result
    /// artifacts.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Write { .. } => "write",
            Error::Timeout { .. } => "timeout",
            Error::Reattach { .. } => "reattach",
            Error::Gateway(_) => "gateway",
            Error::Process(_) => "process",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }

    /// Does this error indicate a problem with the harness or its environment,
    /// rather than with the data path of the storage service?
    pub fn is_harness_failure(&self) -> bool {
        !matches!(self, Error::Write { .. } | Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A contiguous range of bytes on one volume.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct Region {
    pub volume: VolumeId,
    pub offset: u64,
    pub size:   u64,
}

impl Region {
    pub fn new(volume: VolumeId, offset: u64, size: u64) -> Self {
        Region {
            volume,
            offset,
            size,
        }
    }

    /// The first byte past the end of the region
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Size as a buffer length
    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Do two regions share at least one byte?
    pub fn overlaps(&self, other: &Region) -> bool {
        self.volume == other.volume &&
            self.offset < other.end() &&
            other.offset < self.end()
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "volume {} [{:#x}, {:#x})", self.volume, self.offset,
               self.end())
    }
}

/// The condition of an array or volume, as reported by the storage service.
///
/// The harness does not own this state.  It only observes it.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ArrayCondition {
    /// Fully redundant and serving I/O
    Normal,
    /// Operating with reduced redundancy
    Degraded,
    /// Reconstructing data onto a replacement device
    Rebuilding,
    /// Not loaded, or stopped
    Offline,
    /// Too many devices lost to serve any I/O
    Broken,
    Mounted,
    Unmounted,
    /// Any other, service-specific condition
    Other(String),
}

impl From<&str> for ArrayCondition {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => ArrayCondition::Normal,
            "DEGRADED" => ArrayCondition::Degraded,
            "REBUILD" | "REBUILDING" => ArrayCondition::Rebuilding,
            "OFFLINE" | "STOP" => ArrayCondition::Offline,
            "BROKEN" | "FAULT" => ArrayCondition::Broken,
            "MOUNTED" => ArrayCondition::Mounted,
            "UNMOUNTED" => ArrayCondition::Unmounted,
            other => ArrayCondition::Other(other.to_owned()),
        }
    }
}

impl Display for ArrayCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ArrayCondition::Normal => "NORMAL".fmt(f),
            ArrayCondition::Degraded => "DEGRADED".fmt(f),
            ArrayCondition::Rebuilding => "REBUILDING".fmt(f),
            ArrayCondition::Offline => "OFFLINE".fmt(f),
            ArrayCondition::Broken => "BROKEN".fmt(f),
            ArrayCondition::Mounted => "MOUNTED".fmt(f),
            ArrayCondition::Unmounted => "UNMOUNTED".fmt(f),
            ArrayCondition::Other(s) => s.fmt(f),
        }
    }
}

/// Parse a human-readable size, like "128k" or "1M", into bytes.
///
/// Suffixes are binary and case-insensitive.  A trailing "b" or "ib" is
/// accepted and ignored.
pub fn parse_size(s: &str) -> Result<u64> {
    let invalid = || Error::Config(format!("invalid size {s:?}"));
    let lower = s.trim().to_ascii_lowercase();
    let t = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);
    let (digits, multiplier) = match t.as_bytes().last() {
        Some(b'k') => (&t[..t.len() - 1], 1u64 << 10),
        Some(b'm') => (&t[..t.len() - 1], 1 << 20),
        Some(b'g') => (&t[..t.len() - 1], 1 << 30),
        Some(b't') => (&t[..t.len() - 1], 1 << 40),
        _ => (t, 1),
    };
    digits
        .parse::<u64>()
        .map_err(|_| invalid())?
        .checked_mul(multiplier)
        .ok_or_else(invalid)
}
