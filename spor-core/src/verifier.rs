// vim: tw=80
//! The Verifier
//!
//! Re-reads previously written regions and judges each one against the
//! pattern that was last acknowledged there.  Only exact equality counts.

use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::hash::Hasher;
use tracing::{debug, warn};

use crate::{
    blockio::BlockIo,
    pattern::{self, Pattern, PatternId},
    types::Region,
    writer::WriteRecord,
};

/// The verdict on a single region
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum VerificationOutcome {
    /// Every byte matched the expected pattern
    Consistent {
        region:  Region,
        pattern: PatternId,
    },
    /// At least one byte differed
    Mismatch {
        region:           Region,
        expected:         PatternId,
        /// The pattern whose stamp was found at the start of the region, if
        /// any
        observed:         Option<PatternId>,
        /// Device offset of the first differing byte
        first_difference: u64,
        differing_bytes:  u64,
        /// MetroHash64 of the observed contents
        fingerprint:      u64,
    },
    /// The region could not be read at all
    Unreadable {
        region:   Region,
        expected: PatternId,
        error:    String,
    },
}

impl VerificationOutcome {
    pub fn is_consistent(&self) -> bool {
        matches!(self, VerificationOutcome::Consistent { .. })
    }

    pub fn region(&self) -> Region {
        match self {
            VerificationOutcome::Consistent { region, .. } => *region,
            VerificationOutcome::Mismatch { region, .. } => *region,
            VerificationOutcome::Unreadable { region, .. } => *region,
        }
    }
}

pub struct Verifier<'a> {
    io: &'a dyn BlockIo,
}

impl<'a> Verifier<'a> {
    pub fn new(io: &'a dyn BlockIo) -> Self {
        Verifier { io }
    }

    /// Read `region` and compare it to the content of `expected`.
    pub fn verify(&self, region: Region, expected: &Pattern)
        -> VerificationOutcome
    {
        let observed = match self.io.read(region.volume, region.offset,
                                          region.len())
        {
            Ok(buf) if buf.len() == region.len() => buf,
            Ok(buf) => {
                let error = format!("short read: {} of {} bytes", buf.len(),
                                    region.len());
                return self.unreadable(region, expected, error);
            }
            Err(e) => return self.unreadable(region, expected, e.to_string())
        };
        let mut wanted = vec![0u8; region.len()];
        expected.fill(&mut wanted);
        let mut first = None;
        let mut differing_bytes = 0u64;
        for (i, (o, w)) in observed.iter().zip(wanted.iter()).enumerate() {
            if o != w {
                first.get_or_insert(i);
                differing_bytes += 1;
            }
        }
        let Some(first) = first else {
            debug!(%region, pattern = %expected.id(), "consistent");
            return VerificationOutcome::Consistent {
                region,
                pattern: expected.id()
            };
        };
        let mut hasher = MetroHash64::new();
        hasher.write(&observed);
        let outcome = VerificationOutcome::Mismatch {
            region,
            expected: expected.id(),
            observed: pattern::identify(&observed),
            first_difference: region.offset + first as u64,
            differing_bytes,
            fingerprint: hasher.finish(),
        };
        warn!(?outcome, "mismatch");
        outcome
    }

    /// Verify a region against its `WriteRecord`.
    pub fn verify_record(&self, record: &WriteRecord) -> VerificationOutcome {
        self.verify(record.region, &record.pattern)
    }

    fn unreadable(&self, region: Region, expected: &Pattern, error: String)
        -> VerificationOutcome
    {
        warn!(%region, %error, "unreadable");
        VerificationOutcome::Unreadable {
            region,
            expected: expected.id(),
            error
        }
    }
}
