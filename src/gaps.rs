//! Gap analysis over sparse id coverage within a partition band.
//!
//! Gaps are recomputed on demand from the current manifest and the configured
//! band; nothing here is cached or stored. All resumability in the engine
//! falls out of this: stop at any point, and the next planning pass starts
//! from exactly the ids still missing.

use crate::models::{Gap, PartitionBand};

/// Compute the maximal uncovered ranges of `band`.
///
/// `covered` must be sorted ascending; duplicates and ids outside the band
/// are ignored. An empty band yields no gaps, a band with zero covered ids
/// yields one gap spanning the whole band, and a fully covered band yields
/// none.
pub fn gaps_for(band: &PartitionBand, covered: &[u64]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    if band.is_empty() {
        return gaps;
    }

    let mut cursor = band.min_id;
    for &id in covered {
        if id < cursor {
            continue;
        }
        if id > band.max_id {
            break;
        }
        if id > cursor {
            gaps.push(Gap {
                start: cursor,
                end: id - 1,
            });
        }
        if id == band.max_id {
            return gaps;
        }
        cursor = id + 1;
    }
    gaps.push(Gap {
        start: cursor,
        end: band.max_id,
    });
    gaps
}

/// Total number of ids remaining across `gaps`.
pub fn remaining(gaps: &[Gap]) -> u64 {
    gaps.iter().map(Gap::len).sum()
}
