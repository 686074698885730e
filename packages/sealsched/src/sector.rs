use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SchedError;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// On-chain identity of a sector: owning miner actor plus sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorId {
    pub miner: u64,
    pub number: u64,
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-t0{}-{}", self.miner, self.number)
    }
}

/// Registered seal proof size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofType {
    StackedDrg2KiB,
    StackedDrg8MiB,
    StackedDrg512MiB,
    StackedDrg4GiB,
    StackedDrg16GiB,
    StackedDrg32GiB,
    StackedDrg64GiB,
}

impl ProofType {
    pub const ALL: [ProofType; 7] = [
        ProofType::StackedDrg2KiB,
        ProofType::StackedDrg8MiB,
        ProofType::StackedDrg512MiB,
        ProofType::StackedDrg4GiB,
        ProofType::StackedDrg16GiB,
        ProofType::StackedDrg32GiB,
        ProofType::StackedDrg64GiB,
    ];

    /// Unsealed payload size of one sector of this proof class.
    pub fn sector_size(&self) -> u64 {
        match self {
            ProofType::StackedDrg2KiB => 2 * KIB,
            ProofType::StackedDrg8MiB => 8 * MIB,
            ProofType::StackedDrg512MiB => 512 * MIB,
            ProofType::StackedDrg4GiB => 4 * GIB,
            ProofType::StackedDrg16GiB => 16 * GIB,
            ProofType::StackedDrg32GiB => 32 * GIB,
            ProofType::StackedDrg64GiB => 64 * GIB,
        }
    }
}

impl fmt::Display for ProofType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProofType::StackedDrg2KiB => "2KiB",
            ProofType::StackedDrg8MiB => "8MiB",
            ProofType::StackedDrg512MiB => "512MiB",
            ProofType::StackedDrg4GiB => "4GiB",
            ProofType::StackedDrg16GiB => "16GiB",
            ProofType::StackedDrg32GiB => "32GiB",
            ProofType::StackedDrg64GiB => "64GiB",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProofType {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2KiB" => Ok(ProofType::StackedDrg2KiB),
            "8MiB" => Ok(ProofType::StackedDrg8MiB),
            "512MiB" => Ok(ProofType::StackedDrg512MiB),
            "4GiB" => Ok(ProofType::StackedDrg4GiB),
            "16GiB" => Ok(ProofType::StackedDrg16GiB),
            "32GiB" => Ok(ProofType::StackedDrg32GiB),
            "64GiB" => Ok(ProofType::StackedDrg64GiB),
            other => Err(SchedError::UnknownProofSize(other.to_string())),
        }
    }
}

/// Sector plus the proof class its tasks are costed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRef {
    pub id: SectorId,
    pub proof_type: ProofType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_type_round_trips_through_str() {
        for pt in ProofType::ALL {
            let parsed: ProofType = pt.to_string().parse().unwrap();
            assert_eq!(parsed, pt);
        }
        assert!("3GiB".parse::<ProofType>().is_err());
    }

    #[test]
    fn sector_sizes_are_increasing() {
        let sizes: Vec<u64> = ProofType::ALL.iter().map(|p| p.sector_size()).collect();
        for pair in sizes.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
