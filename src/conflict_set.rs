//! Shared memory (LDS) bank conflict model.
//!
//! The LDS serves 32 banks of 4-byte words per cycle. Which lanes of a
//! wavefront are serviced in the same cycle depends on the per-lane access
//! size: 1, 2 and 4 byte accesses are serviced per half wavefront, 8 byte
//! accesses per quarter wavefront, and 16 byte accesses in eight groups of
//! lanes chosen such that their four dwords fall into complementary banks.
//! Each such group is a *conflict set*: only lanes in the same conflict set
//! can conflict with each other.
//!
//! A bank conflict occurs when lanes of a conflict set access different dwords
//! within the same bank. Lanes accessing the same dword are served by a
//! broadcast and do not conflict.
use bitvec::{array::BitArray, BitArr};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use trace_model::{LaneAccess, WAVEFRONT_SIZE};

pub const NUM_BANKS: usize = 32;

/// Size of a bank word in bytes.
pub const WORD_SIZE: u64 = 4;

pub type LaneSet = BitArr!(for WAVEFRONT_SIZE, in u64);

/// Conflict set topology per access size in bytes.
pub static CONFLICT_SET_TABLE: &[(u16, &[&[Range<usize>]])] = &[
    (1, &[&[0..32], &[32..64]]),
    (2, &[&[0..32], &[32..64]]),
    (4, &[&[0..32], &[32..64]]),
    (8, &[&[0..16], &[16..32], &[32..48], &[48..64]]),
    (
        16,
        &[
            &[0..4, 20..24],
            &[4..8, 16..20],
            &[8..12, 28..32],
            &[12..16, 24..28],
            &[32..36, 52..56],
            &[36..40, 48..52],
            &[40..44, 60..64],
            &[44..48, 56..60],
        ],
    ),
];

/// Dword index of a byte address.
#[must_use]
#[inline]
pub fn word(addr: u64) -> u64 {
    addr / WORD_SIZE
}

/// Bank serving a byte address.
#[must_use]
#[inline]
pub fn bank(addr: u64) -> usize {
    (word(addr) % NUM_BANKS as u64) as usize
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("empty lane range {start}..{end} for {access_size}-byte accesses")]
    EmptyRange {
        access_size: u16,
        start: usize,
        end: usize,
    },

    #[error("lane {lane} is out of range for {access_size}-byte accesses")]
    LaneOutOfRange { access_size: u16, lane: usize },

    #[error("lane {lane} is in more than one conflict set for {access_size}-byte accesses")]
    Overlap { access_size: u16, lane: usize },

    #[error("lane {lane} is in no conflict set for {access_size}-byte accesses")]
    Gap { access_size: u16, lane: usize },
}

/// Partition of the wavefront lanes into conflict sets for one access size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub access_size: u16,
    pub groups: Vec<LaneSet>,
}

impl Partition {
    pub fn new(access_size: u16, groups: &[&[Range<usize>]]) -> Result<Self, PartitionError> {
        let groups = groups
            .iter()
            .map(|ranges| {
                let mut lanes: LaneSet = BitArray::ZERO;
                for range in ranges.iter() {
                    if range.start >= range.end {
                        return Err(PartitionError::EmptyRange {
                            access_size,
                            start: range.start,
                            end: range.end,
                        });
                    }
                    if range.end > WAVEFRONT_SIZE {
                        return Err(PartitionError::LaneOutOfRange {
                            access_size,
                            lane: range.end - 1,
                        });
                    }
                    lanes[range.clone()].fill(true);
                }
                Ok(lanes)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let partition = Self {
            access_size,
            groups,
        };
        partition.validate()?;
        Ok(partition)
    }

    /// Check that every lane is in exactly one conflict set.
    pub fn validate(&self) -> Result<(), PartitionError> {
        let access_size = self.access_size;
        for lane in 0..WAVEFRONT_SIZE {
            let num_groups = self.groups.iter().filter(|group| group[lane]).count();
            match num_groups {
                1 => {}
                0 => return Err(PartitionError::Gap { access_size, lane }),
                _ => return Err(PartitionError::Overlap { access_size, lane }),
            }
        }
        Ok(())
    }

    /// Index of the conflict set that contains `lane`.
    #[must_use]
    pub fn group_of(&self, lane: usize) -> Option<usize> {
        self.groups
            .iter()
            .position(|group| group.get(lane).is_some_and(|active| *active))
    }
}

/// Partitions of the built-in table, validated once on first use.
pub static PARTITIONS: Lazy<Vec<Partition>> = Lazy::new(|| {
    CONFLICT_SET_TABLE
        .iter()
        .map(|(access_size, groups)| Partition::new(*access_size, groups))
        .collect::<Result<_, _>>()
        .unwrap_or_else(|err| panic!("invalid conflict set table: {err}"))
});

/// Lanes serviced together, and the dwords they accessed per bank.
#[derive(Debug, Clone)]
pub struct ConflictSet {
    lanes: LaneSet,
    banks: Vec<HashSet<u64>>,
}

impl ConflictSet {
    #[must_use]
    pub fn new(lanes: LaneSet) -> Self {
        Self {
            lanes,
            banks: vec![HashSet::new(); NUM_BANKS],
        }
    }

    #[must_use]
    pub fn contains(&self, lane: usize) -> bool {
        self.lanes.get(lane).is_some_and(|active| *active)
    }

    /// Record the access of a lane.
    ///
    /// Returns `false` if the lane is not part of this conflict set.
    pub fn register_access(&mut self, lane: usize, addr: u64) -> bool {
        if !self.contains(lane) {
            return false;
        }
        self.banks[bank(addr)].insert(word(addr));
        true
    }

    /// Number of additional cycles needed to serve all registered accesses.
    #[must_use]
    pub fn bank_conflict_count(&self) -> usize {
        let max_words_per_bank = self.banks.iter().map(HashSet::len).max().unwrap_or(0);
        max_words_per_bank.saturating_sub(1)
    }

    pub fn clear(&mut self) {
        for bank in &mut self.banks {
            bank.clear();
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bank conflict handling of {access_size}-byte accesses not supported")]
pub struct UnsupportedAccessSize {
    pub access_size: u16,
}

/// Conflict sets for all supported access sizes.
///
/// The topology is fixed, the per-bank state is scoped to a single access.
#[derive(Debug, Clone)]
pub struct ConflictSets {
    by_access_size: BTreeMap<u16, Vec<ConflictSet>>,
}

impl Default for ConflictSets {
    fn default() -> Self {
        Self::from_partitions(&PARTITIONS)
    }
}

impl ConflictSets {
    #[must_use]
    pub fn from_partitions(partitions: &[Partition]) -> Self {
        let by_access_size = partitions
            .iter()
            .map(|partition| {
                let sets = partition.groups.iter().copied().map(ConflictSet::new).collect();
                (partition.access_size, sets)
            })
            .collect();
        Self { by_access_size }
    }

    #[must_use]
    pub fn supports(&self, access_size: u16) -> bool {
        self.by_access_size.contains_key(&access_size)
    }

    /// Total bank conflicts of a single wavefront access.
    ///
    /// # Panics
    /// If an address is not naturally aligned to `access_size`.
    pub fn bank_conflicts(
        &mut self,
        access_size: u16,
        lanes: &[LaneAccess],
    ) -> Result<usize, UnsupportedAccessSize> {
        let sets = self
            .by_access_size
            .get_mut(&access_size)
            .ok_or(UnsupportedAccessSize { access_size })?;

        for &LaneAccess { lane, address } in lanes {
            // misaligned addresses indicate broken instrumentation
            assert_eq!(
                address % u64::from(access_size),
                0,
                "lane {lane}: address {address:#x} is not aligned to {access_size} bytes"
            );
            let registered = sets.iter_mut().any(|set| set.register_access(lane, address));
            if !registered {
                log::debug!("lane {lane} is not covered by any {access_size}-byte conflict set");
            }
        }

        let mut total = 0;
        for set in sets.iter_mut() {
            total += set.bank_conflict_count();
            set.clear();
        }
        Ok(total)
    }
}
