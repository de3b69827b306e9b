use std::collections::BTreeSet;

/// Cache line usage of one wavefront access.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Usage {
    /// Lower bound assuming perfectly packed addresses.
    pub needed: u64,
    /// Distinct cache lines touched by the actual addresses.
    pub used: u64,
}

impl Usage {
    #[must_use]
    pub fn is_efficient(&self) -> bool {
        self.used == self.needed
    }

    /// Number of cache lines used beyond the minimum.
    #[must_use]
    pub fn excess(&self) -> u64 {
        self.used.saturating_sub(self.needed)
    }
}

/// Minimum number of cache lines for `num_lanes` lanes accessing `access_size` bytes each.
#[must_use]
pub fn min_cache_lines_needed(num_lanes: usize, access_size: u16, line_size: u32) -> u64 {
    debug_assert!(line_size > 0);
    let num_bytes = num_lanes as u64 * u64::from(access_size);
    num_bytes.div_ceil(u64::from(line_size))
}

/// Indices of the cache lines touched by accesses of `access_size` bytes at `addrs`.
///
/// An access that straddles a line boundary touches every line it overlaps.
pub fn cache_lines_used(
    addrs: impl IntoIterator<Item = u64>,
    access_size: u16,
    line_size: u32,
) -> BTreeSet<u64> {
    debug_assert!(line_size > 0);
    let line_size = u64::from(line_size);
    let mut lines = BTreeSet::new();
    for first_byte in addrs {
        // the last line of the address space holds accesses that wrap around
        let last_byte = first_byte.saturating_add(u64::from(access_size.max(1)) - 1);
        let first_line = first_byte / line_size;
        let last_line = last_byte / line_size;
        lines.extend(first_line..=last_line);
    }
    lines
}

/// Compute the cache line usage of a wavefront access.
pub fn usage(addrs: &[u64], access_size: u16, line_size: u32) -> Usage {
    Usage {
        needed: min_cache_lines_needed(addrs.len(), access_size, line_size),
        used: cache_lines_used(addrs.iter().copied(), access_size, line_size).len() as u64,
    }
}

/// Whether an access whose size was corrected to the compiled instruction width
/// exceeds the minimum by exactly one line.
///
/// Several narrow accesses fused into one wide instruction report the
/// addresses of the narrow accesses, which typically makes the wide access
/// appear to touch a single extra line. Such accesses are not reported.
#[must_use]
pub fn is_fusion_artifact(usage: &Usage, size_corrected: bool) -> bool {
    size_corrected && usage.used == usage.needed + 1
}
