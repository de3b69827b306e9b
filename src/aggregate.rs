//! Per source location accumulation of access statistics.
use crate::cache_lines;
use std::collections::BTreeMap;
use trace_model::Direction;

/// A statistic summed over all executions of an access.
pub trait Metric: std::fmt::Debug + Default + Clone + std::ops::AddAssign {
    /// Whether the accumulated statistic shows an inefficiency worth reporting.
    fn is_inefficient(&self) -> bool;
}

impl std::ops::AddAssign for cache_lines::Usage {
    fn add_assign(&mut self, other: Self) {
        self.needed += other.needed;
        self.used += other.used;
    }
}

impl Metric for cache_lines::Usage {
    fn is_inefficient(&self) -> bool {
        !self.is_efficient()
    }
}

/// Total number of bank conflicts.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BankConflicts(pub u64);

impl std::ops::AddAssign for BankConflicts {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Metric for BankConflicts {
    fn is_inefficient(&self) -> bool {
        self.0 > 0
    }
}

/// Source location of an access.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location<'a> {
    pub file: &'a str,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Accumulated statistics of all accesses at one location with the same
/// access sizes and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<M> {
    /// Bytes per lane at the IR level.
    pub ir_access_size: u16,
    /// Bytes per lane of the ISA instruction, or 0 if unknown.
    pub isa_access_size: u16,
    pub direction: Direction,
    /// ISA instruction mnemonic, empty if unknown.
    pub isa_instruction: String,
    /// Number of executions.
    pub count: u64,
    pub metric: M,
}

impl<M> Entry<M> {
    /// A single execution of an access.
    pub fn new(
        ir_access_size: u16,
        isa_access_size: u16,
        direction: Direction,
        isa_instruction: impl Into<String>,
        metric: M,
    ) -> Self {
        Self {
            ir_access_size,
            isa_access_size,
            direction,
            isa_instruction: isa_instruction.into(),
            count: 1,
            metric,
        }
    }

    fn matches(&self, other: &Self) -> bool {
        self.ir_access_size == other.ir_access_size
            && self.isa_access_size == other.isa_access_size
            && self.direction == other.direction
    }
}

type Columns<M> = BTreeMap<u32, Vec<Entry<M>>>;
type Lines<M> = BTreeMap<u32, Columns<M>>;

/// Accesses by file, line and column.
///
/// Iteration is ordered by location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store<M> {
    files: BTreeMap<String, Lines<M>>,
}

impl<M> Default for Store<M> {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }
}

impl<M> Store<M>
where
    M: Metric,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an access into the entry with the same access sizes and direction,
    /// or add it as a new entry.
    pub fn record(&mut self, file: &str, line: u32, column: u32, access: Entry<M>) {
        let entries = self
            .files
            .entry(file.to_string())
            .or_default()
            .entry(line)
            .or_default()
            .entry(column)
            .or_default();

        // few distinct sizes and directions per location
        match entries.iter_mut().find(|entry| entry.matches(&access)) {
            Some(entry) => {
                entry.count += access.count;
                entry.metric += access.metric;
            }
            None => entries.push(access),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Location<'_>, &Entry<M>)> + '_ {
        self.files.iter().flat_map(|(file, lines)| {
            lines.iter().flat_map(move |(line, columns)| {
                columns.iter().flat_map(move |(column, entries)| {
                    entries.iter().map(move |entry| {
                        let location = Location {
                            file: file.as_str(),
                            line: *line,
                            column: *column,
                        };
                        (location, entry)
                    })
                })
            })
        })
    }

    /// Entries to report, all of them if `verbose`.
    pub fn reportable(&self, verbose: bool) -> impl Iterator<Item = (Location<'_>, &Entry<M>)> + '_ {
        self.iter()
            .filter(move |(_, entry)| verbose || entry.metric.is_inefficient())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}
