use crate::{
    aggregate::{BankConflicts, Entry, Store},
    arch::{self, Architecture},
    cache_lines::{self, Usage},
    conflict_set::{ConflictSets, UnsupportedAccessSize},
    report::{self, Reporter},
    symbols::{self, Binding, Resolution, SymbolDatabase, UNKNOWN_SOURCE_FILE},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trace_model::{AccessMessage, MemorySpace, RawMessage};

/// Identity of the kernel dispatch a handler analyzes.
#[derive(Debug, Default, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId {
    pub name: String,
    pub dispatch_id: u64,
}

/// Reasons for a message not to be analyzed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error(transparent)]
    Decode(#[from] trace_model::Error),

    #[error("message from unsupported GPU hardware (architecture id {arch})")]
    UnsupportedHardware { arch: u8 },

    #[error(transparent)]
    UnsupportedWidth(#[from] UnsupportedAccessSize),

    #[error("no analysis for {} memory accesses", space_name(.space))]
    UnhandledMemorySpace { space: Option<MemorySpace> },
}

fn space_name(space: &Option<MemorySpace>) -> String {
    space.map_or_else(|| "unknown".to_string(), |space| space.to_string())
}

/// Memory access analysis of a single kernel dispatch.
///
/// Global memory accesses are analyzed for L2 cache line use,
/// shared memory (LDS) accesses for bank conflicts.
#[derive(Debug)]
pub struct Handler {
    kernel: KernelId,
    verbose: bool,
    conflict_sets: ConflictSets,
    global_accesses: Store<Usage>,
    lds_accesses: Store<BankConflicts>,
    /// Source file names of global accesses by file name hash.
    ///
    /// The instruction database has no entries for LDS instructions,
    /// so LDS accesses reuse the names resolved for global accesses.
    file_names: HashMap<u64, String>,
    arch: Option<Architecture>,
    reporter: Reporter,
}

impl Handler {
    /// Handler reporting as text to the console.
    #[must_use]
    pub fn new(kernel: KernelId, verbose: bool) -> Self {
        Self::with_reporter(kernel, verbose, Reporter::default())
    }

    #[must_use]
    pub fn with_reporter(kernel: KernelId, verbose: bool, reporter: Reporter) -> Self {
        Self {
            kernel,
            verbose,
            conflict_sets: ConflictSets::default(),
            global_accesses: Store::new(),
            lds_accesses: Store::new(),
            file_names: HashMap::new(),
            arch: None,
            reporter,
        }
    }

    /// Architecture to report until a message from supported hardware is seen.
    #[must_use]
    pub fn with_architecture(mut self, arch: Architecture) -> Self {
        self.arch = Some(arch);
        self
    }

    #[must_use]
    pub fn kernel(&self) -> &KernelId {
        &self.kernel
    }

    #[must_use]
    pub fn global_accesses(&self) -> &Store<Usage> {
        &self.global_accesses
    }

    #[must_use]
    pub fn lds_accesses(&self) -> &Store<BankConflicts> {
        &self.lds_accesses
    }

    /// Architecture of the most recent message from supported hardware.
    #[must_use]
    pub fn architecture(&self) -> Option<Architecture> {
        self.arch
    }

    /// Analyze a message without instruction level information.
    ///
    /// Returns whether the message was consumed by an analysis.
    pub fn handle(&mut self, message: &AccessMessage) -> bool {
        self.handle_bound(message, None)
    }

    /// Analyze a message, correlating it with the instructions of `kernel` in `db`.
    pub fn handle_with(
        &mut self,
        message: &AccessMessage,
        kernel: &str,
        db: &dyn SymbolDatabase,
    ) -> bool {
        self.handle_bound(message, Some(Binding { kernel, db }))
    }

    /// Decode and analyze a message as delivered by the host channel.
    pub fn handle_raw(&mut self, raw: &RawMessage) -> bool {
        match raw.decode() {
            Ok(message) => self.handle(&message),
            Err(err) => {
                log::debug!("skipping message: {}", Rejection::from(err));
                false
            }
        }
    }

    fn handle_bound(&mut self, message: &AccessMessage, binding: Option<Binding<'_>>) -> bool {
        match self.analyze(message, binding) {
            Ok(()) => true,
            Err(rejection @ Rejection::UnsupportedWidth(_)) => {
                log::warn!("{rejection}");
                false
            }
            Err(rejection) => {
                log::debug!("skipping message: {rejection}");
                false
            }
        }
    }

    fn analyze(
        &mut self,
        message: &AccessMessage,
        binding: Option<Binding<'_>>,
    ) -> Result<(), Rejection> {
        if let Some(arch) = Architecture::from_id(message.arch) {
            self.arch = Some(arch);
        }
        match message.memory_space {
            Some(MemorySpace::Global) => self.analyze_cache_line_use(message, binding),
            Some(MemorySpace::Shared) => self.analyze_bank_conflicts(message),
            space => Err(Rejection::UnhandledMemorySpace { space }),
        }
    }

    fn analyze_cache_line_use(
        &mut self,
        message: &AccessMessage,
        binding: Option<Binding<'_>>,
    ) -> Result<(), Rejection> {
        let line_size = arch::l2_cache_line_size(message.arch);
        if line_size == 0 {
            return Err(Rejection::UnsupportedHardware { arch: message.arch });
        }

        let ir_access_size = message.access_size;
        let resolution = symbols::correlate(binding, message);
        if resolution == Resolution::Ambiguous {
            // fused with accesses on other lines, counted there
            return Ok(());
        }

        let isa_access_size = resolution.access_size();
        let size_corrected = isa_access_size != 0 && isa_access_size != ir_access_size;
        let access_size = if size_corrected {
            log::debug!(
                "corrected access size from {ir_access_size} to {isa_access_size} bytes using debug information"
            );
            isa_access_size
        } else {
            ir_access_size
        };

        let addrs: Vec<u64> = message.addresses().collect();
        let usage = cache_lines::usage(&addrs, access_size, line_size);
        if cache_lines::is_fusion_artifact(&usage, size_corrected) {
            return Ok(());
        }
        if !usage.is_efficient() {
            self.log_excess_cache_lines(message, access_size, line_size, &usage);
        }

        let file_name = resolution.file_name().unwrap_or(UNKNOWN_SOURCE_FILE).to_string();
        let access = Entry::new(
            ir_access_size,
            isa_access_size,
            message.direction,
            resolution.mnemonic().unwrap_or_default(),
            usage,
        );
        self.global_accesses
            .record(&file_name, message.line, message.column, access);

        if resolution.file_name().is_some() {
            self.file_names.insert(message.file_name_hash, file_name);
        }
        Ok(())
    }

    fn analyze_bank_conflicts(&mut self, message: &AccessMessage) -> Result<(), Rejection> {
        let access_size = message.access_size;
        let bank_conflicts = self
            .conflict_sets
            .bank_conflicts(access_size, &message.lanes)?;

        log::debug!(
            "line {}: LDS {} of {} bytes/lane, {} bank conflicts, execution mask = {}",
            message.line,
            message.direction,
            access_size,
            bank_conflicts,
            message.exec,
        );

        let file_name = self
            .file_names
            .get(&message.file_name_hash)
            .map_or(UNKNOWN_SOURCE_FILE, String::as_str)
            .to_string();
        // the instruction database has no entries for LDS instructions
        let access = Entry::new(
            access_size,
            0,
            message.direction,
            "",
            BankConflicts(bank_conflicts as u64),
        );
        self.lds_accesses
            .record(&file_name, message.line, message.column, access);
        Ok(())
    }

    fn log_excess_cache_lines(
        &self,
        message: &AccessMessage,
        access_size: u16,
        line_size: u32,
        usage: &Usage,
    ) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        const PER_ROW: usize = 4;
        let lanes = message
            .lanes
            .iter()
            .map(|access| format!("{:2}: {:#x}", access.lane, access.address))
            .chunks(PER_ROW)
            .into_iter()
            .map(|mut row| row.join("   "))
            .join("\n\t");
        let addrs: Vec<u64> = message.addresses().collect();
        let lines = cache_lines::cache_lines_used(addrs, access_size, line_size)
            .into_iter()
            .enumerate()
            .map(|(i, line)| format!("{:2}: {:#x}", i, line * u64::from(line_size)))
            .chunks(PER_ROW)
            .into_iter()
            .map(|mut row| row.join("   "))
            .join("\n\t");
        log::debug!(
            "line {}: global memory access by {} lanes:\n\
            \t{} of {} bytes/lane, minimum L2 cache lines required {}, cache lines used {} ({} excess)\n\
            \texecution mask = {}\n\
            \tAddresses accessed (lane: address)\n\t{}\n\
            \tCache line size = {:#x}. Lowest addresses on cache lines used:\n\t{}",
            message.line,
            message.num_active(),
            message.direction,
            access_size,
            usage.needed,
            usage.used,
            usage.excess(),
            message.exec,
            lanes,
            line_size,
            lines,
        );
    }

    fn summary(&self, kernels_found: Option<usize>) -> report::Summary<'_> {
        report::Summary {
            kernel: &self.kernel,
            verbose: self.verbose,
            arch: self.arch,
            global_accesses: &self.global_accesses,
            lds_accesses: &self.lds_accesses,
            kernels_found,
        }
    }

    /// Write the cache line use and bank conflict reports.
    pub fn report(&mut self) -> Result<(), report::Error> {
        let mut reporter = std::mem::take(&mut self.reporter);
        let result = reporter.report(&self.summary(None));
        self.reporter = reporter;
        result
    }

    /// Write the reports, including the number of kernels in `db`.
    pub fn report_with(
        &mut self,
        kernel: &str,
        db: &dyn SymbolDatabase,
    ) -> Result<(), report::Error> {
        let kernels = db.kernels();
        log::debug!(
            "reporting kernel {:?} ({} kernels in database)",
            kernel,
            kernels.len()
        );
        let mut reporter = std::mem::take(&mut self.reporter);
        let result = reporter.report(&self.summary(Some(kernels.len())));
        self.reporter = reporter;
        result
    }

    /// Render the reports in `format` instead of writing them to the configured destination.
    pub fn render(&self, format: report::Format) -> Result<String, report::Error> {
        let mut reporter = Reporter::new(report::Destination::Console, format);
        reporter.render(&self.summary(None))
    }

    /// Reset all accumulated statistics, e.g. between kernel dispatches.
    pub fn clear(&mut self) {
        self.global_accesses.clear();
        self.lds_accesses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Handler, KernelId};
    use crate::arch::Architecture;
    use crate::aggregate::BankConflicts;
    use crate::cache_lines::Usage;
    use crate::symbols::{file_name_hash, tests as db, UNKNOWN_SOURCE_FILE};
    use similar_asserts as diff;
    use trace_model::{AccessMessage, Direction, ExecMask, MemorySpace};

    const GFX90A: u8 = 3;

    fn handler() -> Handler {
        crate::testing::init_logging();
        Handler::new(
            KernelId {
                name: db::KERNEL.to_string(),
                dispatch_id: 1,
            },
            false,
        )
    }

    fn access(space: MemorySpace, access_size: u16, addrs: Vec<u64>) -> AccessMessage {
        let exec = if addrs.len() == 64 {
            u64::MAX
        } else {
            (1_u64 << addrs.len()) - 1
        };
        AccessMessage::new(
            Some(space),
            Direction::Read,
            access_size,
            ExecMask::from(exec),
            addrs,
        )
        .unwrap()
        .with_location(file_name_hash(db::FILE), 10, 12)
        .with_arch(GFX90A)
    }

    #[test]
    fn test_other_memory_spaces_are_not_handled() {
        let mut handler = handler();
        for space in [
            MemorySpace::Flat,
            MemorySpace::Gds,
            MemorySpace::Constant,
            MemorySpace::Scratch,
            MemorySpace::Undefined,
        ] {
            assert!(!handler.handle(&access(space, 4, vec![0])));
        }
        let mut unknown = access(MemorySpace::Global, 4, vec![0]);
        unknown.memory_space = None;
        assert!(!handler.handle(&unknown));
        assert!(handler.global_accesses().is_empty());
        assert!(handler.lds_accesses().is_empty());
    }

    #[test]
    fn test_unsupported_hardware_is_skipped() {
        let mut handler = handler();
        let message = access(MemorySpace::Global, 4, vec![0]).with_arch(0);
        assert!(!handler.handle(&message));
        assert!(handler.global_accesses().is_empty());
    }

    #[test]
    fn test_dense_global_access() {
        let mut handler = handler();
        let message = access(MemorySpace::Global, 4, (0..64).map(|lane| lane * 4).collect());
        assert!(handler.handle(&message));
        let entries: Vec<_> = handler.global_accesses().iter().collect();
        diff::assert_eq!(have: entries.len(), want: 1);
        let (location, entry) = entries[0];
        diff::assert_eq!(have: location.file, want: UNKNOWN_SOURCE_FILE);
        diff::assert_eq!(have: entry.metric, want: Usage { needed: 2, used: 2 });
        diff::assert_eq!(have: entry.isa_access_size, want: 0);
        diff::assert_eq!(have: handler.global_accesses().reportable(false).count(), want: 0);
    }

    #[test]
    fn test_repeated_access_is_accumulated() {
        let mut handler = handler();
        let message = access(MemorySpace::Global, 4, (0..16).map(|lane| lane * 256).collect());
        assert!(handler.handle(&message));
        assert!(handler.handle(&message));
        let (_, entry) = handler.global_accesses().iter().next().unwrap();
        diff::assert_eq!(have: entry.count, want: 2);
        diff::assert_eq!(have: entry.metric, want: Usage { needed: 2, used: 32 });
    }

    #[test]
    fn test_ambiguous_symbol_is_dropped() {
        let mut handler = handler();
        let symbols = db::database(vec![db::instruction("global_load_dwordx4", 13, 12)]);
        let message = access(MemorySpace::Global, 4, vec![0, 4096]);
        assert!(handler.handle_with(&message, db::KERNEL, &symbols));
        assert!(handler.global_accesses().is_empty());
    }

    #[test]
    fn test_fused_access_one_line_over_is_dropped() {
        let mut handler = handler();
        let symbols = db::database(vec![db::instruction("global_load_dwordx4", 10, 12)]);
        // 16 lanes of 16 bytes starting mid-line touch 3 lines instead of 2
        let message = access(MemorySpace::Global, 4, (0..16).map(|lane| 64 + lane * 16).collect());
        assert!(handler.handle_with(&message, db::KERNEL, &symbols));
        assert!(handler.global_accesses().is_empty());
    }

    #[test]
    fn test_corrected_access_size_is_recorded() {
        let mut handler = handler();
        let symbols = db::database(vec![db::instruction("global_load_dwordx4", 10, 12)]);
        let message = access(MemorySpace::Global, 4, (0..8).map(|lane| lane * 1024).collect());
        assert!(handler.handle_with(&message, db::KERNEL, &symbols));

        let (location, entry) = handler.global_accesses().iter().next().unwrap();
        diff::assert_eq!(have: location.file, want: db::FILE);
        diff::assert_eq!(have: (entry.ir_access_size, entry.isa_access_size), want: (4, 16));
        diff::assert_eq!(have: entry.isa_instruction.as_str(), want: "global_load_dwordx4");
        diff::assert_eq!(have: entry.metric, want: Usage { needed: 1, used: 8 });
    }

    #[test]
    fn test_lds_reuses_file_name_of_global_accesses() {
        let mut handler = handler();
        let lds = access(MemorySpace::Shared, 4, vec![0, 128]);
        assert!(handler.handle(&lds));

        let symbols = db::database(vec![db::instruction("global_load_dword", 10, 12)]);
        let global = access(MemorySpace::Global, 4, vec![0, 4]);
        assert!(handler.handle_with(&global, db::KERNEL, &symbols));
        assert!(handler.handle(&lds));

        let files: Vec<_> = handler
            .lds_accesses()
            .iter()
            .map(|(location, entry)| (location.file.to_string(), entry.metric))
            .collect();
        diff::assert_eq!(
            have: files,
            want: vec![
                (db::FILE.to_string(), BankConflicts(1)),
                (UNKNOWN_SOURCE_FILE.to_string(), BankConflicts(1)),
            ],
        );
    }

    #[test]
    fn test_unsupported_lds_width_is_rejected() {
        let mut handler = handler();
        assert!(!handler.handle(&access(MemorySpace::Shared, 12, vec![0, 12])));
        assert!(handler.lds_accesses().is_empty());
    }

    #[test]
    fn test_architecture_of_messages_takes_precedence() {
        let mut handler = handler().with_architecture(Architecture::Gfx906);
        diff::assert_eq!(have: handler.architecture(), want: Some(Architecture::Gfx906));
        assert!(!handler.handle(&access(MemorySpace::Global, 4, vec![0]).with_arch(0)));
        diff::assert_eq!(have: handler.architecture(), want: Some(Architecture::Gfx906));
        assert!(handler.handle(&access(MemorySpace::Global, 4, vec![0])));
        diff::assert_eq!(have: handler.architecture(), want: Some(Architecture::Gfx90a));
    }

    #[test]
    fn test_clear_resets_statistics() {
        let mut handler = handler();
        assert!(handler.handle(&access(MemorySpace::Shared, 4, vec![0])));
        assert!(handler.handle(&access(MemorySpace::Global, 4, vec![0])));
        handler.clear();
        assert!(handler.global_accesses().is_empty());
        assert!(handler.lds_accesses().is_empty());
    }
}
