//! Correlation of instrumented source locations with compiled instructions.
//!
//! The instrumentation sees accesses at the IR level. The optimizer may fuse
//! several narrow accesses into one wide ISA instruction, so the access size
//! recorded by the instrumentation is not necessarily the size of the
//! instruction that executed. The instruction database of the compiled kernel
//! resolves a source location to its ISA instruction and hence its true width.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trace_model::{AccessMessage, Direction};

/// File name used for accesses whose source file could not be resolved.
pub const UNKNOWN_SOURCE_FILE: &str = "<unknown source file>";

/// Access size and direction of known ISA memory instructions.
pub static INSTRUCTION_WIDTHS: phf::Map<&'static str, (u16, Direction)> = phf::phf_map! {
    "global_load_dword" => (4, Direction::Read),
    "global_load_dwordx2" => (8, Direction::Read),
    "global_load_dwordx3" => (12, Direction::Read),
    "global_load_dwordx4" => (16, Direction::Read),
    "global_store_dword" => (4, Direction::Write),
    "global_store_dwordx2" => (8, Direction::Write),
    "global_store_dwordx3" => (12, Direction::Write),
    "global_store_dwordx4" => (16, Direction::Write),
};

/// Hash of a source file name, as computed by the instrumentation (64-bit FNV-1a).
#[must_use]
pub fn file_name_hash(file_name: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    file_name.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

/// An ISA instruction with its debug line information.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub mnemonic: String,
    /// Index into the file table of the kernel.
    pub path_id: usize,
    pub line: u32,
    pub column: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("unknown kernel {kernel:?}")]
    UnknownKernel { kernel: String },

    #[error("no instructions for line {line} of kernel {kernel:?}")]
    NoInstructions { kernel: String, line: u32 },
}

/// Instruction database of the compiled kernels.
pub trait SymbolDatabase {
    /// Names of all kernels in the database.
    fn kernels(&self) -> Vec<String>;

    /// Instructions generated for a source line of a kernel.
    fn instructions_for_line(&self, kernel: &str, line: u32)
        -> Result<Vec<Instruction>, LookupError>;

    /// Source file name for a path id of a kernel.
    fn file_name(&self, kernel: &str, path_id: usize) -> Option<String>;
}

/// ISA instruction resolved for a source location.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Correlation {
    pub file_name: String,
    pub mnemonic: String,
    pub access_size: u16,
}

/// Outcome of correlating an access with the instruction database.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Resolution {
    /// No instruction exists for the source line, or the source file of a
    /// candidate instruction cannot be resolved.
    ///
    /// This is expected when accesses on adjacent lines were fused into a
    /// single instruction attributed to another line. The access is dropped.
    Ambiguous,
    /// Either no database is bound, or no candidate with a known access size matched.
    /// The instrumentation access size is used as is.
    Unknown,
    Resolved(Correlation),
}

impl Resolution {
    #[must_use]
    pub fn access_size(&self) -> u16 {
        match self {
            Self::Resolved(correlation) => correlation.access_size,
            Self::Ambiguous | Self::Unknown => 0,
        }
    }

    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::Resolved(correlation) => Some(&correlation.file_name),
            Self::Ambiguous | Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn mnemonic(&self) -> Option<&str> {
        match self {
            Self::Resolved(correlation) => Some(&correlation.mnemonic),
            Self::Ambiguous | Self::Unknown => None,
        }
    }
}

/// A symbol database bound to the kernel whose messages are being handled.
#[derive(Clone, Copy)]
pub struct Binding<'a> {
    pub kernel: &'a str,
    pub db: &'a dyn SymbolDatabase,
}

impl<'a> std::fmt::Debug for Binding<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Binding").field("kernel", &self.kernel).finish()
    }
}

/// Resolve the ISA instruction of an access.
///
/// The first instruction on the source line whose file, line and column
/// match the access and whose mnemonic is a known memory instruction of the
/// same direction determines the access size. A candidate without a
/// resolvable source file makes the access ambiguous.
#[must_use]
pub fn correlate(binding: Option<Binding<'_>>, message: &AccessMessage) -> Resolution {
    let Some(Binding { kernel, db }) = binding else {
        return Resolution::Unknown;
    };
    log::trace!(
        "correlating file hash {:#x} line {} column {}",
        message.file_name_hash,
        message.line,
        message.column
    );
    let instructions = match db.instructions_for_line(kernel, message.line) {
        Ok(instructions) => instructions,
        Err(err) => {
            log::trace!("{err}");
            return Resolution::Ambiguous;
        }
    };

    for instruction in instructions {
        log::trace!("checking {}", instruction.mnemonic);
        let Some(file_name) = db.file_name(kernel, instruction.path_id) else {
            log::trace!("no file name for path id {}", instruction.path_id);
            return Resolution::Ambiguous;
        };
        let same_location = file_name_hash(&file_name) == message.file_name_hash
            && instruction.line == message.line
            && instruction.column == message.column;
        if !same_location {
            continue;
        }
        log::trace!(
            "source location {}:{}:{}",
            file_name,
            instruction.line,
            instruction.column
        );
        match INSTRUCTION_WIDTHS.get(instruction.mnemonic.as_str()) {
            Some(&(access_size, direction)) if direction == message.direction => {
                return Resolution::Resolved(Correlation {
                    file_name,
                    mnemonic: instruction.mnemonic,
                    access_size,
                });
            }
            _ => {}
        }
    }
    Resolution::Unknown
}

/// Debug information of a single kernel.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSymbols {
    pub files: Vec<String>,
    pub instructions: Vec<Instruction>,
}

/// In-memory instruction database, e.g. loaded from a JSON dump.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDatabase {
    pub kernels: HashMap<String, KernelSymbols>,
}

impl KernelDatabase {
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, serde_json::Error> {
        serde_json::from_reader(reader)
    }

    fn kernel(&self, kernel: &str) -> Result<&KernelSymbols, LookupError> {
        self.kernels
            .get(kernel)
            .ok_or_else(|| LookupError::UnknownKernel {
                kernel: kernel.to_string(),
            })
    }
}

impl SymbolDatabase for KernelDatabase {
    fn kernels(&self) -> Vec<String> {
        let mut kernels: Vec<_> = self.kernels.keys().cloned().collect();
        kernels.sort();
        kernels
    }

    fn instructions_for_line(
        &self,
        kernel: &str,
        line: u32,
    ) -> Result<Vec<Instruction>, LookupError> {
        let instructions: Vec<_> = self
            .kernel(kernel)?
            .instructions
            .iter()
            .filter(|instruction| instruction.line == line)
            .cloned()
            .collect();
        if instructions.is_empty() {
            return Err(LookupError::NoInstructions {
                kernel: kernel.to_string(),
                line,
            });
        }
        Ok(instructions)
    }

    fn file_name(&self, kernel: &str, path_id: usize) -> Option<String> {
        self.kernels.get(kernel)?.files.get(path_id).cloned()
    }
}
