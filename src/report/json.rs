//! Structured report.
//!
//! A report file holds a single document. Every dispatch reported to the same
//! file appends its kernel analysis to the document.
use super::{source::SourceCache, Error, Summary};
use crate::{aggregate::Location, arch};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const VERSION_FILE: &str = "VERSION";
pub const UNKNOWN_ARCHITECTURE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub kernel_analyses: Vec<KernelAnalysis>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAnalysis {
    pub kernel_info: KernelInfo,
    pub cache_analysis: Accesses<CacheLineAccessInfo>,
    pub bank_conflicts: Accesses<BankConflictAccessInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub name: String,
    pub dispatch_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accesses<T> {
    pub accesses: Vec<Access<T>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access<T> {
    pub source_location: SourceLocation,
    pub code_context: String,
    pub access_info: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl From<Location<'_>> for SourceLocation {
    fn from(location: Location<'_>) -> Self {
        Self {
            file: location.file.to_string(),
            line: location.line,
            column: location.column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLineAccessInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub execution_count: u64,
    pub ir_bytes: u16,
    pub isa_bytes: u16,
    pub isa_instruction: String,
    pub cache_lines: CacheLines,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLines {
    pub needed: u64,
    pub used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankConflictAccessInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub execution_count: u64,
    pub ir_bytes: u16,
    pub total_conflicts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: Option<String>,
    pub timestamp: String,
    pub gpu_info: GpuInfo,
    #[serde(default)]
    pub kernels_found: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub architecture: String,
    pub cache_line_size: u32,
}

/// First line of the `VERSION` file in `dir`, without surrounding whitespace.
#[must_use]
pub fn read_version(dir: impl AsRef<Path>) -> Option<String> {
    let path = dir.as_ref().join(VERSION_FILE);
    let content = std::fs::read_to_string(path).ok()?;
    let version = content.lines().next()?.trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

impl Metadata {
    #[must_use]
    pub fn new(summary: &Summary<'_>, version: Option<String>) -> Self {
        let gpu_info = match summary.arch {
            Some(arch) => GpuInfo {
                architecture: arch.name().to_string(),
                cache_line_size: arch.l2_cache_line_size(),
            },
            None => GpuInfo {
                architecture: UNKNOWN_ARCHITECTURE.to_string(),
                cache_line_size: arch::DEFAULT_CACHE_LINE_SIZE,
            },
        };
        Self {
            version,
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            gpu_info,
            kernels_found: summary.kernels_found,
        }
    }
}

impl KernelAnalysis {
    /// Analysis of all recorded accesses, regardless of verbosity.
    pub fn new(summary: &Summary<'_>, sources: &mut SourceCache) -> Self {
        let cache_analysis = summary
            .global_accesses
            .iter()
            .map(|(location, entry)| Access {
                code_context: sources.context(location.file, location.line),
                source_location: location.into(),
                access_info: CacheLineAccessInfo {
                    kind: entry.direction.to_string(),
                    execution_count: entry.count,
                    ir_bytes: entry.ir_access_size,
                    isa_bytes: entry.isa_access_size,
                    isa_instruction: entry.isa_instruction.clone(),
                    cache_lines: CacheLines {
                        needed: entry.metric.needed,
                        used: entry.metric.used,
                    },
                },
            })
            .collect();
        let bank_conflicts = summary
            .lds_accesses
            .iter()
            .map(|(location, entry)| Access {
                code_context: sources.context(location.file, location.line),
                source_location: location.into(),
                access_info: BankConflictAccessInfo {
                    kind: entry.direction.to_string(),
                    execution_count: entry.count,
                    ir_bytes: entry.ir_access_size,
                    total_conflicts: entry.metric.0,
                },
            })
            .collect();
        Self {
            kernel_info: KernelInfo {
                name: summary.kernel.name.clone(),
                dispatch_id: summary.kernel.dispatch_id,
            },
            cache_analysis: Accesses {
                accesses: cache_analysis,
            },
            bank_conflicts: Accesses {
                accesses: bank_conflicts,
            },
        }
    }
}

impl Document {
    #[must_use]
    pub fn new(analysis: KernelAnalysis, metadata: Metadata) -> Self {
        Self {
            kernel_analyses: vec![analysis],
            metadata,
        }
    }

    /// Add the analysis of another dispatch and refresh the metadata.
    ///
    /// A known kernel count is kept if the new metadata has none.
    pub fn append(&mut self, analysis: KernelAnalysis, metadata: Metadata) {
        let kernels_found = metadata.kernels_found.or(self.metadata.kernels_found);
        self.kernel_analyses.push(analysis);
        self.metadata = Metadata {
            kernels_found,
            ..metadata
        };
    }
}

/// Append `analysis` to the document in the report file at `path`.
///
/// A missing or empty file starts a new document. A file whose content is not
/// a report document is replaced. The file is replaced atomically.
pub fn append_to_file(
    path: impl AsRef<Path>,
    analysis: KernelAnalysis,
    metadata: Metadata,
) -> Result<Document, Error> {
    let path = path.as_ref();
    let existing = match std::fs::read(path) {
        Ok(content) if !content.is_empty() => match serde_json::from_slice::<Document>(&content) {
            Ok(document) => Some(document),
            Err(err) => {
                log::warn!(
                    "replacing {} which is not a memory analysis report: {err}",
                    path.display()
                );
                None
            }
        },
        Ok(_) => None,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(source) => {
            return Err(Error::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let document = match existing {
        Some(mut document) => {
            document.append(analysis, metadata);
            document
        }
        None => Document::new(analysis, metadata),
    };

    let mut content = serde_json::to_vec_pretty(&document)?;
    content.push(b'\n');
    utils::fs::replace_atomically(path, &content)?;
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::{
        append_to_file, read_version, Document, KernelAnalysis, Metadata, TIMESTAMP_FORMAT,
    };
    use crate::aggregate::{BankConflicts, Entry, Store};
    use crate::arch::Architecture;
    use crate::cache_lines::Usage;
    use crate::handler::KernelId;
    use crate::report::{source::SourceCache, Summary};
    use similar_asserts as diff;
    use trace_model::Direction;

    struct Fixture {
        kernel: KernelId,
        global: Store<Usage>,
        lds: Store<BankConflicts>,
    }

    impl Fixture {
        fn new(dispatch_id: u64) -> Self {
            let mut global = Store::new();
            global.record("a.hip", 4, 2, Entry::new(4, 16, Direction::Read, "global_load_dwordx4", Usage { needed: 1, used: 1 }));
            let mut lds = Store::new();
            lds.record("a.hip", 9, 7, Entry::new(8, 0, Direction::ReadWrite, "", BankConflicts(3)));
            Self {
                kernel: KernelId {
                    name: "reduce".to_string(),
                    dispatch_id,
                },
                global,
                lds,
            }
        }

        fn summary(&self, kernels_found: Option<usize>) -> Summary<'_> {
            Summary {
                kernel: &self.kernel,
                verbose: false,
                arch: Architecture::from_id(3),
                global_accesses: &self.global,
                lds_accesses: &self.lds,
                kernels_found,
            }
        }
    }

    #[test]
    fn test_document_schema() {
        crate::testing::init_logging();
        let fixture = Fixture::new(1);
        let summary = fixture.summary(Some(2));
        let analysis = KernelAnalysis::new(&summary, &mut SourceCache::new());
        let mut metadata = Metadata::new(&summary, None);
        metadata.timestamp = "2024-01-01 00:00:00".to_string();

        let have = serde_json::to_value(Document::new(analysis, metadata)).unwrap();
        let want = serde_json::json!({
            "kernel_analyses": [{
                "kernel_info": { "name": "reduce", "dispatch_id": 1 },
                "cache_analysis": { "accesses": [{
                    "source_location": { "file": "a.hip", "line": 4, "column": 2 },
                    "code_context": "",
                    "access_info": {
                        "type": "read",
                        "execution_count": 1,
                        "ir_bytes": 4,
                        "isa_bytes": 16,
                        "isa_instruction": "global_load_dwordx4",
                        "cache_lines": { "needed": 1, "used": 1 },
                    },
                }]},
                "bank_conflicts": { "accesses": [{
                    "source_location": { "file": "a.hip", "line": 9, "column": 7 },
                    "code_context": "",
                    "access_info": {
                        "type": "read/write",
                        "execution_count": 1,
                        "ir_bytes": 8,
                        "total_conflicts": 3,
                    },
                }]},
            }],
            "metadata": {
                "version": null,
                "timestamp": "2024-01-01 00:00:00",
                "gpu_info": { "architecture": "gfx90a", "cache_line_size": 128 },
                "kernels_found": 2,
            },
        });
        diff::assert_eq!(have: have, want: want);
    }

    #[test]
    fn test_unknown_architecture_metadata() {
        let fixture = Fixture::new(1);
        let mut summary = fixture.summary(None);
        summary.arch = None;
        let metadata = Metadata::new(&summary, Some("1.2.0".to_string()));
        diff::assert_eq!(have: metadata.gpu_info.architecture, want: "unknown");
        diff::assert_eq!(have: metadata.gpu_info.cache_line_size, want: 128);
        diff::assert_eq!(have: metadata.version, want: Some("1.2.0".to_string()));
        assert!(chrono::NaiveDateTime::parse_from_str(&metadata.timestamp, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_append_dispatches_to_file() {
        crate::testing::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        for dispatch_id in 1..=3 {
            let fixture = Fixture::new(dispatch_id);
            let kernels_found = (dispatch_id == 1).then_some(4);
            let summary = fixture.summary(kernels_found);
            let analysis = KernelAnalysis::new(&summary, &mut SourceCache::new());
            append_to_file(&path, analysis, Metadata::new(&summary, None)).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let document: Document = serde_json::from_str(&content).unwrap();
        let dispatch_ids: Vec<_> = document
            .kernel_analyses
            .iter()
            .map(|analysis| analysis.kernel_info.dispatch_id)
            .collect();
        diff::assert_eq!(have: dispatch_ids, want: vec![1, 2, 3]);
        diff::assert_eq!(have: document.metadata.kernels_found, want: Some(4));
    }

    #[test]
    fn test_append_replaces_foreign_content() {
        crate::testing::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        std::fs::write(&path, "not json").unwrap();

        let fixture = Fixture::new(7);
        let summary = fixture.summary(None);
        let analysis = KernelAnalysis::new(&summary, &mut SourceCache::new());
        let document = append_to_file(&path, analysis, Metadata::new(&summary, None)).unwrap();
        diff::assert_eq!(have: document.kernel_analyses.len(), want: 1);
    }

    #[test]
    fn test_read_version() {
        let dir = tempfile::tempdir().unwrap();
        diff::assert_eq!(have: read_version(dir.path()), want: None);
        std::fs::write(dir.path().join("VERSION"), "  0.3.1 \nignored\n").unwrap();
        diff::assert_eq!(have: read_version(dir.path()), want: Some("0.3.1".to_string()));
        std::fs::write(dir.path().join("VERSION"), "\n").unwrap();
        diff::assert_eq!(have: read_version(dir.path()), want: None);
    }
}
