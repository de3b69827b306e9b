pub mod json;
pub mod source;
pub mod text;

use crate::{
    aggregate::{BankConflicts, Store},
    arch::Architecture,
    cache_lines::Usage,
    handler::KernelId,
};
use once_cell::sync::Lazy;
use std::io::Write;
use std::path::PathBuf;

/// Serializes writes of all reporters to shared report files.
static REPORT_FILE_LOCK: Lazy<parking_lot::Mutex<()>> = Lazy::new(|| parking_lot::Mutex::new(()));

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to access report file {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write report")]
    Console(#[source] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Fs(#[from] utils::fs::Error),
}

/// Everything a report is rendered from.
#[derive(Debug, Clone, Copy)]
pub struct Summary<'a> {
    pub kernel: &'a KernelId,
    pub verbose: bool,
    /// Architecture of the analyzed messages, if known.
    pub arch: Option<Architecture>,
    pub global_accesses: &'a Store<Usage>,
    pub lds_accesses: &'a Store<BankConflicts>,
    /// Number of kernels in the symbol database, if one was given.
    pub kernels_found: Option<usize>,
}

#[derive(
    strum::EnumString,
    strum::Display,
    strum::AsRefStr,
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
)]
#[strum(serialize_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Json,
}

/// Where reports are written to.
#[derive(Debug, Default, Clone, Hash, PartialEq, Eq)]
pub enum Destination {
    #[default]
    Console,
    /// Text reports are appended, structured reports merged into the file's document.
    File(PathBuf),
}

impl std::str::FromStr for Destination {
    type Err = std::convert::Infallible;

    fn from_str(location: &str) -> Result<Self, Self::Err> {
        match location.trim() {
            "" | "console" => Ok(Self::Console),
            path => Ok(Self::File(utils::normalize_path(path))),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Console => write!(f, "console"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Reporter {
    pub destination: Destination,
    pub format: Format,
    sources: source::SourceCache,
}

impl Reporter {
    #[must_use]
    pub fn new(destination: Destination, format: Format) -> Self {
        Self {
            destination,
            format,
            sources: source::SourceCache::new(),
        }
    }

    fn document(&mut self, summary: &Summary<'_>) -> (json::KernelAnalysis, json::Metadata) {
        let analysis = json::KernelAnalysis::new(summary, &mut self.sources);
        let metadata = json::Metadata::new(summary, json::read_version("."));
        (analysis, metadata)
    }

    /// Render the report for `summary` as a string.
    pub fn render(&mut self, summary: &Summary<'_>) -> Result<String, Error> {
        match self.format {
            Format::Text => {
                let mut out = Vec::new();
                text::write(&mut out, &mut self.sources, summary).map_err(Error::Console)?;
                Ok(String::from_utf8_lossy(&out).into_owned())
            }
            Format::Json => {
                let (analysis, metadata) = self.document(summary);
                let document = json::Document::new(analysis, metadata);
                let mut rendered = serde_json::to_string_pretty(&document)?;
                rendered.push('\n');
                Ok(rendered)
            }
        }
    }

    /// Write the report for `summary` to the destination.
    pub fn report(&mut self, summary: &Summary<'_>) -> Result<(), Error> {
        match self.destination.clone() {
            Destination::Console => {
                let rendered = self.render(summary)?;
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(rendered.as_bytes())
                    .and_then(|()| stdout.flush())
                    .map_err(Error::Console)
            }
            Destination::File(path) => {
                if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                    utils::fs::create_dirs(dir)?;
                }
                match self.format {
                    Format::Text => {
                        let rendered = self.render(summary)?;
                        let _guard = REPORT_FILE_LOCK.lock();
                        let mut writer = utils::fs::open_appendable(&path)?;
                        writer
                            .write_all(rendered.as_bytes())
                            .and_then(|()| writer.flush())
                            .map_err(|source| Error::Io {
                                path: path.clone(),
                                source,
                            })
                    }
                    Format::Json => {
                        let (analysis, metadata) = self.document(summary);
                        let _guard = REPORT_FILE_LOCK.lock();
                        let document = json::append_to_file(&path, analysis, metadata)?;
                        log::debug!(
                            "{} contains {} kernel analyses",
                            path.display(),
                            document.kernel_analyses.len()
                        );
                        Ok(())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Destination, Format};
    use similar_asserts as diff;
    use std::path::PathBuf;

    #[test]
    fn test_parse_destination() {
        diff::assert_eq!(have: "console".parse::<Destination>().unwrap(), want: Destination::Console);
        diff::assert_eq!(have: "".parse::<Destination>().unwrap(), want: Destination::Console);
        diff::assert_eq!(
            have: "/tmp/report.log".parse::<Destination>().unwrap(),
            want: Destination::File(PathBuf::from("/tmp/report.log")),
        );
        diff::assert_eq!(
            have: "out/./logs/../report.json".parse::<Destination>().unwrap(),
            want: Destination::File(PathBuf::from("out/report.json")),
        );
    }

    #[test]
    fn test_parse_format() {
        diff::assert_eq!(have: "json".parse::<Format>().unwrap(), want: Format::Json);
        diff::assert_eq!(have: "text".parse::<Format>().unwrap(), want: Format::Text);
        assert!("yaml".parse::<Format>().is_err());
        diff::assert_eq!(have: Format::default().to_string(), want: "text");
    }
}
