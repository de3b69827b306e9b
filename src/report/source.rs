use std::io::BufRead;
use std::path::{Path, PathBuf};

const TAB_WIDTH: usize = 8;

/// Lines of the most recently read source file.
///
/// Reports are ordered by file, so a single slot avoids re-reading the file
/// for every location in it.
#[derive(Debug, Default)]
pub struct SourceCache {
    path: Option<PathBuf>,
    lines: Vec<String>,
}

impl SourceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&mut self, path: &Path) {
        if self.path.as_deref() == Some(path) {
            return;
        }
        self.lines = match utils::fs::open_readable(path) {
            Ok(reader) => match reader.lines().collect::<Result<Vec<_>, _>>() {
                Ok(lines) => lines,
                Err(err) => {
                    log::warn!("failed to read {}: {err}", path.display());
                    Vec::new()
                }
            },
            Err(err) => {
                log::warn!("{err}");
                Vec::new()
            }
        };
        self.path = Some(path.to_path_buf());
    }

    /// Source line `line` (1-based) of `path`, if it exists.
    pub fn line(&mut self, path: impl AsRef<Path>, line: u32) -> Option<&str> {
        self.load(path.as_ref());
        let idx = usize::try_from(line).ok()?.checked_sub(1)?;
        self.lines.get(idx).map(String::as_str)
    }

    /// The tab expanded source line followed by a line with a caret under `column`.
    ///
    /// Returns `None` if the line cannot be read.
    pub fn excerpt(&mut self, path: impl AsRef<Path>, line: u32, column: u32) -> Option<String> {
        let mut excerpt = expand_tabs(self.line(path, line)?);
        excerpt.push('\n');
        if column > 0 {
            excerpt.push_str(&" ".repeat(column as usize - 1));
            excerpt.push('^');
            excerpt.push('\n');
        }
        Some(excerpt)
    }

    /// The tab expanded source line without surrounding whitespace,
    /// or an empty string if the line cannot be read.
    pub fn context(&mut self, path: impl AsRef<Path>, line: u32) -> String {
        self.line(path, line)
            .map(|source| expand_tabs(source).trim().to_string())
            .unwrap_or_default()
    }
}

#[must_use]
pub fn expand_tabs(line: &str) -> String {
    line.replace('\t', &" ".repeat(TAB_WIDTH))
}

#[cfg(test)]
mod tests {
    use super::{expand_tabs, SourceCache};
    use similar_asserts as diff;
    use std::io::Write;

    fn source_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "__global__ void kernel(float *a) {{").unwrap();
        writeln!(file, "\ta[threadIdx.x] = 0;").unwrap();
        writeln!(file, "}}").unwrap();
        file
    }

    #[test]
    fn test_expand_tabs() {
        diff::assert_eq!(have: expand_tabs("\tx\ty"), want: "        x        y");
    }

    #[test]
    fn test_excerpt_marks_column() {
        let file = source_file();
        let mut cache = SourceCache::new();
        diff::assert_eq!(
            have: cache.excerpt(file.path(), 2, 9),
            want: Some("        a[threadIdx.x] = 0;\n        ^\n".to_string()),
        );
        diff::assert_eq!(have: cache.excerpt(file.path(), 3, 0), want: Some("}\n".to_string()));
    }

    #[test]
    fn test_context_is_trimmed() {
        let file = source_file();
        let mut cache = SourceCache::new();
        diff::assert_eq!(have: cache.context(file.path(), 2), want: "a[threadIdx.x] = 0;");
        diff::assert_eq!(have: cache.context(file.path(), 0), want: "");
        diff::assert_eq!(have: cache.context(file.path(), 4), want: "");
    }

    #[test]
    fn test_missing_file() {
        crate::testing::init_logging();
        let mut cache = SourceCache::new();
        diff::assert_eq!(have: cache.excerpt("/does/not/exist.hip", 1, 1), want: None);
        diff::assert_eq!(have: cache.context("/does/not/exist.hip", 1), want: "");
    }
}
