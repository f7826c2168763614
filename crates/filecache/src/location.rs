//! Where a computation's store lives on disk
//!
//! Every computation belongs to a [`StoreLocation`], the source file that
//! defines it. All computations of one location share a single store file,
//! named from the location with a fixed suffix:
//!
//! | Location | Registry root | Store file |
//! |----------|---------------|------------|
//! | `src/jobs.rs` (directory exists) | none | `src/.jobs.rs.cache` |
//! | `<string>` (synthetic) | none | `$PWD/._lt_string_gt_.cache` |
//! | anything | `/var/cache/app` | `/var/cache/app/.<escaped location>.cache` |

use std::borrow::Cow;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Suffix appended to every store file name
pub const STORE_SUFFIX: &str = ".cache";

/// The origin of a memoized computation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    /// A source file on disk
    Source(PathBuf),
    /// A location with no meaningful path, such as `<string>` or `<stdin>`
    Synthetic(String),
}

impl StoreLocation {
    /// The source file of the calling code
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        Self::reported(std::panic::Location::caller().file())
    }

    /// A source file location
    #[must_use]
    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self::Source(path.into())
    }

    /// A synthetic location
    #[must_use]
    pub fn synthetic(name: impl Into<String>) -> Self {
        Self::Synthetic(name.into())
    }

    /// Interpret a reported location string
    ///
    /// Strings wrapped in angle brackets (`<string>`, `<stdin>`) are what
    /// dynamically evaluated code reports and are treated as synthetic.
    #[must_use]
    pub fn reported(location: &str) -> Self {
        if location.len() >= 2 && location.starts_with('<') && location.ends_with('>') {
            Self::Synthetic(location.to_string())
        } else {
            Self::Source(PathBuf::from(location))
        }
    }

    /// Whether this location has no meaningful path
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Synthetic(_))
    }

    /// The full location as text
    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Source(path) => path.to_string_lossy(),
            Self::Synthetic(name) => Cow::Borrowed(name),
        }
    }

    /// Resolve the store file for this location
    ///
    /// `root` places every store in one directory; without it a source
    /// location whose directory exists (relative paths resolve against
    /// `cwd`) keeps its store next to the source, and everything else goes
    /// into `cwd`.
    #[must_use]
    pub fn store_path(&self, root: Option<&Path>, cwd: &Path) -> PathBuf {
        if let Some(root) = root {
            return root.join(store_file_name(&self.as_text()));
        }
        match self {
            Self::Source(path) => {
                let absolute = if path.is_absolute() {
                    path.clone()
                } else {
                    cwd.join(path)
                };
                match (absolute.parent(), absolute.file_name()) {
                    (Some(dir), Some(name)) if dir.is_dir() => {
                        dir.join(store_file_name(&name.to_string_lossy()))
                    }
                    _ => cwd.join(store_file_name(&self.as_text())),
                }
            }
            Self::Synthetic(name) => cwd.join(store_file_name(name)),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// `.<escaped name>.cache`
#[must_use]
pub fn store_file_name(name: &str) -> String {
    format!(".{}{STORE_SUFFIX}", escape_segment(name))
}

/// Make `name` safe as a single path segment
///
/// `<` and `>` become `_lt_` and `_gt_`. Path separators, characters
/// reserved on common filesystems, `%` and control characters become
/// `%XX` for each UTF-8 byte.
#[must_use]
pub fn escape_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '<' => out.push_str("_lt_"),
            '>' => out.push_str("_gt_"),
            '/' | '\\' | ':' | '*' | '?' | '"' | '|' | '%' => percent(&mut out, c),
            c if c.is_control() => percent(&mut out, c),
            c => out.push(c),
        }
    }
    out
}

fn percent(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    for byte in c.encode_utf8(&mut buf).bytes() {
        let _ = write!(out, "%{byte:02X}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reported_angle_brackets_are_synthetic() {
        assert!(StoreLocation::reported("<string>").is_synthetic());
        assert!(StoreLocation::reported("<stdin>").is_synthetic());
        assert!(!StoreLocation::reported("src/lib.rs").is_synthetic());
        assert!(!StoreLocation::reported("<").is_synthetic());
    }

    #[test]
    fn caller_reports_this_file() {
        let location = StoreLocation::caller();
        assert!(location.as_text().ends_with("location.rs"));
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_segment("<string>"), "_lt_string_gt_");
        assert_eq!(escape_segment("src/lib.rs"), "src%2Flib.rs");
        assert_eq!(escape_segment("C:\\x"), "C%3A%5Cx");
        assert_eq!(escape_segment("50%"), "50%25");
        assert_eq!(escape_segment("a\nb"), "a%0Ab");
        assert_eq!(escape_segment("plain-name_1.rs"), "plain-name_1.rs");
    }

    #[test]
    fn store_file_names() {
        assert_eq!(store_file_name("jobs.rs"), ".jobs.rs.cache");
        assert_eq!(store_file_name("<stdin>"), "._lt_stdin_gt_.cache");
    }

    #[test]
    fn source_store_sits_next_to_source() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let location = StoreLocation::source("src/jobs.rs");
        assert_eq!(
            location.store_path(None, dir.path()),
            dir.path().join("src/.jobs.rs.cache")
        );
    }

    #[test]
    fn absolute_source_ignores_cwd() {
        let dir = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        let location = StoreLocation::source(dir.path().join("mod.rs"));
        assert_eq!(
            location.store_path(None, cwd.path()),
            dir.path().join(".mod.rs.cache")
        );
    }

    #[test]
    fn missing_source_directory_falls_back_to_cwd() {
        let cwd = TempDir::new().unwrap();
        let location = StoreLocation::source("does/not/exist.rs");
        assert_eq!(
            location.store_path(None, cwd.path()),
            cwd.path().join(".does%2Fnot%2Fexist.rs.cache")
        );
    }

    #[test]
    fn synthetic_store_goes_to_cwd() {
        let cwd = TempDir::new().unwrap();
        let location = StoreLocation::synthetic("<string>");
        assert_eq!(
            location.store_path(None, cwd.path()),
            cwd.path().join("._lt_string_gt_.cache")
        );
    }

    #[test]
    fn root_overrides_placement() {
        let root = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        let location = StoreLocation::source("src/jobs.rs");
        assert_eq!(
            location.store_path(Some(root.path()), cwd.path()),
            root.path().join(".src%2Fjobs.rs.cache")
        );
    }
}
