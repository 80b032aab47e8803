use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Separator between entries of the configured extension list, e.g. `".pdf|.doc"`.
pub const EXTENSION_DELIMITER: char = '|';

/// Extension list value that admits every upload.
pub const WILDCARD: &str = "*";

/// Longest file name (in bytes) accepted for a stored upload.
pub const MAX_FILENAME_LEN: usize = 255;

/// Outcome of running an upload through the admission gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    RejectedExtension { extension: String },
    RejectedSize { size: u64, max_bytes: u64 },
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Extensions an upload may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedExtensions {
    Any,
    /// Lowercase entries in configuration order, duplicates dropped.
    Only(Vec<String>),
}

impl AllowedExtensions {
    /// Parses a `|`-delimited list. Entries are kept verbatim (lowercased).
    pub fn parse(raw: &str) -> Self {
        if raw == WILDCARD {
            return Self::Any;
        }

        let mut entries: Vec<String> = Vec::new();
        for entry in raw.split(EXTENSION_DELIMITER) {
            let entry = entry.to_lowercase();
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        Self::Only(entries)
    }

    pub fn allows(&self, extension: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(entries) => {
                let extension = extension.to_lowercase();
                let bare = extension.strip_prefix('.');
                // A dotless entry ("pdf") also matches the dotted extension
                entries
                    .iter()
                    .any(|e| *e == extension || (!e.starts_with('.') && bare == Some(e.as_str())))
            }
        }
    }
}

impl std::fmt::Display for AllowedExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str(WILDCARD),
            Self::Only(entries) => f.write_str(&entries.join("|")),
        }
    }
}

/// Immutable admission rules, built once at server start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub allowed_extensions: AllowedExtensions,
    pub max_bytes: u64,
}

impl UploadPolicy {
    pub fn new(allowed_extensions: AllowedExtensions, max_bytes: u64) -> Self {
        Self {
            allowed_extensions,
            max_bytes,
        }
    }

    pub fn check_extension(&self, filename: &str) -> Admission {
        let extension = file_extension(filename);
        if self.allowed_extensions.allows(&extension) {
            Admission::Accepted
        } else {
            Admission::RejectedExtension { extension }
        }
    }

    pub fn check_size(&self, declared_size: u64) -> Admission {
        check_size(declared_size, self.max_bytes)
    }

    /// Extension first, then size; the first rejection wins.
    pub fn admit(&self, filename: &str, declared_size: u64) -> Admission {
        match self.check_extension(filename) {
            Admission::Accepted => self.check_size(declared_size),
            rejected => rejected,
        }
    }
}

pub fn check_size(declared_size: u64, max_bytes: u64) -> Admission {
    if declared_size <= max_bytes {
        Admission::Accepted
    } else {
        Admission::RejectedSize {
            size: declared_size,
            max_bytes,
        }
    }
}

/// Lowercased extension of the last path element, including the leading
/// dot. Returns an empty string when there is no dot.
pub fn file_extension(filename: &str) -> String {
    let name = last_component(filename);
    match name.rfind('.') {
        Some(idx) => name[idx..].to_lowercase(),
        None => String::new(),
    }
}

fn last_component(filename: &str) -> &str {
    filename.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(filename)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("filename cannot be empty")]
    EmptyFilename,

    #[error("path '{0}' escapes the save directory")]
    Escape(String),
}

/// Reduces a client supplied name to a single safe path element.
pub fn sanitize_filename(filename: &str) -> Result<String, PathError> {
    let name = last_component(filename);
    if name.is_empty() || name == "." || name == ".." {
        return Err(PathError::EmptyFilename);
    }

    if name.len() != filename.len() {
        tracing::warn!("Directory components stripped from upload filename: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();

    if sanitized.len() <= MAX_FILENAME_LEN {
        return Ok(sanitized);
    }

    // Keep the extension when truncating
    let ext = match sanitized.rfind('.') {
        Some(idx) if sanitized.len() - idx < MAX_FILENAME_LEN / 2 => &sanitized[idx..],
        _ => "",
    };
    let mut end = MAX_FILENAME_LEN - ext.len();
    while !sanitized.is_char_boundary(end) {
        end -= 1;
    }
    Ok(format!("{}{}", &sanitized[..end], ext))
}

/// Normalizes a client supplied subdirectory into a relative path that
/// cannot leave the directory it is joined onto.
pub fn confine_subdir(dir: &str) -> Result<PathBuf, PathError> {
    let mut confined = PathBuf::new();
    for component in Path::new(dir).components() {
        match component {
            Component::Normal(part) => confined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Escape(dir.to_string()));
            }
        }
    }
    Ok(confined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ext: &str, max_bytes: u64) -> UploadPolicy {
        UploadPolicy::new(AllowedExtensions::parse(ext), max_bytes)
    }

    #[test]
    fn test_wildcard_accepts_everything() {
        let policy = policy("*", 10);
        for name in ["a.exe", "noext", ".bashrc", "UPPER.PDF", "dir/x.tar.gz", ""] {
            assert_eq!(policy.check_extension(name), Admission::Accepted, "{}", name);
        }
    }

    #[test]
    fn test_extension_list() {
        let policy = policy(".pdf|.doc", 10);
        assert!(policy.check_extension("report.pdf").is_accepted());
        assert!(policy.check_extension("REPORT.PDF").is_accepted());
        assert!(policy.check_extension("letter.doc").is_accepted());
        assert_eq!(
            policy.check_extension("photo.jpg"),
            Admission::RejectedExtension {
                extension: ".jpg".to_string()
            }
        );
        assert!(!policy.check_extension("noext").is_accepted());
    }

    #[test]
    fn test_dotless_entries() {
        let policy = policy("pdf|doc", 10);
        assert!(policy.check_extension("report.pdf").is_accepted());
        assert!(policy.check_extension("letter.DOC").is_accepted());
        assert!(!policy.check_extension("pdf").is_accepted());
        assert!(!policy.check_extension("report.xpdf").is_accepted());
    }

    #[test]
    fn test_empty_entry_matches_files_without_extension() {
        let policy = policy(".txt|", 10);
        assert!(policy.check_extension("README").is_accepted());
        assert!(!policy.check_extension("a.md").is_accepted());
    }

    #[test]
    fn test_parse_dedups_and_lowercases() {
        assert_eq!(
            AllowedExtensions::parse(".PDF|.pdf|.Doc"),
            AllowedExtensions::Only(vec![".pdf".to_string(), ".doc".to_string()])
        );
        assert_eq!(AllowedExtensions::parse("*"), AllowedExtensions::Any);
        assert_eq!(AllowedExtensions::parse(".pdf|.doc").to_string(), ".pdf|.doc");
    }

    #[test]
    fn test_check_size_boundary() {
        assert!(check_size(0, 1024).is_accepted());
        assert!(check_size(1023, 1024).is_accepted());
        assert!(check_size(1024, 1024).is_accepted());
        assert_eq!(
            check_size(1025, 1024),
            Admission::RejectedSize {
                size: 1025,
                max_bytes: 1024
            }
        );
    }

    #[test]
    fn test_extension_checked_before_size() {
        let policy = policy(".pdf", 10);
        assert!(matches!(
            policy.admit("big.exe", 1_000),
            Admission::RejectedExtension { .. }
        ));
        assert!(matches!(
            policy.admit("big.pdf", 1_000),
            Admission::RejectedSize { .. }
        ));
        assert!(policy.admit("small.pdf", 10).is_accepted());
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("a/b/report.PDF"), ".pdf");
        assert_eq!(file_extension("archive.tar.gz"), ".gz");
        assert_eq!(file_extension(".bashrc"), ".bashrc");
        assert_eq!(file_extension("dir.d/noext"), "");
        assert_eq!(file_extension("C:\\tmp\\x.Doc"), ".doc");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("../../../etc/passwd").unwrap(), "passwd");
        assert_eq!(
            sanitize_filename("..\\..\\windows\\system32").unwrap(),
            "system32"
        );
        assert_eq!(sanitize_filename("测试.txt").unwrap(), "测试.txt");
        assert_eq!(sanitize_filename("a\nb.txt").unwrap(), "a_b.txt");
        assert_eq!(sanitize_filename("..").unwrap_err(), PathError::EmptyFilename);
        assert_eq!(sanitize_filename("dir/").unwrap_err(), PathError::EmptyFilename);

        let long = format!("{}.pdf", "x".repeat(400));
        let sanitized = sanitize_filename(&long).unwrap();
        assert_eq!(sanitized.len(), MAX_FILENAME_LEN);
        assert!(sanitized.ends_with(".pdf"));
    }

    #[test]
    fn test_sanitize_filename_truncates_on_char_boundaries() {
        // U+212A lowercases to a single-byte 'k'
        let kelvin = format!("{}.\u{212A}", "x".repeat(300));
        let sanitized = sanitize_filename(&kelvin).unwrap();
        assert!(sanitized.len() <= MAX_FILENAME_LEN);
        assert!(sanitized.ends_with(".\u{212A}"));

        let wide = format!("{}.数据", "名".repeat(120));
        let sanitized = sanitize_filename(&wide).unwrap();
        assert!(sanitized.len() <= MAX_FILENAME_LEN);
        assert!(sanitized.ends_with(".数据"));
        assert!(sanitized.starts_with('名'));
    }

    #[test]
    fn test_confine_subdir() {
        assert_eq!(confine_subdir("a/b").unwrap(), PathBuf::from("a/b"));
        assert_eq!(confine_subdir("./a/./b/").unwrap(), PathBuf::from("a/b"));
        assert_eq!(confine_subdir("").unwrap(), PathBuf::new());
        assert!(confine_subdir("../x").is_err());
        assert!(confine_subdir("a/../../x").is_err());
        assert!(confine_subdir("/etc").is_err());
    }
}
