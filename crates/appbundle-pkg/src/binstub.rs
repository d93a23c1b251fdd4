//! Binstub assembly.
//!
//! A binstub is laid out as:
//! ```text
//! #!<ruby> --disable-gems
//! #--APPBUNDLE_BINSTUB_FORMAT_VERSION=1--
//! <activation script>
//!   gem "<app>", "= <version>"
//! <dispatch block>
//! ```
//! The dispatch block finds the executable by basename through the pinned
//! app gem, so the stub keeps working when the installation is moved.

use crate::activate::{pin_statement, ActivationScript};
use crate::lockfile::PackageRecord;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf, Prefix};
use thiserror::Error;

/// Version of the binstub layout written by this crate.
pub const BINSTUB_FORMAT_VERSION: u32 = 1;

const FORMAT_MARKER_PREFIX: &str = "#--APPBUNDLE_BINSTUB_FORMAT_VERSION=";
const FORMAT_MARKER_SUFFIX: &str = "--";

/// Extension of the Windows wrapper written next to each stub.
pub const BATCH_EXT: &str = "bat";

/// Errors that can occur when assembling or writing stubs.
#[derive(Error, Debug)]
pub enum StubError {
    #[error(
        "cannot express '{}' relative to '{}': the paths share no common ancestor",
        .path.display(),
        .base.display()
    )]
    PathResolution { path: PathBuf, base: PathBuf },

    #[error("entry point '{}' has no file name", .path.display())]
    InvalidEntryPoint { path: PathBuf },

    #[error("failed to write '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The shebang line for `ruby`.
#[must_use]
pub fn shebang(ruby: &Path) -> String {
    format!("#!{} --disable-gems\n", ruby.display())
}

/// The comment recording the binstub format version.
#[must_use]
pub fn format_comment() -> String {
    format!("{FORMAT_MARKER_PREFIX}{BINSTUB_FORMAT_VERSION}{FORMAT_MARKER_SUFFIX}\n")
}

/// Header information read back from an existing binstub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinstubHeader {
    /// The format version the stub was written with.
    pub format_version: u32,
}

impl BinstubHeader {
    /// Detect a generated binstub by its format comment.
    ///
    /// Returns `None` for files this crate did not write.
    #[must_use]
    pub fn detect(content: &str) -> Option<Self> {
        content.lines().take(2).find_map(|line| {
            let version = line
                .trim_end()
                .strip_prefix(FORMAT_MARKER_PREFIX)?
                .strip_suffix(FORMAT_MARKER_SUFFIX)?;
            Some(Self {
                format_version: version.parse().ok()?,
            })
        })
    }
}

/// Ruby code that pins the app gem and hands control to `bin_name`.
///
/// Closes the `unless` block opened by the activation script.
#[must_use]
pub fn dispatch_block(app: &PackageRecord, bin_name: &str) -> String {
    let pin = pin_statement(&app.name, &app.version);
    let name = &app.name;
    let version = &app.version;
    format!(
        r#"  {pin}
  gem "bundler" # pick one bundler up front so multiple installed versions stay resolved
  spec = Gem::Specification.find_by_name("{name}", "= {version}")
else
  spec = Gem::Specification.find_by_name("{name}")
end

unless Gem::Specification.unresolved_deps.empty?
  $stderr.puts "APPBUNDLE WARNING: unresolved gem dependencies slow down every activation and must be fixed"
  Gem::Specification.reset
end

bin_file = spec.bin_file("{bin_name}")

Kernel.load(bin_file)
"#
    )
}

/// A generated launcher for one executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binstub {
    /// File name of the stub (the executable's basename).
    pub name: String,
    /// Full stub text.
    pub content: String,
}

impl Binstub {
    /// Assemble the stub for `entry_point`, an executable of `app`.
    ///
    /// Only the basename of `entry_point` is written into the stub.
    ///
    /// # Errors
    ///
    /// Returns [`StubError::InvalidEntryPoint`] if `entry_point` has no
    /// UTF-8 file name.
    pub fn assemble(
        ruby: &Path,
        activation: &ActivationScript,
        app: &PackageRecord,
        entry_point: &Path,
    ) -> Result<Self, StubError> {
        let name = entry_point
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StubError::InvalidEntryPoint {
                path: entry_point.to_path_buf(),
            })?
            .to_string();

        let mut content = shebang(ruby);
        content.push_str(&format_comment());
        content.push_str(activation.as_str());
        content.push_str(&dispatch_block(app, &name));

        Ok(Self { name, content })
    }
}

/// The Windows `.bat` wrapper that runs the stub next to it with `ruby`.
///
/// `ruby` is referenced relative to `target_bin_dir` so the install prefix
/// can change.
///
/// # Errors
///
/// Returns [`StubError::PathResolution`] if no relative path exists.
pub fn batch_wrapper(ruby: &Path, target_bin_dir: &Path) -> Result<String, StubError> {
    let relative = relative_path(ruby, target_bin_dir)?;
    let windows = relative.to_string_lossy().replace('/', "\\");
    Ok(format!("@ECHO OFF\n\"%~dp0\\{windows}\" \"%~dpn0\" %*\n"))
}

/// True if `content` is a wrapper written by [`batch_wrapper`].
#[must_use]
pub fn is_batch_wrapper(content: &str) -> bool {
    let mut lines = content.lines();
    lines.next().map(str::trim_end) == Some("@ECHO OFF")
        && lines.next().is_some_and(|line| {
            let line = line.trim_end();
            line.starts_with("\"%~dp0\\") && line.ends_with("\" \"%~dpn0\" %*")
        })
        && lines.all(|line| line.trim().is_empty())
}

/// Lexical path of `path` relative to the directory `base`.
///
/// Both paths are normalized first (`.` dropped, `..` folded). Drive
/// letters are recognized even when the host is not Windows.
///
/// # Errors
///
/// Returns [`StubError::PathResolution`] when the paths have different
/// anchors (absolute vs. relative, different drives) or when `base` climbs
/// above the shared part.
pub fn relative_path(path: &Path, base: &Path) -> Result<PathBuf, StubError> {
    let error = || StubError::PathResolution {
        path: path.to_path_buf(),
        base: base.to_path_buf(),
    };

    let (path_anchor, path_parts) = normalize(path);
    let (base_anchor, base_parts) = normalize(base);
    if path_anchor != base_anchor {
        return Err(error());
    }

    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let climbs = &base_parts[common..];
    if climbs.iter().any(|part| part == "..") {
        return Err(error());
    }

    let mut relative = PathBuf::new();
    for _ in climbs {
        relative.push("..");
    }
    for part in &path_parts[common..] {
        relative.push(part);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    Ok(relative)
}

/// Split a path into its anchor (`""`, `"/"`, `"C:/"`, ...) and cleaned parts.
fn normalize(path: &Path) -> (String, Vec<OsString>) {
    let mut anchor = String::new();
    let mut parts: Vec<OsString> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => {
                anchor = match prefix.kind() {
                    // `\\?\C:` and `C:` name the same drive.
                    Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                        format!("{}:", char::from(letter).to_ascii_uppercase())
                    }
                    _ => prefix.as_os_str().to_string_lossy().to_uppercase(),
                };
            }
            Component::RootDir => anchor.push('/'),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.last().is_some_and(|p| p != "..") {
                    parts.pop();
                } else if anchor.is_empty() {
                    parts.push("..".into());
                }
            }
            Component::Normal(part) => {
                if anchor.is_empty() && parts.is_empty() && is_drive(part) {
                    anchor = format!("{}/", part.to_string_lossy().to_uppercase());
                } else {
                    parts.push(part.to_os_string());
                }
            }
        }
    }

    (anchor, parts)
}

fn is_drive(part: &std::ffi::OsStr) -> bool {
    let bytes = part.as_encoded_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
