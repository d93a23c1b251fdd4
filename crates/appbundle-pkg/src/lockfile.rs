//! Bundler lockfile (`Gemfile.lock`) parsing.
//!
//! Only what is needed to rebuild the locked dependency graph is modeled:
//! the `GEM`, `PATH` and `GIT` source sections with their specs, plus the
//! `PLATFORMS`, `DEPENDENCIES`, `RUBY VERSION` and `BUNDLED WITH` sections.
//! Anything else (`CHECKSUMS`, `PLUGIN SOURCE`, ...) is skipped.
//!
//! ```text
//! GIT
//!   remote: https://github.com/chef/ohai.git
//!   revision: 0f1b2c3d4e5f
//!   branch: main
//!   specs:
//!     ohai (8.5.1)
//!       ffi (~> 1.9)
//!
//! GEM
//!   remote: https://rubygems.org/
//!   specs:
//!     ffi (1.9.10)
//!     ffi (1.9.10-x86-mingw32)
//! ```

use crate::resolve::{PackageLookup, ResolveError};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// The lockfile filename.
pub const LOCK_FILE: &str = "Gemfile.lock";

/// Errors that can occur when loading a lockfile.
#[derive(Error, Debug)]
pub enum LockfileError {
    #[error("failed to read lockfile '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed lockfile at line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

fn parse_error(line: usize, reason: impl Into<String>) -> LockfileError {
    LockfileError::Parse {
        line,
        reason: reason.into(),
    }
}

/// A git reference (branch, tag, or ref) recorded for a `GIT` source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GitReference {
    /// A branch name.
    Branch(String),
    /// A tag name.
    Tag(String),
    /// An arbitrary ref.
    Ref(String),
    /// Default branch (HEAD).
    DefaultBranch,
}

impl fmt::Display for GitReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(name) | Self::Tag(name) | Self::Ref(name) => f.write_str(name),
            Self::DefaultBranch => f.write_str("HEAD"),
        }
    }
}

/// Where a locked gem comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// A `GEM` section: one or more gem servers.
    Registry { remotes: Vec<String> },
    /// A `PATH` section: a local checkout.
    Path { path: String },
    /// A `GIT` section: a checkout pinned to a revision.
    Git {
        remote: String,
        revision: String,
        reference: GitReference,
    },
}

impl Source {
    /// Returns true if this is a git source.
    #[must_use]
    pub fn is_git(&self) -> bool {
        matches!(self, Self::Git { .. })
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { remotes } if remotes.is_empty() => f.write_str("locally installed gems"),
            Self::Registry { remotes } => write!(f, "rubygems repository {}", remotes.join(", ")),
            Self::Path { path } => write!(f, "source at `{path}`"),
            Self::Git {
                remote,
                revision,
                reference,
            } => {
                let short: String = revision.chars().take(7).collect();
                write!(f, "{remote} (at {reference}@{short})")
            }
        }
    }
}

/// A dependency edge as written in the lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedDependency {
    /// Name of the required gem.
    pub name: String,
    /// Requirement text (e.g. `~> 1.0, >= 1.0.2`), kept for display only.
    pub requirement: Option<String>,
}

impl LockedDependency {
    /// Create a dependency without a requirement.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirement: None,
        }
    }
}

/// One resolved entry from the lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    /// Gem name, unique within one lockfile.
    pub name: String,
    /// Exact locked version, treated as an opaque token.
    pub version: String,
    /// Platform suffix (`x86-mingw32`), if the spec is platform specific.
    pub platform: Option<String>,
    /// Where the gem comes from.
    pub source: Source,
    /// Runtime dependencies, in lockfile order.
    pub dependencies: Vec<LockedDependency>,
}

impl PackageRecord {
    /// Create a record with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            platform: None,
            source,
            dependencies: Vec::new(),
        }
    }

    /// Add a dependency by name.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(LockedDependency::new(name));
        self
    }

    /// Iterate over the declared dependency names.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.name.as_str())
    }

    /// The `name-version[-platform]` form RubyGems uses for directory names.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.platform {
            Some(platform) => format!("{}-{}-{}", self.name, self.version, platform),
            None => format!("{}-{}", self.name, self.version),
        }
    }
}

impl fmt::Display for PackageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.version)
    }
}

/// A parsed `Gemfile.lock`.
#[derive(Debug, Clone, Default)]
pub struct Lockfile {
    specs: Vec<PackageRecord>,
    index: HashMap<String, usize>,
    /// Platforms the bundle was resolved for.
    pub platforms: Vec<String>,
    /// Top-level dependencies requested by the Gemfile.
    pub dependencies: Vec<LockedDependency>,
    /// Ruby version recorded by Bundler, if any.
    pub ruby_version: Option<String>,
    /// Bundler version that wrote the lockfile, if any.
    pub bundled_with: Option<String>,
}

impl Lockfile {
    /// Load a lockfile from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LockfileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| LockfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let lockfile = Self::parse(&content)?;
        debug!(path = %path.display(), specs = lockfile.len(), "parsed lockfile");
        Ok(lockfile)
    }

    /// Build a lockfile from records directly.
    ///
    /// When several records share a name, the first one wins, the same way
    /// multi-platform entries in a real lockfile are treated.
    pub fn from_records(records: impl IntoIterator<Item = PackageRecord>) -> Self {
        let mut lockfile = Self::default();
        for record in records {
            if lockfile.index.contains_key(&record.name) {
                debug!(gem = %record.name, version = %record.version, "ignoring duplicate lockfile entry");
                continue;
            }
            lockfile.index.insert(record.name.clone(), lockfile.specs.len());
            lockfile.specs.push(record);
        }
        lockfile
    }

    /// Parse a lockfile from its text.
    ///
    /// # Errors
    ///
    /// Returns an error if a spec has no version, a dependency line has no
    /// enclosing spec, a source lacks required attributes, or the
    /// indentation does not follow Bundler's layout.
    pub fn parse(content: &str) -> Result<Self, LockfileError> {
        let mut records = Vec::new();
        let mut platforms = Vec::new();
        let mut dependencies = Vec::new();
        let mut ruby_version = None;
        let mut bundled_with = None;

        let mut section = Section::Ignored;
        let mut current: Option<PackageRecord> = None;

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_end();
            if line.is_empty() {
                continue;
            }
            let text = line.trim_start_matches(' ');
            let indent = line.len() - text.len();

            if indent == 0 {
                records.extend(current.take());
                section = Section::from_header(text);
                continue;
            }

            match &mut section {
                Section::Source(block) => match indent {
                    2 if text == "specs:" => block.in_specs = true,
                    2 => {
                        let (key, value) = text.split_once(':').ok_or_else(|| {
                            parse_error(line_no, format!("expected 'key: value', found '{text}'"))
                        })?;
                        block.set(key, value.trim());
                    }
                    4 if block.in_specs => {
                        records.extend(current.take());
                        current = Some(parse_spec(text, block.source(line_no)?, line_no)?);
                    }
                    6 => {
                        let record = current.as_mut().ok_or_else(|| {
                            parse_error(line_no, format!("dependency '{text}' outside of a spec"))
                        })?;
                        record.dependencies.push(parse_dependency(text, line_no)?);
                    }
                    _ => {
                        return Err(parse_error(
                            line_no,
                            format!("unexpected indentation of {indent} spaces"),
                        ))
                    }
                },
                Section::Platforms => platforms.push(text.to_string()),
                Section::Dependencies if indent == 2 => {
                    let text = text.strip_suffix('!').unwrap_or(text);
                    dependencies.push(parse_dependency(text, line_no)?);
                }
                Section::Dependencies => {}
                Section::RubyVersion => ruby_version = Some(text.to_string()),
                Section::BundledWith => bundled_with = Some(text.to_string()),
                Section::Ignored => {}
            }
        }
        records.extend(current.take());

        let mut lockfile = Self::from_records(records);
        lockfile.platforms = platforms;
        lockfile.dependencies = dependencies;
        lockfile.ruby_version = ruby_version;
        lockfile.bundled_with = bundled_with;
        Ok(lockfile)
    }

    /// Get a record by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PackageRecord> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// Iterate over all records in lockfile order.
    pub fn specs(&self) -> impl Iterator<Item = &PackageRecord> {
        self.specs.iter()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns true if the lockfile has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl PackageLookup for Lockfile {
    fn lookup(&self, name: &str) -> Result<&PackageRecord, ResolveError> {
        self.get(name).ok_or_else(|| ResolveError::UnknownPackage {
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Gem,
    Path,
    Git,
}

/// Attributes collected for the source section being parsed.
#[derive(Debug)]
struct SourceBlock {
    kind: SourceKind,
    remotes: Vec<String>,
    revision: Option<String>,
    reference: GitReference,
    in_specs: bool,
}

impl SourceBlock {
    fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            remotes: Vec::new(),
            revision: None,
            reference: GitReference::DefaultBranch,
            in_specs: false,
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        let value = value.to_string();
        match key {
            "remote" => self.remotes.push(value),
            "revision" => self.revision = Some(value),
            "branch" => self.reference = GitReference::Branch(value),
            "tag" => self.reference = GitReference::Tag(value),
            "ref" => self.reference = GitReference::Ref(value),
            // glob, submodules, ...
            _ => {}
        }
    }

    fn source(&self, line: usize) -> Result<Source, LockfileError> {
        match self.kind {
            SourceKind::Gem => Ok(Source::Registry {
                remotes: self.remotes.clone(),
            }),
            SourceKind::Path => {
                let path = self
                    .remotes
                    .first()
                    .ok_or_else(|| parse_error(line, "PATH source without a remote"))?;
                Ok(Source::Path { path: path.clone() })
            }
            SourceKind::Git => {
                let remote = self
                    .remotes
                    .first()
                    .ok_or_else(|| parse_error(line, "GIT source without a remote"))?;
                let revision = self
                    .revision
                    .as_ref()
                    .ok_or_else(|| parse_error(line, "GIT source without a revision"))?;
                Ok(Source::Git {
                    remote: remote.clone(),
                    revision: revision.clone(),
                    reference: self.reference.clone(),
                })
            }
        }
    }
}

#[derive(Debug)]
enum Section {
    Source(SourceBlock),
    Platforms,
    Dependencies,
    RubyVersion,
    BundledWith,
    Ignored,
}

impl Section {
    fn from_header(header: &str) -> Self {
        match header {
            "GEM" => Self::Source(SourceBlock::new(SourceKind::Gem)),
            "PATH" => Self::Source(SourceBlock::new(SourceKind::Path)),
            "GIT" => Self::Source(SourceBlock::new(SourceKind::Git)),
            "PLATFORMS" => Self::Platforms,
            "DEPENDENCIES" => Self::Dependencies,
            "RUBY VERSION" => Self::RubyVersion,
            "BUNDLED WITH" => Self::BundledWith,
            other => {
                debug!(section = other, "skipping lockfile section");
                Self::Ignored
            }
        }
    }
}

/// Split `name (inner)` into its name and the parenthesized part.
fn split_entry(text: &str, line: usize) -> Result<(&str, Option<&str>), LockfileError> {
    let (name, inner) = match text.find(" (") {
        Some(open) => {
            let inner = text[open + 2..]
                .strip_suffix(')')
                .ok_or_else(|| parse_error(line, format!("unterminated parenthesis in '{text}'")))?;
            (&text[..open], Some(inner))
        }
        None => (text, None),
    };

    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(parse_error(line, format!("invalid gem name in '{text}'")));
    }

    Ok((name, inner))
}

fn parse_spec(text: &str, source: Source, line: usize) -> Result<PackageRecord, LockfileError> {
    let (name, version) = split_entry(text, line)?;
    let version = version
        .filter(|v| !v.is_empty())
        .ok_or_else(|| parse_error(line, format!("spec '{name}' has no version")))?;

    // Bundler splits the platform off at the first dash.
    let (version, platform) = match version.split_once('-') {
        Some((version, platform)) => (version, Some(platform.to_string())),
        None => (version, None),
    };

    let mut record = PackageRecord::new(name, version, source);
    record.platform = platform;
    Ok(record)
}

fn parse_dependency(text: &str, line: usize) -> Result<LockedDependency, LockfileError> {
    let (name, requirement) = split_entry(text, line)?;
    Ok(LockedDependency {
        name: name.to_string(),
        requirement: requirement.map(ToString::to_string),
    })
}
