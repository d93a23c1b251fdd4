//! Installed gem discovery.
//!
//! Finds gems installed by RubyGems and the executables they expose. A gem
//! directory (one entry of `GEM_PATH`) is laid out as:
//! ```text
//! <gem dir>/
//! ├── specifications/
//! │   ├── chef-12.4.1.gemspec
//! │   ├── ffi-1.9.10-x86-mingw32.gemspec
//! │   └── default/              # gems that ship with Ruby
//! └── gems/
//!     └── chef-12.4.1/
//!         └── bin/
//!             └── knife
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Directory holding installed gemspecs.
pub const SPECIFICATIONS_DIR: &str = "specifications";

/// Directory holding unpacked gems.
pub const GEMS_DIR: &str = "gems";

/// Executable directory used when a gemspec does not set `bindir`.
pub const DEFAULT_BIN_DIR: &str = "bin";

/// Installed gemspec extension.
pub const GEMSPEC_EXT: &str = "gemspec";

static EXECUTABLES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*\w+\.executables\s*=\s*\[([^\]]*)\]").expect("executables pattern")
});

static BINDIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*\w+\.bindir\s*=\s*["']([^"']+)["']"#).expect("bindir pattern")
});

static STRING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).expect("string literal pattern"));

/// Errors that can occur when inspecting installed gems.
#[derive(Error, Debug)]
pub enum GemError {
    #[error("unable to find {name} {version} installed as a gem (searched: {})", format_paths(.searched))]
    NotInstalled {
        name: String,
        version: String,
        searched: Vec<PathBuf>,
    },

    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),
}

fn format_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no gem paths configured".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Locates installed gems by exact name and version.
pub trait GemLocator {
    /// Find an installed gem, or `None` if it is not installed.
    fn find(&self, name: &str, version: &str) -> Option<InstalledGem>;

    /// The gem directories searched by [`GemLocator::find`].
    fn search_paths(&self) -> &[PathBuf];

    /// Like [`GemLocator::find`], but a missing gem is an error.
    ///
    /// # Errors
    ///
    /// Returns [`GemError::NotInstalled`] if the gem cannot be found.
    fn require(&self, name: &str, version: &str) -> Result<InstalledGem, GemError> {
        self.find(name, version).ok_or_else(|| GemError::NotInstalled {
            name: name.to_string(),
            version: version.to_string(),
            searched: self.search_paths().to_vec(),
        })
    }
}

/// A gem found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledGem {
    /// Gem name.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// The unpacked gem directory.
    pub gem_dir: PathBuf,
    /// The installed gemspec, if one was found.
    pub spec_file: Option<PathBuf>,
}

impl InstalledGem {
    /// Create an installed gem without a gemspec.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>, gem_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            gem_dir: gem_dir.into(),
            spec_file: None,
        }
    }

    /// Attach the installed gemspec.
    #[must_use]
    pub fn with_spec_file(mut self, spec_file: impl Into<PathBuf>) -> Self {
        self.spec_file = Some(spec_file.into());
        self
    }

    /// List the executables this gem exposes.
    ///
    /// Uses `executables` and `bindir` from the installed gemspec. When the
    /// gemspec declares none (or there is no gemspec), every file in the
    /// gem's `bin/` directory is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the gemspec or the bin directory cannot be read.
    pub fn executables(&self) -> Result<Vec<PathBuf>, GemError> {
        if let Some(spec_file) = &self.spec_file {
            let content = std::fs::read_to_string(spec_file).map_err(|source| GemError::Io {
                path: spec_file.clone(),
                source,
            })?;
            let declared = DeclaredExecutables::parse(&content);
            if !declared.names.is_empty() {
                let bin_dir = self.gem_dir.join(&declared.bindir);
                return Ok(declared.names.iter().map(|name| bin_dir.join(name)).collect());
            }
        }

        self.bin_dir_entries()
    }

    fn bin_dir_entries(&self) -> Result<Vec<PathBuf>, GemError> {
        let bin_dir = self.gem_dir.join(DEFAULT_BIN_DIR);
        if !bin_dir.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!("{}/*", glob::Pattern::escape(&bin_dir.to_string_lossy()));
        let mut executables = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| GemError::Io {
                path: e.path().to_path_buf(),
                source: e.into(),
            })?;
            if path.is_file() {
                executables.push(path);
            }
        }

        Ok(executables)
    }
}

/// The executable declarations of a gemspec.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeclaredExecutables {
    bindir: String,
    names: Vec<String>,
}

impl DeclaredExecutables {
    fn parse(gemspec: &str) -> Self {
        let bindir = BINDIR_RE
            .captures(gemspec)
            .map_or_else(|| DEFAULT_BIN_DIR.to_string(), |c| c[1].to_string());

        let names = EXECUTABLES_RE
            .captures(gemspec)
            .map(|c| {
                STRING_RE
                    .captures_iter(&c[1])
                    .map(|s| s[1].to_string())
                    .collect()
            })
            .unwrap_or_default();

        Self { bindir, names }
    }
}

/// A set of RubyGems installation directories.
#[derive(Debug, Clone, Default)]
pub struct GemEnvironment {
    paths: Vec<PathBuf>,
}

impl GemEnvironment {
    /// Create an environment searching `paths` in order.
    pub fn new<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        let mut env = Self::default();
        for path in paths {
            let path = path.into();
            if !env.paths.contains(&path) {
                env.paths.push(path);
            }
        }
        env
    }

    /// Create an environment from `GEM_HOME` followed by `GEM_PATH`.
    pub fn from_env() -> Self {
        let home = std::env::var_os("GEM_HOME").map(PathBuf::from);
        let path = std::env::var_os("GEM_PATH")
            .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
            .unwrap_or_default();
        Self::new(home.into_iter().chain(path).filter(|p| !p.as_os_str().is_empty()))
    }

    /// The searched gem directories.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn find_in(dir: &Path, name: &str, version: &str) -> Option<InstalledGem> {
        let specs_dir = dir.join(SPECIFICATIONS_DIR);
        let full_name = format!("{name}-{version}");
        let spec_name = format!("{full_name}.{GEMSPEC_EXT}");

        for spec_file in [specs_dir.join(&spec_name), specs_dir.join("default").join(&spec_name)] {
            if spec_file.is_file() {
                let gem_dir = dir.join(GEMS_DIR).join(&full_name);
                return Some(InstalledGem::new(name, version, gem_dir).with_spec_file(spec_file));
            }
        }

        // Platform gems: <name>-<version>-<platform>.gemspec
        let pattern = format!(
            "{}/{}-*.{GEMSPEC_EXT}",
            glob::Pattern::escape(&specs_dir.to_string_lossy()),
            glob::Pattern::escape(&full_name),
        );
        glob::glob(&pattern)
            .ok()?
            .filter_map(Result::ok)
            .find_map(|spec_file| {
                let stem = spec_file.file_stem()?.to_str()?.to_string();
                let gem_dir = dir.join(GEMS_DIR).join(stem);
                Some(InstalledGem::new(name, version, gem_dir).with_spec_file(spec_file))
            })
    }
}

impl GemLocator for GemEnvironment {
    fn find(&self, name: &str, version: &str) -> Option<InstalledGem> {
        let found = self
            .paths
            .iter()
            .find_map(|dir| Self::find_in(dir, name, version));
        match &found {
            Some(gem) => debug!(gem = name, version, dir = %gem.gem_dir.display(), "found installed gem"),
            None => debug!(gem = name, version, "gem not installed"),
        }
        found
    }

    fn search_paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn install(root: &Path, full_name: &str, gemspec: &str, bins: &[&str]) {
        let specs = root.join(SPECIFICATIONS_DIR);
        fs::create_dir_all(&specs).unwrap();
        fs::write(specs.join(format!("{full_name}.gemspec")), gemspec).unwrap();

        let bin_dir = root.join(GEMS_DIR).join(full_name).join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        for bin in bins {
            fs::write(bin_dir.join(bin), "#!/usr/bin/env ruby\n").unwrap();
        }
    }

    const CHEF_GEMSPEC: &str = r#"# -*- encoding: utf-8 -*-
# stub: chef 12.4.1 ruby lib

Gem::Specification.new do |s|
  s.name = "chef".freeze
  s.version = "12.4.1"
  s.bindir = "bin".freeze
  s.executables = ["chef-apply".freeze, "knife".freeze]
end
"#;

    #[test]
    fn find_installed_gem() {
        let tmp = TempDir::new().unwrap();
        install(tmp.path(), "chef-12.4.1", CHEF_GEMSPEC, &["chef-apply", "knife"]);

        let env = GemEnvironment::new([tmp.path()]);
        let gem = env.find("chef", "12.4.1").unwrap();

        assert_eq!(gem.gem_dir, tmp.path().join("gems/chef-12.4.1"));
        assert_eq!(
            gem.spec_file.as_deref(),
            Some(tmp.path().join("specifications/chef-12.4.1.gemspec").as_path())
        );
    }

    #[test]
    fn find_requires_exact_version() {
        let tmp = TempDir::new().unwrap();
        install(tmp.path(), "chef-12.4.1", CHEF_GEMSPEC, &[]);

        let env = GemEnvironment::new([tmp.path()]);
        assert!(env.find("chef", "12.4.0").is_none());
        assert!(env.find("chef", "12.4").is_none());
    }

    #[test]
    fn find_platform_gem() {
        let tmp = TempDir::new().unwrap();
        install(tmp.path(), "ffi-1.9.10-x86-mingw32", "", &[]);

        let env = GemEnvironment::new([tmp.path()]);
        let gem = env.find("ffi", "1.9.10").unwrap();
        assert_eq!(gem.gem_dir, tmp.path().join("gems/ffi-1.9.10-x86-mingw32"));
    }

    #[test]
    fn find_searches_paths_in_order() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        install(second.path(), "rake-10.1.1", "", &[]);

        let env = GemEnvironment::new([first.path(), second.path()]);
        let gem = env.find("rake", "10.1.1").unwrap();
        assert!(gem.gem_dir.starts_with(second.path()));
    }

    #[test]
    fn require_missing_gem() {
        let env = GemEnvironment::new(["/opt/nowhere"]);
        let err = env.require("chef", "12.4.1").unwrap_err();

        assert!(matches!(err, GemError::NotInstalled { .. }));
        assert!(err.to_string().contains("chef 12.4.1"));
        assert!(err.to_string().contains("/opt/nowhere"));
    }

    #[test]
    fn executables_from_gemspec() {
        let tmp = TempDir::new().unwrap();
        install(tmp.path(), "chef-12.4.1", CHEF_GEMSPEC, &["chef-apply", "knife"]);

        let env = GemEnvironment::new([tmp.path()]);
        let gem = env.find("chef", "12.4.1").unwrap();
        let bin_dir = tmp.path().join("gems/chef-12.4.1/bin");

        assert_eq!(
            gem.executables().unwrap(),
            vec![bin_dir.join("chef-apply"), bin_dir.join("knife")]
        );
    }

    #[test]
    fn executables_fall_back_to_bin_dir() {
        let tmp = TempDir::new().unwrap();
        install(tmp.path(), "app-1.0.0", "Gem::Specification.new do |s|\nend\n", &["b", "a"]);

        let env = GemEnvironment::new([tmp.path()]);
        let gem = env.find("app", "1.0.0").unwrap();
        let bin_dir = tmp.path().join("gems/app-1.0.0/bin");

        assert_eq!(gem.executables().unwrap(), vec![bin_dir.join("a"), bin_dir.join("b")]);
    }

    #[test]
    fn executables_without_bin_dir() {
        let gem = InstalledGem::new("lib-only", "1.0.0", "/nonexistent/lib-only-1.0.0");
        assert!(gem.executables().unwrap().is_empty());
    }

    #[test]
    fn parse_declared_executables() {
        let declared = DeclaredExecutables::parse(
            "  spec.bindir = 'exe'\n  spec.executables = ['one', \"two\".freeze]\n",
        );
        assert_eq!(declared.bindir, "exe");
        assert_eq!(declared.names, vec!["one", "two"]);
    }

    #[test]
    fn new_deduplicates_paths() {
        let env = GemEnvironment::new(["/a", "/b", "/a"]);
        assert_eq!(env.paths(), &[PathBuf::from("/a"), PathBuf::from("/b")]);
    }
}
