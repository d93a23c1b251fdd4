//! Runtime dependency closure resolution.
//!
//! This module provides:
//! - The [`PackageLookup`] seam the resolver reads locked records through
//! - Depth-first closure computation from a root gem
//! - Accessibility verification for git-sourced gems

use crate::gems::GemLocator;
use crate::lockfile::{PackageRecord, Source};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// The bundler gem. It is already active in the host Ruby and is never pinned.
pub const BUNDLER_GEM: &str = "bundler";

/// Errors that can occur during closure resolution.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// A dependency is declared but has no record in the lockfile.
    #[error("no spec for '{name}' in the lockfile")]
    UnknownPackage { name: String },

    /// Git-sourced gems in the closure are not installed.
    #[error("{0}")]
    Inaccessible(InaccessibleGems),
}

/// Read access to locked records by exact name.
pub trait PackageLookup {
    /// Look up a record by exact name.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownPackage`] if no record has that name.
    fn lookup(&self, name: &str) -> Result<&PackageRecord, ResolveError>;
}

/// The ordered, deduplicated runtime dependencies of a root gem.
///
/// Records appear in depth-first discovery order. The root and the bundler
/// gem are never part of the closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyClosure<'a> {
    records: Vec<&'a PackageRecord>,
}

impl<'a> DependencyClosure<'a> {
    /// Returns true if the closure is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Iterate over the records in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &'a PackageRecord> + '_ {
        self.records.iter().copied()
    }

    /// Returns true if a record with this name is in the closure.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    /// The record names in discovery order.
    #[must_use]
    pub fn names(&self) -> Vec<&'a str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    /// Records fetched from git.
    pub fn git_sourced(&self) -> impl Iterator<Item = &'a PackageRecord> + '_ {
        self.iter().filter(|r| r.source.is_git())
    }

    /// Check that every git-sourced gem is installed at its exact version.
    ///
    /// RubyGems cannot see gems that Bundler checked out from git, so a pin
    /// for one of them only works if the same version was also installed as
    /// a regular gem. Registry and path gems are not checked.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Inaccessible`] listing every missing gem.
    pub fn verify_accessible<L: GemLocator + ?Sized>(
        &self,
        locator: &L,
        app: &str,
        lockfile: impl Into<PathBuf>,
    ) -> Result<(), ResolveError> {
        let gems: Vec<InaccessibleGem> = self
            .git_sourced()
            .filter(|r| locator.find(&r.name, &r.version).is_none())
            .map(|r| InaccessibleGem {
                name: r.name.clone(),
                version: r.version.clone(),
                source: r.source.clone(),
            })
            .collect();

        if gems.is_empty() {
            return Ok(());
        }

        Err(ResolveError::Inaccessible(InaccessibleGems {
            app: app.to_string(),
            lockfile: lockfile.into(),
            gems,
            searched: locator.search_paths().to_vec(),
        }))
    }
}

impl<'a, 'b> IntoIterator for &'b DependencyClosure<'a> {
    type Item = &'b &'a PackageRecord;
    type IntoIter = std::slice::Iter<'b, &'a PackageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// A git-sourced gem that RubyGems cannot load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InaccessibleGem {
    pub name: String,
    pub version: String,
    pub source: Source,
}

/// Everything needed to explain an accessibility failure to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InaccessibleGems {
    /// The application being bundled.
    pub app: String,
    /// The lockfile the gems came from.
    pub lockfile: PathBuf,
    /// The offending gems.
    pub gems: Vec<InaccessibleGem>,
    /// Gem directories that were searched.
    pub searched: Vec<PathBuf>,
}

impl fmt::Display for InaccessibleGems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Application '{}' contains gems in the lockfile which are not accessible by rubygems.",
            self.app
        )?;
        writeln!(
            f,
            "This usually happens when gems are fetched from git in the Gemfile and the same"
        )?;
        writeln!(f, "versions were not installed as regular gems beforehand.")?;
        writeln!(f)?;
        writeln!(f, "The lockfile is located here:")?;
        writeln!(f, "- {}", self.lockfile.display())?;
        writeln!(f)?;
        writeln!(f, "The offending gems are:")?;
        for gem in &self.gems {
            writeln!(f, "- {} ({}) from {}", gem.name, gem.version, gem.source)?;
        }
        writeln!(f)?;
        writeln!(f, "The following gem paths were searched:")?;
        for path in &self.searched {
            writeln!(f, "- {}", path.display())?;
        }
        writeln!(f)?;
        write!(
            f,
            "If these seem wrong, set GEM_HOME/GEM_PATH or pass --gem-path before running appbundle."
        )
    }
}

/// Computes runtime closures over a set of locked records.
#[derive(Debug)]
pub struct Resolver<'a, L: ?Sized> {
    lookup: &'a L,
}

impl<'a, L: PackageLookup + ?Sized> Resolver<'a, L> {
    /// Create a resolver reading records from `lookup`.
    #[must_use]
    pub fn new(lookup: &'a L) -> Self {
        Self { lookup }
    }

    /// Resolve the runtime closure of `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownPackage`] if the root or any declared
    /// dependency reachable from it is missing from the lockfile.
    pub fn resolve(&self, root: &str) -> Result<DependencyClosure<'a>, ResolveError> {
        let lookup: &'a L = self.lookup;
        let root = lookup.lookup(root)?;

        let mut collected = Vec::new();
        self.collect(root, &root.name, &mut collected)?;
        debug!(root = %root.name, count = collected.len(), "resolved runtime closure");

        Ok(DependencyClosure { records: collected })
    }

    /// Pre-order walk with one `collected` accumulator shared by every branch.
    fn collect(
        &self,
        record: &'a PackageRecord,
        root: &str,
        collected: &mut Vec<&'a PackageRecord>,
    ) -> Result<(), ResolveError> {
        let lookup: &'a L = self.lookup;

        for name in record.dependency_names() {
            if name == root || name == BUNDLER_GEM || collected.iter().any(|r| r.name == name) {
                continue;
            }

            let next = lookup.lookup(name)?;
            debug!(gem = %next.name, version = %next.version, parent = %record.name, "collected dependency");
            collected.push(next);
            self.collect(next, root, collected)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gems::InstalledGem;
    use crate::lockfile::{GitReference, Lockfile};
    use std::collections::HashMap;
    use std::path::Path;

    fn registry() -> Source {
        Source::Registry {
            remotes: vec!["https://rubygems.org/".to_string()],
        }
    }

    fn git() -> Source {
        Source::Git {
            remote: "https://github.com/example/b2.git".to_string(),
            revision: "abcdef0123456789".to_string(),
            reference: GitReference::DefaultBranch,
        }
    }

    fn record(name: &str, version: &str, deps: &[&str]) -> PackageRecord {
        deps.iter()
            .fold(PackageRecord::new(name, version, registry()), |r, d| {
                r.with_dependency(*d)
            })
    }

    /// In-memory lookup used in place of a parsed lockfile.
    struct Specs(HashMap<String, PackageRecord>);

    impl Specs {
        fn new(records: Vec<PackageRecord>) -> Self {
            Self(records.into_iter().map(|r| (r.name.clone(), r)).collect())
        }
    }

    impl PackageLookup for Specs {
        fn lookup(&self, name: &str) -> Result<&PackageRecord, ResolveError> {
            self.0.get(name).ok_or_else(|| ResolveError::UnknownPackage {
                name: name.to_string(),
            })
        }
    }

    /// Locator that knows a fixed set of installed name/version pairs.
    struct Installed(Vec<(&'static str, &'static str)>, Vec<PathBuf>);

    impl GemLocator for Installed {
        fn find(&self, name: &str, version: &str) -> Option<InstalledGem> {
            self.0
                .iter()
                .any(|&(n, v)| n == name && v == version)
                .then(|| InstalledGem::new(name, version, Path::new("/gems").join(name)))
        }

        fn search_paths(&self) -> &[PathBuf] {
            &self.1
        }
    }

    fn diamond() -> Vec<PackageRecord> {
        vec![
            record("second_level_dep_a_a", "2.1.0", &[]),
            record("second_level_dep_shared", "2.3.0", &[]),
            record("second_level_dep_b_a", "2.2.0", &[]),
            record(
                "first_level_dep_a",
                "1.1.0",
                &["second_level_dep_a_a", "second_level_dep_shared"],
            ),
            record(
                "first_level_dep_b",
                "1.2.0",
                &["second_level_dep_b_a", "second_level_dep_shared"],
            ),
            record("app", "1.0.0", &["first_level_dep_a", "first_level_dep_b"]),
        ]
    }

    #[test]
    fn test_resolve_diamond_in_discovery_order() {
        let specs = Specs::new(diamond());
        let closure = Resolver::new(&specs).resolve("app").unwrap();

        assert_eq!(
            closure.names(),
            vec![
                "first_level_dep_a",
                "second_level_dep_a_a",
                "second_level_dep_shared",
                "first_level_dep_b",
                "second_level_dep_b_a",
            ]
        );
        assert_eq!(
            closure
                .iter()
                .filter(|r| r.name == "second_level_dep_shared")
                .count(),
            1
        );
        assert!(!closure.contains("app"));
    }

    #[test]
    fn test_resolve_versions_come_from_lockfile() {
        let specs = Specs::new(diamond());
        let closure = Resolver::new(&specs).resolve("app").unwrap();

        let versions: Vec<_> = closure
            .iter()
            .map(|r| format!("{}@{}", r.name, r.version))
            .collect();
        assert!(versions.contains(&"first_level_dep_a@1.1.0".to_string()));
        assert!(versions.contains(&"second_level_dep_shared@2.3.0".to_string()));
        assert!(versions.contains(&"second_level_dep_b_a@2.2.0".to_string()));
    }

    #[test]
    fn test_resolve_cycle_terminates() {
        let specs = Specs::new(vec![
            record("app", "1.0.0", &["a"]),
            record("a", "1.0.0", &["b"]),
            record("b", "1.0.0", &["a", "app"]),
        ]);
        let closure = Resolver::new(&specs).resolve("app").unwrap();

        assert_eq!(closure.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_resolve_self_dependency() {
        let specs = Specs::new(vec![record("app", "1.0.0", &["app"])]);
        let closure = Resolver::new(&specs).resolve("app").unwrap();
        assert!(closure.is_empty());
    }

    #[test]
    fn test_resolve_missing_dependency() {
        let specs = Specs::new(vec![
            record("app", "1.0.0", &["a"]),
            record("a", "1.0.0", &["ghost"]),
        ]);
        let err = Resolver::new(&specs).resolve("app").unwrap_err();

        assert!(matches!(err, ResolveError::UnknownPackage { ref name } if name == "ghost"));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_resolve_missing_root() {
        let specs = Specs::new(diamond());
        let err = Resolver::new(&specs).resolve("nope").unwrap_err();
        assert!(matches!(err, ResolveError::UnknownPackage { ref name } if name == "nope"));
    }

    #[test]
    fn test_resolve_skips_bundler_everywhere() {
        // bundler has no record, so looking it up would fail.
        let specs = Specs::new(vec![
            record("app", "1.0.0", &["bundler", "a"]),
            record("a", "1.0.0", &["bundler"]),
        ]);
        let closure = Resolver::new(&specs).resolve("app").unwrap();

        assert_eq!(closure.names(), vec!["a"]);
        assert!(!closure.contains(BUNDLER_GEM));
    }

    #[test]
    fn test_resolve_skips_locked_bundler() {
        let specs = Specs::new(vec![
            record("app", "1.0.0", &["bundler"]),
            record("bundler", "2.4.22", &[]),
        ]);
        let closure = Resolver::new(&specs).resolve("app").unwrap();
        assert!(closure.is_empty());
    }

    #[test]
    fn test_resolve_against_lockfile() {
        let lockfile = Lockfile::from_records(diamond());
        let closure = Resolver::new(&lockfile).resolve("first_level_dep_b").unwrap();
        assert_eq!(
            closure.names(),
            vec!["second_level_dep_b_a", "second_level_dep_shared"]
        );
    }

    #[test]
    fn test_verify_accessible_ignores_registry_gems() {
        let specs = Specs::new(diamond());
        let closure = Resolver::new(&specs).resolve("app").unwrap();
        let locator = Installed(vec![], vec![]);

        assert!(closure
            .verify_accessible(&locator, "app", "/src/app/Gemfile.lock")
            .is_ok());
    }

    #[test]
    fn test_verify_accessible_missing_git_gem() {
        let mut records = diamond();
        records[2].source = git();
        let specs = Specs::new(records);
        let closure = Resolver::new(&specs).resolve("app").unwrap();
        let locator = Installed(vec![], vec![PathBuf::from("/opt/app/embedded/gems")]);

        let err = closure
            .verify_accessible(&locator, "app", "/src/app/Gemfile.lock")
            .unwrap_err();

        let ResolveError::Inaccessible(details) = &err else {
            panic!("Expected inaccessible gems, got {err:?}");
        };
        assert_eq!(details.gems.len(), 1);
        assert_eq!(details.gems[0].name, "second_level_dep_b_a");
        assert_eq!(details.gems[0].version, "2.2.0");

        let message = err.to_string();
        assert!(message.contains("Application 'app'"));
        assert!(message.contains("- /src/app/Gemfile.lock"));
        assert!(message.contains(
            "- second_level_dep_b_a (2.2.0) from https://github.com/example/b2.git (at HEAD@abcdef0)"
        ));
        assert!(message.contains("- /opt/app/embedded/gems"));
    }

    #[test]
    fn test_verify_accessible_installed_git_gem() {
        let mut records = diamond();
        records[2].source = git();
        let specs = Specs::new(records);
        let closure = Resolver::new(&specs).resolve("app").unwrap();
        let locator = Installed(vec![("second_level_dep_b_a", "2.2.0")], vec![]);

        assert!(closure
            .verify_accessible(&locator, "app", "/src/app/Gemfile.lock")
            .is_ok());
    }
}
