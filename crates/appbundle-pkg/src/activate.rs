//! Ruby activation code generation.
//!
//! The activation script clears the ambient gem search paths and pins every
//! gem of a runtime closure to its locked version, so RubyGems never has to
//! pick a version on its own.

use crate::resolve::DependencyClosure;
use std::fmt;

/// Setting this environment variable to `"true"` keeps `GEM_HOME` and
/// `GEM_PATH` intact at run time (for rvm-managed Rubies).
pub const ALLOW_RVM_ENV: &str = "APPBUNDLE_ALLOW_RVM";

/// Preamble that resets the gem environment before any pins run.
///
/// It leaves the `unless` block open; the dispatch block of the binstub
/// closes it.
pub const ENV_SANITIZER: &str = r#"require "rubygems"

begin
  # rubygems 2.7.x needs this loaded before any gem activation (rubygems/rubygems#2196)
  require "rubygems/bundler_version_finder"
rescue LoadError
  # not present in older or newer rubygems
end

# Inside a live Bundler bundle the bundle already decides every version.
unless defined?(Bundler) && Bundler.instance_variable_defined?("@load")
  ENV["GEM_HOME"] = ENV["GEM_PATH"] = nil unless ENV["APPBUNDLE_ALLOW_RVM"] == "true"
  ::Gem.clear_paths
"#;

/// Render the statement pinning `name` to exactly `version`.
#[must_use]
pub fn pin_statement(name: &str, version: &str) -> String {
    format!("gem \"{name}\", \"= {version}\"")
}

/// Activation code for one runtime closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationScript(String);

impl ActivationScript {
    /// Render the sanitizer followed by one pin per closure record, in
    /// closure order.
    #[must_use]
    pub fn render(closure: &DependencyClosure<'_>) -> Self {
        let mut code = String::from(ENV_SANITIZER);
        code.push('\n');
        for record in closure {
            code.push_str("  ");
            code.push_str(&pin_statement(&record.name, &record.version));
            code.push('\n');
        }
        Self(code)
    }

    /// The script text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivationScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ActivationScript {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::{Lockfile, PackageRecord, Source};
    use crate::resolve::Resolver;

    fn lockfile() -> Lockfile {
        let source = Source::Registry {
            remotes: vec!["https://rubygems.org/".to_string()],
        };
        Lockfile::from_records([
            PackageRecord::new("A2", "2.1.0", source.clone()),
            PackageRecord::new("Shared", "2.3.0", source.clone()),
            PackageRecord::new("B2", "2.2.0", source.clone()),
            PackageRecord::new("A", "1.1.0", source.clone())
                .with_dependency("A2")
                .with_dependency("Shared"),
            PackageRecord::new("B", "1.2.0", source.clone())
                .with_dependency("B2")
                .with_dependency("Shared"),
            PackageRecord::new("app", "1.0.0", source)
                .with_dependency("A")
                .with_dependency("B")
                .with_dependency("bundler"),
        ])
    }

    #[test]
    fn pins_every_dependency() {
        let lockfile = lockfile();
        let closure = Resolver::new(&lockfile).resolve("app").unwrap();
        let script = ActivationScript::render(&closure);

        for line in [
            r#"  gem "A", "= 1.1.0""#,
            r#"  gem "A2", "= 2.1.0""#,
            r#"  gem "Shared", "= 2.3.0""#,
            r#"  gem "B", "= 1.2.0""#,
            r#"  gem "B2", "= 2.2.0""#,
        ] {
            assert!(script.as_str().lines().any(|l| l == line), "missing {line}");
        }
        assert!(!script.as_str().contains(r#"gem "app""#));
        assert!(!script.as_str().contains(r#"gem "bundler""#));
    }

    #[test]
    fn pins_follow_closure_order() {
        let lockfile = lockfile();
        let closure = Resolver::new(&lockfile).resolve("app").unwrap();
        let script = ActivationScript::render(&closure);

        let pins: Vec<_> = script
            .as_str()
            .lines()
            .filter(|l| l.starts_with("  gem "))
            .collect();
        assert_eq!(
            pins,
            vec![
                r#"  gem "A", "= 1.1.0""#,
                r#"  gem "A2", "= 2.1.0""#,
                r#"  gem "Shared", "= 2.3.0""#,
                r#"  gem "B", "= 1.2.0""#,
                r#"  gem "B2", "= 2.2.0""#,
            ]
        );
    }

    #[test]
    fn starts_with_sanitizer() {
        let lockfile = lockfile();
        let closure = Resolver::new(&lockfile).resolve("app").unwrap();
        let script = ActivationScript::render(&closure);

        assert!(script.as_str().starts_with(ENV_SANITIZER));
        assert!(ENV_SANITIZER.contains(ALLOW_RVM_ENV));
        assert!(ENV_SANITIZER
            .contains(r#"ENV["GEM_HOME"] = ENV["GEM_PATH"] = nil unless ENV["APPBUNDLE_ALLOW_RVM"] == "true""#));
    }

    #[test]
    fn render_is_idempotent() {
        let lockfile = lockfile();
        let closure = Resolver::new(&lockfile).resolve("app").unwrap();

        assert_eq!(
            ActivationScript::render(&closure),
            ActivationScript::render(&closure)
        );
    }

    #[test]
    fn empty_closure() {
        let lockfile = Lockfile::from_records([PackageRecord::new(
            "solo",
            "0.1.0",
            Source::Path {
                path: ".".to_string(),
            },
        )]);
        let closure = Resolver::new(&lockfile).resolve("solo").unwrap();
        let script = ActivationScript::render(&closure);

        assert_eq!(script.as_str(), format!("{ENV_SANITIZER}\n"));
    }

    #[test]
    fn pin_statement_format() {
        assert_eq!(pin_statement("chef", "12.4.1"), r#"gem "chef", "= 12.4.1""#);
    }
}
