use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{info, warn};

use crate::config::ServerConfiguration;
use crate::utils::error::ServerError;

/// Identifier of the built-in pattern filter factory.
pub const PATTERN_FILTER: &str = "pattern-filter";
/// Identifier of the built-in allow-list filter factory.
pub const ALLOWLIST_FILTER: &str = "allowlist-filter";
/// Identifier of the built-in dry-run filter factory.
pub const DRYRUN_FILTER: &str = "dryrun-filter";

/// Outcome of checking a single class name against a deserialization
/// filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allowed,
    Rejected,
    /// No rule matched. The enforcement point treats this as a rejection,
    /// fail-closed.
    Undecided,
}

/// Validates class names of inbound payloads before they are deserialized.
///
/// Exactly one filter is active per server for its lifetime, installed at
/// construction before any client traffic is accepted.
pub trait DeserializationFilter: Send + Sync {
    /// Checks the given class name.
    fn check(&self, class_name: &str) -> FilterDecision;

    /// Flushes any accumulated state, called once on server shutdown.
    fn flush(&self) -> Result<(), ServerError> {
        Ok(())
    }
}

/// Creates a [`DeserializationFilter`] from the server configuration.
/// Resolved through the plugin registry by identifier.
pub trait ObjectInputFilterFactory: Send + Sync {
    fn create(
        &self,
        configuration: &ServerConfiguration,
    ) -> Result<Arc<dyn DeserializationFilter>, ServerError>;
}

/// Resolves array class names to their component type, recursively through
/// nested arrays: `com.acme.Foo[][]` becomes `com.acme.Foo`.
pub fn component_type(class_name: &str) -> &str {
    let mut name = class_name;
    while let Some(stripped) = name.strip_suffix("[]") {
        name = stripped;
    }
    name
}

const PRIMITIVES: [&str; 12] = [
    "bool", "boolean", "byte", "char", "short", "int", "long", "float", "double", "i32", "i64",
    "f64",
];

/// Primitive array components are always allowed.
pub fn is_primitive(class_name: &str) -> bool {
    PRIMITIVES.contains(&class_name)
}

/// Resource ceilings carried by a pattern rule string. Only the classname
/// rules are enforced at the envelope boundary; these ceilings are exposed
/// for the codec that owns the raw input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterLimits {
    pub max_depth: Option<u64>,
    pub max_array: Option<u64>,
    pub max_refs: Option<u64>,
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
enum Glob {
    Exact(String),
    Prefix(String),
    MatchAll,
}

impl Glob {
    fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Glob::MatchAll
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Glob::Prefix(prefix.to_string())
        } else {
            Glob::Exact(pattern.to_string())
        }
    }

    fn matches(&self, class_name: &str) -> bool {
        match self {
            Glob::Exact(name) => class_name == name,
            Glob::Prefix(prefix) => class_name.starts_with(prefix),
            Glob::MatchAll => true,
        }
    }
}

#[derive(Debug, Clone)]
enum PatternRule {
    Allow(Glob),
    Reject(Glob),
}

/// A filter compiled from a ";"-joined rule string, e.g.
/// `maxdepth=20;core.client.*;!*`.
///
/// Rules are evaluated in order, first match wins; a leading `!` rejects.
/// Rule strings should always end in an explicit reject-everything-else
/// clause, since unmatched class names are rejected by the enforcement
/// point anyway.
pub struct PatternFilter {
    rules: Vec<PatternRule>,
    limits: FilterLimits,
}

impl PatternFilter {
    /// Compiles the given rule string.
    ///
    /// # Errors
    /// Returns a `ServerError::Configuration` on a malformed limit entry or
    /// an empty rule string.
    pub fn compile(patterns: &str) -> Result<Self, ServerError> {
        let mut rules = Vec::new();
        let mut limits = FilterLimits::default();
        for entry in patterns.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((key, value)) = entry.split_once('=') {
                let parsed = value.parse::<u64>().map_err(|_| {
                    ServerError::Configuration(format!("Malformed filter limit '{entry}'"))
                })?;
                match key {
                    "maxdepth" => limits.max_depth = Some(parsed),
                    "maxarray" => limits.max_array = Some(parsed),
                    "maxrefs" => limits.max_refs = Some(parsed),
                    "maxbytes" => limits.max_bytes = Some(parsed),
                    _ => {
                        return Err(ServerError::Configuration(format!(
                            "Unknown filter limit '{key}'"
                        )))
                    }
                }
            } else if let Some(pattern) = entry.strip_prefix('!') {
                rules.push(PatternRule::Reject(Glob::parse(pattern)));
            } else {
                rules.push(PatternRule::Allow(Glob::parse(entry)));
            }
        }
        if rules.is_empty() {
            return Err(ServerError::Configuration(
                "Pattern filter requires at least one classname rule".into(),
            ));
        }

        Ok(Self { rules, limits })
    }

    pub fn limits(&self) -> FilterLimits {
        self.limits
    }
}

impl DeserializationFilter for PatternFilter {
    fn check(&self, class_name: &str) -> FilterDecision {
        let name = component_type(class_name);
        if is_primitive(name) {
            return FilterDecision::Allowed;
        }
        for rule in &self.rules {
            match rule {
                PatternRule::Allow(glob) if glob.matches(name) => return FilterDecision::Allowed,
                PatternRule::Reject(glob) if glob.matches(name) => {
                    warn!("Rejecting deserialization of {}", class_name);
                    return FilterDecision::Rejected;
                }
                _ => {}
            }
        }

        FilterDecision::Undecided
    }
}

/// A filter backed by an explicit set of class names plus prefix wildcards
/// (`com.acme.*`). Everything else is rejected and logged.
pub struct AllowListFilter {
    classes: HashSet<String>,
    wildcard_prefixes: Vec<String>,
}

impl AllowListFilter {
    /// Builds a filter from allow-list lines; `#` comments and blank lines
    /// are ignored.
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classes = HashSet::new();
        let mut wildcard_prefixes = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(prefix) = line.strip_suffix('*') {
                wildcard_prefixes.push(prefix.to_string());
            } else {
                classes.insert(line.to_string());
            }
        }

        Self {
            classes,
            wildcard_prefixes,
        }
    }

    /// Loads the allow-list from a file path or `classpath:` resource.
    pub fn from_location(location: &str) -> Result<Self, ServerError> {
        let lines = read_filter_lines(location)?;
        info!(
            "Loaded serialization allow-list from '{}' ({} entries)",
            location,
            lines.len()
        );

        Ok(Self::new(lines))
    }
}

impl DeserializationFilter for AllowListFilter {
    fn check(&self, class_name: &str) -> FilterDecision {
        let name = component_type(class_name);
        if is_primitive(name) {
            return FilterDecision::Allowed;
        }
        if self.classes.contains(name) {
            return FilterDecision::Allowed;
        }
        if self
            .wildcard_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
        {
            return FilterDecision::Allowed;
        }
        warn!("Rejecting deserialization of {}", class_name);

        FilterDecision::Rejected
    }
}

/// A discovery filter that accepts everything and records every distinct
/// class name observed, flushing the sorted set to a target file on
/// shutdown. Intended to bootstrap an allow-list from real traffic, never
/// for production use.
pub struct DryRunFilter {
    seen: DashSet<String>,
    target: PathBuf,
}

impl DryRunFilter {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            seen: DashSet::new(),
            target: target.into(),
        }
    }
}

impl DeserializationFilter for DryRunFilter {
    fn check(&self, class_name: &str) -> FilterDecision {
        self.seen.insert(component_type(class_name).to_string());

        FilterDecision::Allowed
    }

    fn flush(&self) -> Result<(), ServerError> {
        let mut names: Vec<String> = self.seen.iter().map(|name| name.key().clone()).collect();
        names.sort();
        let mut contents = names.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        fs::write(&self.target, contents)?;
        info!(
            "Serialization dry-run flushed {} class names to {:?}",
            names.len(),
            self.target
        );

        Ok(())
    }
}

/// Resources embedded at the crate resource root, addressable through the
/// `classpath:` prefix.
const EMBEDDED_RESOURCES: [(&str, &str); 1] = [(
    "serialization-allowlist.txt",
    include_str!("../../resources/serialization-allowlist.txt"),
)];

/// Reads allow-list lines from a file path or, with a `classpath:` prefix,
/// from an embedded resource. Resources live at the resource root, no
/// subdirectories.
pub fn read_filter_lines(location: &str) -> Result<Vec<String>, ServerError> {
    let contents = if let Some(resource) = location.strip_prefix("classpath:") {
        if resource.contains('/') || resource.contains('\\') {
            return Err(ServerError::Configuration(format!(
                "Classpath resources must live at the resource root: '{resource}'"
            )));
        }
        EMBEDDED_RESOURCES
            .iter()
            .find(|(name, _)| *name == resource)
            .map(|(_, contents)| contents.to_string())
            .ok_or_else(|| {
                ServerError::Configuration(format!("Embedded resource not found: '{resource}'"))
            })?
    } else {
        fs::read_to_string(location)?
    };

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Factory for [`PatternFilter`], requires `filter_patterns` to be
/// configured.
pub struct PatternFilterFactory;

impl ObjectInputFilterFactory for PatternFilterFactory {
    fn create(
        &self,
        configuration: &ServerConfiguration,
    ) -> Result<Arc<dyn DeserializationFilter>, ServerError> {
        let patterns = configuration.filter_patterns.as_deref().ok_or_else(|| {
            ServerError::Configuration("filter_patterns is not configured".into())
        })?;

        Ok(Arc::new(PatternFilter::compile(patterns)?))
    }
}

/// Factory for [`AllowListFilter`], requires `filter_allowlist` to be
/// configured.
pub struct AllowListFilterFactory;

impl ObjectInputFilterFactory for AllowListFilterFactory {
    fn create(
        &self,
        configuration: &ServerConfiguration,
    ) -> Result<Arc<dyn DeserializationFilter>, ServerError> {
        let location = configuration.filter_allowlist.as_deref().ok_or_else(|| {
            ServerError::Configuration("filter_allowlist is not configured".into())
        })?;

        Ok(Arc::new(AllowListFilter::from_location(location)?))
    }
}

/// Factory for [`DryRunFilter`], requires `filter_dry_run_file` to be
/// configured.
pub struct DryRunFilterFactory;

impl ObjectInputFilterFactory for DryRunFilterFactory {
    fn create(
        &self,
        configuration: &ServerConfiguration,
    ) -> Result<Arc<dyn DeserializationFilter>, ServerError> {
        let target = configuration.filter_dry_run_file.clone().ok_or_else(|| {
            ServerError::Configuration("filter_dry_run_file is not configured".into())
        })?;

        Ok(Arc::new(DryRunFilter::new(target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_type_resolution() {
        assert_eq!(component_type("com.acme.Foo"), "com.acme.Foo");
        assert_eq!(component_type("com.acme.Foo[]"), "com.acme.Foo");
        assert_eq!(component_type("com.acme.Foo[][]"), "com.acme.Foo");
        assert_eq!(component_type("int[]"), "int");
    }

    #[test]
    fn allowlist_decisions() {
        let filter = AllowListFilter::new(["com.acme.Foo", "com.acme.pkg.*", "# comment", ""]);
        assert_eq!(filter.check("com.acme.Foo"), FilterDecision::Allowed);
        assert_eq!(filter.check("com.acme.pkg.Bar"), FilterDecision::Allowed);
        assert_eq!(filter.check("int[]"), FilterDecision::Allowed);
        assert_eq!(filter.check("com.acme.Foo[][]"), FilterDecision::Allowed);
        assert_eq!(filter.check("com.other.Baz"), FilterDecision::Rejected);
    }

    #[test]
    fn pattern_rules_first_match_wins() {
        let filter = PatternFilter::compile("maxdepth=20;!com.acme.internal.*;com.acme.*;!*")
            .unwrap();
        assert_eq!(filter.check("com.acme.Foo"), FilterDecision::Allowed);
        assert_eq!(
            filter.check("com.acme.internal.Secret"),
            FilterDecision::Rejected
        );
        assert_eq!(filter.check("com.other.Baz"), FilterDecision::Rejected);
        assert_eq!(filter.limits().max_depth, Some(20));
    }

    #[test]
    fn pattern_without_final_clause_leaves_unmatched_undecided() {
        let filter = PatternFilter::compile("com.acme.*").unwrap();
        assert_eq!(filter.check("com.other.Baz"), FilterDecision::Undecided);
    }

    #[test]
    fn malformed_pattern_limit_fails() {
        assert!(PatternFilter::compile("maxdepth=twenty;*").is_err());
        assert!(PatternFilter::compile("maxdepth=20").is_err());
    }

    #[test]
    fn dry_run_records_and_flushes_sorted() {
        let target = std::env::temp_dir().join(format!(
            "dryrun-{}.txt",
            uuid::Uuid::new_v4()
        ));
        let filter = DryRunFilter::new(&target);
        assert_eq!(filter.check("com.acme.Y"), FilterDecision::Allowed);
        assert_eq!(filter.check("com.acme.X"), FilterDecision::Allowed);
        assert_eq!(filter.check("com.acme.X[]"), FilterDecision::Allowed);
        filter.flush().unwrap();
        let written = fs::read_to_string(&target).unwrap();
        assert_eq!(written, "com.acme.X\ncom.acme.Y\n");
        fs::remove_file(&target).unwrap();
    }

    #[test]
    fn classpath_resources_resolve_at_the_root_only() {
        assert!(read_filter_lines("classpath:serialization-allowlist.txt").is_ok());
        assert!(read_filter_lines("classpath:sub/dir.txt").is_err());
        assert!(read_filter_lines("classpath:missing.txt").is_err());
    }
}
