//! Include/exclude rules
//!
//! Rules are evaluated in declaration order and the last rule with a
//! matching pattern decides. A path no rule matches is included. Patterns
//! are globs matched against the folder-relative path (without the trailing
//! `/` of directories) and against its last segment, so `*.tmp` excludes
//! temporary files at any depth while `build/*` only matches at the top.

use encsync_core::config::{PatternKind, PatternRule};
use encsync_core::domain::path;
use glob::{MatchOptions, Pattern};

use crate::SyncError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct CompiledRule {
    include: bool,
    patterns: Vec<Pattern>,
}

/// Compiled include/exclude rule list
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    rules: Vec<CompiledRule>,
}

impl PathFilter {
    pub fn new(rules: &[PatternRule]) -> Result<Self, SyncError> {
        let rules = rules
            .iter()
            .map(|rule| {
                let patterns = rule
                    .patterns
                    .iter()
                    .map(|p| {
                        Pattern::new(p).map_err(|e| SyncError::Pattern {
                            pattern: p.clone(),
                            message: e.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledRule {
                    include: rule.kind == PatternKind::Include,
                    patterns,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;
        Ok(Self { rules })
    }

    /// A filter that includes everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the folder-relative `rel` path is included. The folder root
    /// (`""`) always is.
    pub fn includes(&self, rel: &str) -> bool {
        let trimmed = rel.trim_matches(path::SEP);
        if trimmed.is_empty() {
            return true;
        }
        let name = path::basename(trimmed);

        let mut included = true;
        for rule in &self.rules {
            let matched = rule.patterns.iter().any(|p| {
                p.matches_with(trimmed, MATCH_OPTIONS) || p.matches_with(name, MATCH_OPTIONS)
            });
            if matched {
                included = rule.include;
            }
        }
        included
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(kind: PatternKind, patterns: &[&str]) -> PatternRule {
        PatternRule {
            kind,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_filter_includes_everything() {
        let filter = PathFilter::allow_all();
        assert!(filter.includes(""));
        assert!(filter.includes("a/b/c.txt"));
    }

    #[test]
    fn test_last_matching_rule_wins() {
        let filter = PathFilter::new(&[
            rule(PatternKind::Exclude, &["*.log"]),
            rule(PatternKind::Include, &["keep.log"]),
        ])
        .unwrap();

        assert!(!filter.includes("debug.log"));
        assert!(!filter.includes("deep/dir/debug.log"));
        assert!(filter.includes("keep.log"));
        assert!(filter.includes("deep/keep.log"));
        assert!(filter.includes("notes.txt"));
    }

    #[test]
    fn test_directory_patterns() {
        let filter = PathFilter::new(&[rule(PatternKind::Exclude, &["build", "cache/*"])]).unwrap();

        assert!(!filter.includes("build/"));
        assert!(!filter.includes("src/build/"));
        assert!(!filter.includes("cache/x"));
        assert!(filter.includes("cache/"));
        assert!(filter.includes("src/cache/x"));
        assert!(filter.includes(""));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let result = PathFilter::new(&[rule(PatternKind::Exclude, &["[unclosed"])]);
        assert!(matches!(result, Err(SyncError::Pattern { .. })));
    }
}
