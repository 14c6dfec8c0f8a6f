use std::collections::HashSet;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

const GLOB_CHARS: &[char] = &['*', '?', '[', '{', '\\'];

/// A compiled list of patterns that matches if any of its patterns matches.
///
/// Patterns without glob syntax are matched by exact comparison. All others are compiled into a
/// single [`GlobSet`]. Separators carry no meaning, so `*` matches any sequence of characters
/// including dots and slashes.
#[derive(Clone, Debug)]
pub struct PatternSet {
    exact: HashSet<String>,
    globs: Option<GlobSet>,
}

impl PatternSet {
    /// Compiles a list of patterns.
    ///
    /// Returns the pattern that failed to compile alongside the error.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, (String, globset::Error)> {
        let mut exact = HashSet::new();
        let mut builder = GlobSetBuilder::new();
        let mut has_globs = false;

        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !pattern.contains(GLOB_CHARS) {
                exact.insert(pattern.to_owned());
                continue;
            }

            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .backslash_escape(true)
                .build()
                .map_err(|e| (pattern.to_owned(), e))?;
            builder.add(glob);
            has_globs = true;
        }

        let globs = match has_globs {
            true => Some(builder.build().map_err(|e| (String::new(), e))?),
            false => None,
        };

        Ok(Self { exact, globs })
    }

    /// Returns `true` if any pattern matches the value.
    pub fn is_match(&self, value: &str) -> bool {
        self.exact.contains(value) || self.globs.as_ref().is_some_and(|g| g.is_match(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_glob() {
        let set = PatternSet::compile(&["mem", "cpu*", "disk.?"]).unwrap();
        assert!(set.is_match("mem"));
        assert!(!set.is_match("memory"));
        assert!(set.is_match("cpu"));
        assert!(set.is_match("cpu.usage/total"));
        assert!(set.is_match("disk.a"));
        assert!(!set.is_match("disk.ab"));
    }

    #[test]
    fn test_alternation_and_class() {
        let set = PatternSet::compile(&["{cpu,mem}_*", "net[0-9]"]).unwrap();
        assert!(set.is_match("cpu_idle"));
        assert!(set.is_match("mem_free"));
        assert!(!set.is_match("disk_free"));
        assert!(set.is_match("net4"));
        assert!(!set.is_match("neta"));
    }

    #[test]
    fn test_case_sensitive() {
        let set = PatternSet::compile(&["CPU*"]).unwrap();
        assert!(!set.is_match("cpu_usage"));
    }

    #[test]
    fn test_invalid_pattern() {
        let (pattern, _) = PatternSet::compile(&["ok", "cpu[a"]).unwrap_err();
        assert_eq!(pattern, "cpu[a");
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        let set = PatternSet::compile::<&str>(&[]).unwrap();
        assert!(!set.is_match(""));
        assert!(!set.is_match("cpu"));
    }
}
