//! Path algebra over `/`-separated strings
//!
//! Every path handled by the inventories, the diff engine and the storages
//! is a plain string using `/` as separator, whatever the host OS is. The
//! host separator only appears at local-storage boundaries through
//! [`to_sys`] and [`from_sys`].
//!
//! Directory paths end with the separator (see [`normalize_dir`]). Paths
//! compare byte-wise, which is the order SQLite's `BINARY` collation uses
//! and the order the diff engine merges on.

/// Path separator used by all inventories and storages.
pub const SEP: char = '/';

/// A path algebra parameterised by its separator.
///
/// The free functions of this module are shorthands for [`Separator::SLASH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separator(pub char);

impl Separator {
    /// The `/` separator.
    pub const SLASH: Separator = Separator(SEP);

    /// Appends the separator if absent.
    pub fn normalize_dir(&self, path: &str) -> String {
        if path.ends_with(self.0) {
            path.to_string()
        } else {
            let mut out = String::with_capacity(path.len() + 1);
            out.push_str(path);
            out.push(self.0);
            out
        }
    }

    /// Strips trailing separators. The root stays the root.
    pub fn denormalize_dir<'a>(&self, path: &'a str) -> &'a str {
        let trimmed = path.trim_end_matches(self.0);
        if trimmed.is_empty() && !path.is_empty() {
            &path[..self.0.len_utf8()]
        } else {
            trimmed
        }
    }

    /// Returns true if `path` is `container` or lies below it.
    pub fn contains(&self, container: &str, path: &str) -> bool {
        self.normalize_dir(path)
            .starts_with(&self.normalize_dir(container))
    }

    /// Splits a path into `(head, tail)` the way POSIX `dirname`/`basename` do.
    ///
    /// A trailing separator yields an empty tail: `split("/a/b/") == ("/a/b", "")`.
    pub fn split<'a>(&self, path: &'a str) -> (&'a str, &'a str) {
        match path.rfind(self.0) {
            None => ("", path),
            Some(idx) => {
                let head = &path[..idx + self.0.len_utf8()];
                let tail = &path[idx + self.0.len_utf8()..];
                let stripped = head.trim_end_matches(self.0);
                if stripped.is_empty() {
                    (head, tail)
                } else {
                    (stripped, tail)
                }
            }
        }
    }

    /// Parent directory of `path` (ignoring a trailing separator).
    pub fn dirname<'a>(&self, path: &'a str) -> &'a str {
        self.split(self.denormalize_dir(path)).0
    }

    /// Last non-empty segment of `path`.
    pub fn basename<'a>(&self, path: &'a str) -> &'a str {
        self.split(self.denormalize_dir(path)).1
    }

    /// Joins two paths. An absolute `b` replaces `a`.
    pub fn join(&self, a: &str, b: &str) -> String {
        if b.starts_with(self.0) || a.is_empty() {
            return b.to_string();
        }
        if a.ends_with(self.0) {
            format!("{a}{b}")
        } else {
            format!("{a}{}{b}", self.0)
        }
    }

    /// Joins two paths and resolves `.` and `..` segments.
    ///
    /// `..` never climbs above the root: `join_properly("/", "..") == "/"`.
    pub fn join_properly(&self, a: &str, b: &str) -> String {
        let joined = self.join(a, b);
        let absolute = joined.starts_with(self.0);
        let mut segments: Vec<&str> = Vec::new();

        for segment in joined.split(self.0) {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }

        let sep = self.0.to_string();
        let body = segments.join(&sep);
        if absolute {
            format!("{sep}{body}")
        } else {
            body
        }
    }

    /// Strips `prefix` from `path`.
    ///
    /// Returns `None` when `path` is not contained in `prefix`. The prefix
    /// itself maps to the empty string.
    pub fn cut_prefix(&self, path: &str, prefix: &str) -> Option<String> {
        let dir_prefix = self.normalize_dir(prefix);
        if let Some(rest) = path.strip_prefix(dir_prefix.as_str()) {
            return Some(rest.to_string());
        }
        if self.denormalize_dir(path) == self.denormalize_dir(prefix) {
            return Some(String::new());
        }
        None
    }

    /// Non-empty segments of `path`, left to right.
    pub fn segments<'a>(&self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let sep = self.0;
        path.split(sep).filter(|s| !s.is_empty())
    }

    /// Number of non-empty segments of `path`.
    pub fn depth(&self, path: &str) -> usize {
        self.segments(path).count()
    }
}

/// See [`Separator::normalize_dir`].
pub fn normalize_dir(path: &str) -> String {
    Separator::SLASH.normalize_dir(path)
}

/// See [`Separator::denormalize_dir`].
pub fn denormalize_dir(path: &str) -> &str {
    Separator::SLASH.denormalize_dir(path)
}

/// See [`Separator::contains`].
pub fn contains(container: &str, path: &str) -> bool {
    Separator::SLASH.contains(container, path)
}

/// See [`Separator::split`].
pub fn split(path: &str) -> (&str, &str) {
    Separator::SLASH.split(path)
}

/// See [`Separator::dirname`].
pub fn dirname(path: &str) -> &str {
    Separator::SLASH.dirname(path)
}

/// See [`Separator::basename`].
pub fn basename(path: &str) -> &str {
    Separator::SLASH.basename(path)
}

/// See [`Separator::join`].
pub fn join(a: &str, b: &str) -> String {
    Separator::SLASH.join(a, b)
}

/// See [`Separator::join_properly`].
pub fn join_properly(a: &str, b: &str) -> String {
    Separator::SLASH.join_properly(a, b)
}

/// See [`Separator::cut_prefix`].
pub fn cut_prefix(path: &str, prefix: &str) -> Option<String> {
    Separator::SLASH.cut_prefix(path, prefix)
}

/// See [`Separator::depth`].
pub fn depth(path: &str) -> usize {
    Separator::SLASH.depth(path)
}

/// Converts a `/` path into the host's native separator.
pub fn to_sys(path: &str) -> String {
    if std::path::MAIN_SEPARATOR == SEP {
        path.to_string()
    } else {
        path.replace(SEP, std::path::MAIN_SEPARATOR_STR)
    }
}

/// Converts a host path into a `/` path.
pub fn from_sys(path: &str) -> String {
    if std::path::MAIN_SEPARATOR == SEP {
        path.to_string()
    } else {
        path.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_and_denormalize() {
        assert_eq!(normalize_dir("/a/b"), "/a/b/");
        assert_eq!(normalize_dir("/a/b/"), "/a/b/");
        assert_eq!(normalize_dir(""), "/");
        assert_eq!(denormalize_dir("/a/b///"), "/a/b");
        assert_eq!(denormalize_dir("/"), "/");
        assert_eq!(denormalize_dir(""), "");
    }

    #[test]
    fn contains_is_reflexive_and_inherited() {
        for p in ["/", "/a", "/a/b/", "rel/x"] {
            assert!(contains(p, p));
            assert!(contains(p, &join(p, "x")));
            assert!(contains(p, &join(&join(p, "x"), "y/")));
        }
        assert!(!contains("/a/b", "/a/bc"));
        assert!(contains("/a/b", "/a/b/c"));
    }

    #[test]
    fn split_behaves_like_posix() {
        assert_eq!(split("/a/b"), ("/a", "b"));
        assert_eq!(split("/a/b/"), ("/a/b", ""));
        assert_eq!(split("/a"), ("/", "a"));
        assert_eq!(split("a"), ("", "a"));
        assert_eq!(dirname("/a/b/"), "/a");
        assert_eq!(basename("/a/b/"), "b");
    }

    #[test]
    fn cut_prefix_inverts_join() {
        let cases = [("/a", "b"), ("/a/", "b/c"), ("/", "x/"), ("/p/q", "r.txt")];
        for (a, b) in cases {
            assert_eq!(cut_prefix(&join(a, b), a).as_deref(), Some(b));
        }
        assert_eq!(cut_prefix("/a/", "/a").as_deref(), Some(""));
        assert_eq!(cut_prefix("/b/c", "/a"), None);
    }

    #[test]
    fn join_properly_resolves_dots() {
        assert_eq!(join_properly("/a/b", ".."), "/a");
        assert_eq!(join_properly("/", ".."), "/");
        assert_eq!(join_properly("/a", "./b/../c"), "/a/c");
        assert_eq!(join_properly("/a", "/x/y"), "/x/y");
    }

    #[test]
    fn custom_separator() {
        let sep = Separator('\\');
        assert_eq!(sep.join("C:\\a", "b"), "C:\\a\\b");
        assert_eq!(sep.normalize_dir("C:\\a"), "C:\\a\\");
        assert_eq!(sep.split("C:\\a\\b"), ("C:\\a", "b"));
    }

    #[test]
    fn depth_counts_non_empty_segments() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a/b/"), 2);
        assert_eq!(depth("/a/b/c.txt"), 3);
    }

    #[test]
    fn byte_wise_ordering_places_siblings_before_dir_contents() {
        let mut paths = vec!["a/", "a.txt", "a/x", "a0"];
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "a/", "a/x", "a0"]);
    }
}
