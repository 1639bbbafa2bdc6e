//! SQL helper functions.
//!
//! Key patterns are glob-style (`*` and `?`). They are pushed down to `SQLite`
//! as an escaped `LIKE` prefilter and then confirmed with [`glob_matches`],
//! because `LIKE` folds ASCII case.

/// Escapes SQL LIKE wildcards so they match literally.
///
/// Requires `ESCAPE '\'` on the LIKE clause.
///
/// ```
/// use swarmkernel::storage::sqlite::escape_like_wildcards;
///
/// assert_eq!(escape_like_wildcards("100%"), "100\\%");
/// assert_eq!(escape_like_wildcards("user_name"), "user\\_name");
/// ```
#[must_use]
pub fn escape_like_wildcards(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '_' | '\\' => {
                result.push('\\');
                result.push(c);
            },
            _ => result.push(c),
        }
    }
    result
}

/// Converts a glob pattern to an escaped SQL LIKE pattern.
///
/// ```
/// use swarmkernel::storage::sqlite::glob_to_like_pattern;
///
/// assert_eq!(glob_to_like_pattern("queue/*"), "queue/%");
/// assert_eq!(glob_to_like_pattern("task_?"), "task\\__");
/// ```
#[must_use]
pub fn glob_to_like_pattern(pattern: &str) -> String {
    let mut result = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '%' | '_' | '\\' => {
                result.push('\\');
                result.push(c);
            },
            '*' => result.push('%'),
            '?' => result.push('_'),
            _ => result.push(c),
        }
    }
    result
}

/// Case-sensitive glob match: `*` matches any run of characters, `?` exactly one.
///
/// ```
/// use swarmkernel::storage::sqlite::glob_matches;
///
/// assert!(glob_matches("queue/*", "queue/next"));
/// assert!(!glob_matches("queue/*", "Queue/next"));
/// assert!(glob_matches("agent/?/task", "agent/7/task"));
/// ```
#[must_use]
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some(pi);
                resume = ti;
                pi += 1;
            },
            Some(&c) if c == '?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            },
            _ => match star {
                Some(s) => {
                    pi = s + 1;
                    resume += 1;
                    ti = resume;
                },
                None => return false,
            },
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Builds `?start,?start+1,...` placeholders for an IN list.
#[must_use]
pub fn numbered_placeholders(count: usize, start: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Converts a `u64` to `i64` for binding, saturating at `i64::MAX`.
#[must_use]
pub fn to_sql_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Converts a stored `i64` back to `u64`, clamping negatives to zero.
#[must_use]
pub fn from_sql_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("queue/*", "queue/next", true ; "trailing star")]
    #[test_case("queue/*", "queue/", true ; "star matches empty")]
    #[test_case("queue/*", "queues/next", false ; "prefix mismatch")]
    #[test_case("*", "", true ; "star matches empty text")]
    #[test_case("", "", true ; "empty both")]
    #[test_case("", "a", false ; "empty pattern")]
    #[test_case("a*b*c", "axxbyyc", true ; "multiple stars")]
    #[test_case("a*b*c", "axxbyy", false ; "missing suffix")]
    #[test_case("agent/?/task", "agent/42/task", false ; "question is one char")]
    #[test_case("agent/??/task", "agent/42/task", true ; "two questions")]
    #[test_case("100%", "100%", true ; "literal percent")]
    #[test_case("a_c", "abc", false ; "underscore is literal")]
    #[test_case("Queue", "queue", false ; "case sensitive")]
    fn test_glob_matches(pattern: &str, text: &str, expected: bool) {
        assert_eq!(glob_matches(pattern, text), expected);
    }

    #[test]
    fn test_glob_to_like_escapes_literals() {
        assert_eq!(glob_to_like_pattern("foo%*bar"), "foo\\%%bar");
        assert_eq!(glob_to_like_pattern("path\\x"), "path\\\\x");
        assert_eq!(escape_like_wildcards("plain"), "plain");
    }

    #[test]
    fn test_numbered_placeholders() {
        assert_eq!(numbered_placeholders(3, 2), "?2,?3,?4");
        assert_eq!(numbered_placeholders(0, 1), "");
    }

    #[test]
    fn test_i64_conversions_saturate() {
        assert_eq!(to_sql_i64(u64::MAX), i64::MAX);
        assert_eq!(from_sql_i64(-5), 0);
        assert_eq!(from_sql_i64(to_sql_i64(42)), 42);
    }
}
