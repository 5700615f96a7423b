//! Glob patterns over `/`-separated storage paths.
//!
//! Supported syntax: `**` (any run of characters, including `/`), `*` (within one
//! segment), `?` (one character within a segment), `{a,b,c}` alternation (nestable)
//! and `\` to escape the next character.

use regex::Regex;

use crate::error::StoreError;

const META: [char; 4] = ['*', '?', '{', '\\'];

#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        let source = translate(pattern).map_err(|reason| invalid(&reason))?;
        let regex = Regex::new(&source).map_err(|err| invalid(&err.to_string()))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Literal text before the first wildcard.
    pub fn literal_prefix(&self) -> &str {
        literal_prefix(&self.pattern)
    }
}

/// Literal text of `pattern` before its first wildcard.
pub fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(META) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

/// Split `pattern` into a literal directory prefix (ending in `/`, possibly empty)
/// and the remaining glob.
pub fn split_directory_prefix(pattern: &str) -> (&str, &str) {
    let literal = literal_prefix(pattern);
    match literal.rfind('/') {
        Some(idx) => pattern.split_at(idx + 1),
        None => ("", pattern),
    }
}

fn translate(pattern: &str) -> Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut depth = 0usize;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                i += 1;
                if chars.get(i + 1) == Some(&'/') {
                    i += 1;
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' => {
                depth += 1;
                out.push_str("(?:");
            }
            ',' if depth > 0 => out.push('|'),
            '}' if depth > 0 => {
                depth -= 1;
                out.push(')');
            }
            '}' => return Err("unmatched '}'".to_string()),
            '\\' => {
                i += 1;
                let escaped = chars
                    .get(i)
                    .ok_or_else(|| "dangling escape at end of pattern".to_string())?;
                out.push_str(&regex::escape(&escaped.to_string()));
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    if depth != 0 {
        return Err("unclosed '{'".to_string());
    }
    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> Glob {
        Glob::new(p).expect("pattern should compile")
    }

    #[test]
    fn star_stays_within_segment() {
        let g = glob("repo/-/pkg/@*/deploy/*");
        assert!(g.is_match("repo/-/pkg/@abc/deploy/staging"));
        assert!(g.is_match("repo/-/pkg/@/deploy/staging"));
        assert!(!g.is_match("repo/-/pkg/@abc/deploy/staging/1"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let g = glob("**/+*/custom/**");
        assert!(g.is_match("repo/-/pkg/+/custom/x"));
        assert!(g.is_match("-/pkg/+/custom/a/b"));
        assert!(g.is_match("github.com/acme/app/-/ci/pkg.star/+/custom/x"));
        assert!(!g.is_match("repo/-/pkg/@abc/custom/x"));

        let g = glob("a/**/b");
        assert!(g.is_match("a/b"));
        assert!(g.is_match("a/x/y/b"));
        assert!(!g.is_match("a/xb"));
    }

    #[test]
    fn alternation_and_question_mark() {
        let g = glob("@?*/{deploy,task}/*/*");
        assert!(g.is_match("@rel/deploy/prod/1"));
        assert!(g.is_match("@rel/task/migrate/2"));
        assert!(!g.is_match("@rel/custom/x/1"));
        assert!(!g.is_match("@/deploy/prod/1"));

        let g = glob("{a,b{c,d}}");
        assert!(g.is_match("bd"));
        assert!(!g.is_match("b"));
    }

    #[test]
    fn metacharacters_of_regex_are_literal() {
        let g = glob("github.com/a+b/x");
        assert!(g.is_match("github.com/a+b/x"));
        assert!(!g.is_match("githubXcom/a+b/x"));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!(matches!(
            Glob::new("{a,b"),
            Err(StoreError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Glob::new("a}"),
            Err(StoreError::InvalidPattern { .. })
        ));
        assert!(matches!(
            Glob::new("a\\"),
            Err(StoreError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn directory_prefix_split() {
        assert_eq!(
            split_directory_prefix("repo/-/pkg/@abc/deploy/*/*"),
            ("repo/-/pkg/@abc/deploy/", "*/*")
        );
        assert_eq!(split_directory_prefix("**/op/*"), ("", "**/op/*"));
        assert_eq!(
            split_directory_prefix("repo/-/pkg/+/custom/x"),
            ("repo/-/pkg/+/custom/", "x")
        );
        assert_eq!(literal_prefix("repo/-/p{a,b}"), "repo/-/p");
    }
}
