//! Glob matching for the includes/excludes file lists.
//!
//! Compiles shell globs (`*`, `?`, `[...]`) to `regex` patterns rather than
//! pulling in a dedicated glob crate — `regex` is already part of the
//! dependency set.

use regex::Regex;

/// A single compiled glob pattern, matched against a file's relative path.
pub struct GlobPattern {
    regex: Regex,
}

impl GlobPattern {
    pub fn compile(pattern: &str) -> Result<GlobPattern, regex::Error> {
        let regex = Regex::new(&glob_to_regex(pattern))?;
        Ok(GlobPattern { regex })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Translate a single shell glob into an anchored regex source string.
/// Supports `*` (any run of characters, including none), `?` (exactly one
/// character), and `[...]` character classes. `*` does not cross `/` so that
/// patterns behave like filename globs rather than matching whole paths.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if let Some(&next) = chars.peek() {
                    if next == '!' {
                        out.push('^');
                        chars.next();
                    }
                }
                for c2 in chars.by_ref() {
                    out.push(c2);
                    if c2 == ']' {
                        break;
                    }
                }
            }
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    out
}

/// Load one glob pattern per non-empty, non-comment line of `contents`, the
/// format used by the includes/excludes files.
pub fn parse_pattern_file(contents: &str) -> Result<Vec<GlobPattern>, regex::Error> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(GlobPattern::compile)
        .collect()
}
