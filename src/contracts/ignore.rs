//! Inline ignore directives.
//!
//! Violations can be suppressed from inside the checked file itself:
//!
//! - `phaser:ignore <rule-ids>` — suppresses matching rules on the same line
//! - `phaser:ignore-next-line <rule-ids>` — suppresses on the next line
//! - `phaser:ignore-all` — suppresses every rule on the same line
//!
//! Rule lists are comma-separated; an empty list means every rule. The
//! directive must sit inside a comment in the file's native comment
//! style; files with an unknown extension have no ignore support.
//! Directives are always parsed from the *proposed* content, not from
//! disk.

use std::collections::HashMap;
use std::path::Path;

const DIRECTIVE_ALL: &str = "phaser:ignore-all";
const DIRECTIVE_NEXT_LINE: &str = "phaser:ignore-next-line";
const DIRECTIVE_SAME_LINE: &str = "phaser:ignore";

/// Comment syntax families, selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentStyle {
    Hash,
    Slash,
    Html,
    CBlock,
}

fn comment_style(path: &str) -> Option<CommentStyle> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "py" | "rb" | "sh" | "yaml" | "yml" | "toml" => Some(CommentStyle::Hash),
        "js" | "ts" | "jsx" | "tsx" | "swift" | "go" | "rs" | "c" | "cpp" | "java" | "kt"
        | "cs" => Some(CommentStyle::Slash),
        "html" | "xml" | "vue" | "svelte" => Some(CommentStyle::Html),
        "css" | "scss" | "less" => Some(CommentStyle::CBlock),
        _ => None,
    }
}

/// Extract the comment text of a line, per style. Returns the text after
/// the comment opener (and before the closer for delimited styles).
fn comment_text<'a>(line: &'a str, style: CommentStyle) -> Option<&'a str> {
    match style {
        CommentStyle::Hash => line.find('#').map(|i| &line[i + 1..]),
        CommentStyle::Slash => line.find("//").map(|i| &line[i + 2..]),
        CommentStyle::Html => {
            let start = line.find("<!--")?;
            let rest = &line[start + 4..];
            Some(rest.find("-->").map(|end| &rest[..end]).unwrap_or(rest))
        }
        CommentStyle::CBlock => {
            let start = line.find("/*")?;
            let rest = &line[start + 2..];
            Some(rest.find("*/").map(|end| &rest[..end]).unwrap_or(rest))
        }
    }
}

/// A scope entry: `None` suppresses every rule, `Some(ids)` only those.
type RuleScope = Option<Vec<String>>;

/// Parsed directive positions for one file's proposed content.
/// Line numbers are 1-indexed.
#[derive(Debug, Default)]
pub struct IgnoreDirectives {
    same_line: HashMap<usize, RuleScope>,
    next_line: HashMap<usize, RuleScope>,
}

impl IgnoreDirectives {
    /// Parse directives from proposed content. Files without a known
    /// comment style yield an empty set.
    pub fn parse(path: &str, content: &str) -> Self {
        let Some(style) = comment_style(path) else {
            return Self::default();
        };

        let mut directives = Self::default();
        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let Some(comment) = comment_text(line, style) else {
                continue;
            };
            let Some(pos) = comment.find(DIRECTIVE_SAME_LINE) else {
                continue;
            };
            let after = &comment[pos..];

            // Longest directive name first; `phaser:ignore` is a prefix
            // of the other two.
            if after.starts_with(DIRECTIVE_ALL) {
                directives.same_line.insert(line_no, None);
            } else if let Some(rest) = after.strip_prefix(DIRECTIVE_NEXT_LINE) {
                directives.next_line.insert(line_no, parse_rule_list(rest));
            } else if let Some(rest) = after.strip_prefix(DIRECTIVE_SAME_LINE) {
                directives.same_line.insert(line_no, parse_rule_list(rest));
            }
        }
        directives
    }

    /// Whether a violation of `rule_id` on `line` (1-indexed) is suppressed.
    pub fn is_suppressed(&self, line: usize, rule_id: &str) -> bool {
        if scope_matches(self.same_line.get(&line), rule_id) {
            return true;
        }
        line > 1 && scope_matches(self.next_line.get(&(line - 1)), rule_id)
    }

    pub fn is_empty(&self) -> bool {
        self.same_line.is_empty() && self.next_line.is_empty()
    }
}

fn scope_matches(scope: Option<&RuleScope>, rule_id: &str) -> bool {
    match scope {
        None => false,
        Some(None) => true,
        // Rule IDs compare case-sensitively; unknown IDs in the list are
        // inert rather than errors.
        Some(Some(ids)) => ids.is_empty() || ids.iter().any(|id| id == rule_id),
    }
}

/// Parse the comma-separated rule list trailing a directive. An empty
/// list means every rule.
fn parse_rule_list(rest: &str) -> RuleScope {
    let ids: Vec<String> = rest
        .split(',')
        .map(|token| {
            token
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .collect();
    Some(ids)
}
