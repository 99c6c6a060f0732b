//! Markdown audit-document parser.
//!
//! The parser is deliberately forgiving: a well-formed-prefix document
//! always yields the phases parsed so far, with warnings attached instead
//! of errors. The one non-negotiable rule is fence awareness — a line is
//! "inside a code block" iff an odd number of fence-opener lines
//! (```` ``` ```` or `~~~`) have been seen since the start of the
//! document, and phase headings are only recognized outside code blocks.

use super::{FileAction, FileChangeIntent, Phase};
use regex::Regex;
use std::sync::LazyLock;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(```|~~~)").unwrap());

static PHASE_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^###?\s+Phase\s+(\d+)\s*:\s*(.+?)\s*$").unwrap());

static SECTION_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#{2,4}\s+(Context|Goal|Files|Plan|Verification|Acceptance Criteria|Rollback)\s*$")
        .unwrap()
});

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+(.+?)\s*$").unwrap());

static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*]|\d+[.)])\s+(.*)$").unwrap());

static BACKTICK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());

/// The parsed form of one audit document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAudit {
    /// The document's H1 title, when present.
    pub title: Option<String>,
    /// Everything before the first phase heading (the setup block),
    /// verbatim.
    pub setup: String,
    pub phases: Vec<Phase>,
    /// Document-level warnings (e.g. unterminated fence).
    pub warnings: Vec<String>,
}

pub struct AuditParser;

impl AuditParser {
    /// Parse an audit document. Never fails on well-formed Markdown;
    /// structural problems surface as warnings.
    pub fn parse(content: &str) -> ParsedAudit {
        let lines: Vec<&str> = content.lines().collect();

        let mut title = None;
        let mut warnings = Vec::new();
        let mut in_fence = false;

        // First pass: locate phase headings with the fence-state rule.
        // regions[i] = (number, title, start_line); region extends to the
        // next heading or EOF.
        let mut regions: Vec<(u32, String, usize)> = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if FENCE_RE.is_match(line) {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if title.is_none()
                && let Some(cap) = TITLE_RE.captures(line)
            {
                title = Some(cap[1].to_string());
            }
            if let Some(cap) = PHASE_HEADING_RE.captures(line) {
                let number: u32 = cap[1].parse().unwrap_or(0);
                regions.push((number, cap[2].to_string(), idx));
            }
        }
        if in_fence {
            warnings.push("unterminated code fence at end of document".to_string());
        }

        let setup_end = regions.first().map(|(_, _, start)| *start).unwrap_or(lines.len());
        let setup = lines[..setup_end].join("\n");

        let mut phases = Vec::new();
        for (i, (number, phase_title, start)) in regions.iter().enumerate() {
            let end = regions
                .get(i + 1)
                .map(|(_, _, next)| *next)
                .unwrap_or(lines.len());
            let body = &lines[start + 1..end];
            phases.push(Self::parse_phase(*number, phase_title, body));
        }

        ParsedAudit {
            title,
            setup,
            phases,
            warnings,
        }
    }

    fn parse_phase(number: u32, title: &str, body: &[&str]) -> Phase {
        let mut phase = Phase::new(number, title);

        let mut current_section: Option<String> = None;
        let mut sections: Vec<(String, Vec<String>)> = Vec::new();
        let mut in_fence = false;

        for line in body {
            if FENCE_RE.is_match(line) {
                in_fence = !in_fence;
            }
            if !in_fence
                && let Some(cap) = SECTION_HEADING_RE.captures(line)
            {
                current_section = Some(cap[1].to_string());
                sections.push((cap[1].to_string(), Vec::new()));
                continue;
            }
            if current_section.is_some()
                && let Some((_, section_lines)) = sections.last_mut()
            {
                section_lines.push((*line).to_string());
            }
        }

        for (name, section_lines) in &sections {
            match name.as_str() {
                "Context" => phase.context = first_paragraph(section_lines),
                "Goal" => phase.goal = first_paragraph(section_lines),
                "Files" => {
                    phase.files = section_lines
                        .iter()
                        .filter_map(|l| parse_file_bullet(l, &mut phase.parse_warnings))
                        .collect();
                }
                "Plan" => phase.plan = bullets(section_lines),
                "Verification" => phase.verification = bullets(section_lines),
                "Acceptance Criteria" => phase.acceptance_criteria = bullets(section_lines),
                "Rollback" => phase.rollback = bullets(section_lines),
                _ => {}
            }
        }

        if phase.goal.is_empty() {
            phase
                .parse_warnings
                .push(format!("phase {} has no Goal section", number));
        }
        if phase.files.is_empty() {
            phase
                .parse_warnings
                .push(format!("phase {} has no Files section", number));
        }

        phase
    }
}

/// The first paragraph of a section: the first run of non-blank,
/// non-heading lines, joined by spaces.
fn first_paragraph(lines: &[String]) -> String {
    let mut paragraph = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if paragraph.is_empty() {
                continue;
            }
            break;
        }
        if trimmed.starts_with('#') {
            break;
        }
        paragraph.push(trimmed);
    }
    paragraph.join(" ")
}

/// Bullet items, text preserved verbatim after the marker.
fn bullets(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| BULLET_RE.captures(line).map(|cap| cap[1].to_string()))
        .collect()
}

/// Parse one `Files` bullet into a change intent.
///
/// The action is the leading keyword; the path is the first backticked
/// token. Renames capture the second backticked token as the target.
fn parse_file_bullet(line: &str, warnings: &mut Vec<String>) -> Option<FileChangeIntent> {
    let text = BULLET_RE.captures(line)?.get(1)?.as_str().to_string();
    let first_word = text.split_whitespace().next().unwrap_or("");
    let action = match first_word.to_lowercase().as_str() {
        "create" => FileAction::Create,
        "modify" | "update" | "edit" => FileAction::Modify,
        "delete" | "remove" => FileAction::Delete,
        "rename" | "move" => FileAction::Rename,
        other => {
            if !other.is_empty() {
                warnings.push(format!("unknown file action keyword '{}'", other));
            }
            FileAction::Modify
        }
    };

    let mut paths = BACKTICK_RE.captures_iter(&text);
    let first = paths.next()?.get(1)?.as_str().to_string();

    let (path, old_path) = if action == FileAction::Rename {
        match paths.next().and_then(|c| c.get(1)) {
            Some(second) => (second.as_str().to_string(), Some(first)),
            None => {
                warnings.push(format!("rename bullet missing target path: {}", text));
                (first, None)
            }
        }
    } else {
        (first, None)
    };

    // Description: whatever trails the last backticked path.
    let description = text
        .rsplit('`')
        .next()
        .unwrap_or("")
        .trim_start_matches([' ', '-', ':', ','])
        .trim()
        .to_string();

    Some(FileChangeIntent {
        path,
        action,
        description,
        old_path,
    })
}
