//! Makefile-style dependency files, as emitted by `cc -MD -MF <path>`.
//!
//! Lines have the form `TARGETS : PREREQS`, with backslash
//! continuations and `#` comments. Only the prerequisite side matters
//! here; the targets are already known to the rule that declared the
//! dep-file.

/// Extract the prerequisite paths from dep-file content, in order of
/// first appearance.
pub fn parse(content: &str) -> Vec<String> {
    let mut prereqs: Vec<String> = Vec::new();

    for logical in logical_lines(content) {
        let line = match logical.find('#') {
            Some(pos) => &logical[..pos],
            None => &logical,
        };
        let Some(colon) = line.find(':') else {
            continue;
        };
        for path in line[colon + 1..].split_whitespace() {
            if !prereqs.iter().any(|p| p == path) {
                prereqs.push(path.to_string());
            }
        }
    }

    prereqs
}

/// Join backslash-continued lines.
fn logical_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut joined = String::new();
    for line in content.lines() {
        let trimmed = line.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            joined.push_str(stripped);
            joined.push(' ');
        } else {
            joined.push_str(trimmed);
            lines.push(std::mem::take(&mut joined));
        }
    }
    if !joined.is_empty() {
        lines.push(joined);
    }
    lines
}
