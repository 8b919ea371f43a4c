//! Parses one block of rule-language text into rules.
//!
//! The scripting host emits blocks in a mk-flavored line syntax:
//!
//! ```text
//! cc = gcc
//! include sub
//!
//! hello: hello.o
//!     $cc hello.o -o hello
//! %.o:D[%.d]: %.c
//!     $cc -MD -MF $dep -c $input -o $output
//! ```
//!
//! A header is `TARGETS : PREREQS` or `TARGETS : ATTRS : PREREQS`;
//! indented lines below it form the recipe. `include NAME` references
//! another rule set, returned to the caller for recursive resolution.

use regex::Regex;

use crate::error::{KnitError, Result};
use crate::rules::{Attrs, Rule, RuleSet, SourceLoc, Target};

/// Attribute letters accepted between the two colons of a rule header.
///
/// `V` virtual, `B` always rebuild, `N` nometa, `Q` quiet, `K`
/// keep-going, `E` no-fail, `L` linked multi-output, `R` regex targets,
/// `D[path]` dep-file pattern.
#[derive(Debug, Default)]
struct HeaderAttrs {
    attrs: Attrs,
    regex: bool,
}

/// Append the rules in `text` to `set`, returning the names of further
/// rule sets referenced by `include` lines, in first-appearance order.
pub fn parse_into(text: &str, set: &mut RuleSet, file: &str) -> Result<Vec<String>> {
    let mut refs: Vec<String> = Vec::new();
    let mut current: Option<Rule> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;

        if raw.starts_with([' ', '\t']) {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            match current.as_mut() {
                Some(rule) => rule.recipe.push(line.to_string()),
                None => return Err(parse_err(file, line_no, "recipe line outside a rule")),
            }
            continue;
        }

        // Any non-indented line closes the rule being collected.
        if let Some(rule) = current.take() {
            set.rules.push(rule);
        }

        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix("include ") {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(parse_err(file, line_no, "include without a rule-set name"));
            }
            if !refs.contains(&name) {
                refs.push(name);
            }
            continue;
        }

        if let Some((key, value)) = split_assignment(line) {
            set.vars.insert(key.to_string(), value.to_string());
            continue;
        }

        current = Some(parse_header(line, file, line_no)?);
    }

    if let Some(rule) = current.take() {
        set.rules.push(rule);
    }

    Ok(refs)
}

/// `name = value` with an identifier key and no colon before the `=`.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let eq = line.find('=')?;
    let key = line[..eq].trim();
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((key, line[eq + 1..].trim()))
}

fn parse_header(line: &str, file: &str, line_no: usize) -> Result<Rule> {
    let loc = SourceLoc {
        file: file.to_string(),
        line: line_no,
    };

    let mut parts = line.splitn(3, ':');
    let targets_part = parts.next().unwrap_or_default();
    let second = match parts.next() {
        Some(s) => s,
        None => return Err(parse_err(file, line_no, "expected ':' in rule header")),
    };
    let third = parts.next();

    let (header_attrs, prereqs_part) = match third {
        Some(rest) => match parse_attrs(second.trim()) {
            Some(h) => (h, rest.to_string()),
            // Not an attribute string: the colon belonged to a path.
            None => (HeaderAttrs::default(), format!("{}:{}", second, rest)),
        },
        None => (HeaderAttrs::default(), second.to_string()),
    };

    let target_names: Vec<&str> = targets_part.split_whitespace().collect();
    if target_names.is_empty() {
        return Err(parse_err(file, line_no, "rule has no targets"));
    }

    let mut targets = Vec::with_capacity(target_names.len());
    for name in target_names {
        targets.push(parse_target(name, header_attrs.regex, file, line_no)?);
    }

    let prereqs: Vec<String> = prereqs_part
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mut rule = Rule::new(targets, prereqs, loc);
    rule.attrs = header_attrs.attrs;

    if !rule.is_meta() {
        if let Some(p) = rule.prereqs.iter().find(|p| p.contains('%')) {
            return Err(parse_err(
                file,
                line_no,
                &format!("'%' in prerequisite '{}' outside a meta rule", p),
            ));
        }
    }
    Ok(rule)
}

fn parse_target(name: &str, regex: bool, file: &str, line_no: usize) -> Result<Target> {
    if regex {
        let anchored = format!("^(?:{})$", name);
        return Regex::new(&anchored)
            .map(Target::MetaRegex)
            .map_err(|e| parse_err(file, line_no, &format!("bad target regex '{}': {}", name, e)));
    }
    match name.matches('%').count() {
        0 => Ok(Target::Plain(name.to_string())),
        1 => Ok(Target::MetaPercent(name.to_string())),
        _ => Err(parse_err(
            file,
            line_no,
            &format!("target pattern '{}' has more than one '%'", name),
        )),
    }
}

fn parse_attrs(s: &str) -> Option<HeaderAttrs> {
    let mut out = HeaderAttrs::default();
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            'V' => out.attrs.virtual_ = true,
            'B' => out.attrs.rebuild = true,
            'N' => out.attrs.nometa = true,
            'Q' => out.attrs.quiet = true,
            'K' => out.attrs.keep_going = true,
            'E' => out.attrs.no_fail = true,
            'L' => out.attrs.linked = true,
            'R' => out.regex = true,
            'D' => {
                if !matches!(chars.peek(), Some((_, '['))) {
                    return None;
                }
                let rest = &s[i + 2..];
                let close = rest.find(']')?;
                out.attrs.dep = Some(rest[..close].to_string());
                // Skip past the bracketed pattern.
                while let Some((_, c)) = chars.next() {
                    if c == ']' {
                        break;
                    }
                }
            }
            _ => return None,
        }
    }
    Some(out)
}

fn parse_err(file: &str, line: usize, msg: &str) -> KnitError {
    KnitError::Parse {
        file: file.to_string(),
        line,
        msg: msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<(RuleSet, Vec<String>)> {
        let mut set = RuleSet::new("root", "");
        let refs = parse_into(text, &mut set, "knitfile")?;
        Ok((set, refs))
    }

    #[test]
    fn test_parse_plain_rule_with_recipe() {
        let (set, refs) = parse("hello: hello.o\n\tcc hello.o -o hello\n").unwrap();
        assert!(refs.is_empty());
        assert_eq!(set.rules.len(), 1);
        let rule = &set.rules[0];
        assert_eq!(rule.targets, vec![Target::Plain("hello".to_string())]);
        assert_eq!(rule.prereqs, vec!["hello.o".to_string()]);
        assert_eq!(rule.recipe, vec!["cc hello.o -o hello".to_string()]);
        assert_eq!(rule.loc.line, 1);
    }

    #[test]
    fn test_parse_percent_rule() {
        let (set, _) = parse("%.o: %.c\n\tcc -c $input -o $output\n").unwrap();
        let rule = &set.rules[0];
        assert_eq!(rule.targets, vec![Target::MetaPercent("%.o".to_string())]);
        assert!(rule.is_meta());
    }

    #[test]
    fn test_parse_attrs_between_colons() {
        let (set, _) = parse("all:VBN: hello goodbye\n").unwrap();
        let rule = &set.rules[0];
        assert!(rule.attrs.virtual_);
        assert!(rule.attrs.rebuild);
        assert!(rule.attrs.nometa);
        assert_eq!(rule.prereqs.len(), 2);
    }

    #[test]
    fn test_parse_dep_attr() {
        let (set, _) = parse("%.o:D[%.d]: %.c\n\tcc -MD -c $input\n").unwrap();
        assert_eq!(set.rules[0].attrs.dep.as_deref(), Some("%.d"));
    }

    #[test]
    fn test_parse_regex_rule() {
        let (set, _) = parse("(\\w+)\\.bin:R: \\1.s\n").unwrap();
        match &set.rules[0].targets[0] {
            Target::MetaRegex(re) => assert!(re.is_match("boot.bin")),
            other => panic!("expected regex target, got {:?}", other),
        }
    }

    #[test]
    fn test_colon_in_prereq_path_is_not_attrs() {
        // The middle segment has whitespace, so it cannot be an attr
        // string and the second colon belongs to the prerequisite list.
        let (set, _) = parse("out: a b: c\n").unwrap();
        assert_eq!(set.rules[0].prereqs, vec!["a", "b:", "c"]);
    }

    #[test]
    fn test_include_and_vars() {
        let text = "cc = gcc\ninclude sub\ninclude sub\nall:V: sub/out\n";
        let (set, refs) = parse(text).unwrap();
        assert_eq!(refs, vec!["sub".to_string()]);
        assert_eq!(set.vars.get("cc").map(String::as_str), Some("gcc"));
    }

    #[test]
    fn test_two_percent_targets_rejected() {
        let err = parse("%.%.o: x\n").unwrap_err();
        assert!(matches!(err, KnitError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_recipe_outside_rule_rejected() {
        let err = parse("\techo hi\n").unwrap_err();
        assert!(matches!(err, KnitError::Parse { .. }));
    }

    #[test]
    fn test_percent_prereq_outside_meta_rejected() {
        let err = parse("hello: %.c\n").unwrap_err();
        assert!(matches!(err, KnitError::Parse { .. }));
    }

    #[test]
    fn test_comments_and_blanks_ignored() {
        let (set, _) = parse("# build rules\n\nhello: hello.o\n\n\tcc -o hello hello.o\n").unwrap();
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.rules[0].recipe.len(), 1);
    }

    #[test]
    fn test_multiple_rules_close_correctly() {
        let text = "a: b\n\tmake-a\nb:\n\tmake-b\n";
        let (set, _) = parse(text).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].recipe, vec!["make-a".to_string()]);
        assert_eq!(set.rules[1].recipe, vec!["make-b".to_string()]);
    }
}
