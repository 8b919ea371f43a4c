pub mod depfile;
pub mod parse;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use regex::Regex;

/// Where a rule was declared, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: String,
    pub line: usize,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A single target specification of a rule.
#[derive(Debug, Clone)]
pub enum Target {
    /// A concrete path or virtual name.
    Plain(String),
    /// A pattern with exactly one `%` placeholder.
    MetaPercent(String),
    /// An anchored regular expression.
    MetaRegex(Regex),
}

impl Target {
    pub fn is_meta(&self) -> bool {
        !matches!(self, Target::Plain(_))
    }

    /// The literal text the target was declared with.
    pub fn pattern(&self) -> &str {
        match self {
            Target::Plain(s) | Target::MetaPercent(s) => s,
            Target::MetaRegex(re) => re.as_str(),
        }
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Target::Plain(a), Target::Plain(b)) => a == b,
            (Target::MetaPercent(a), Target::MetaPercent(b)) => a == b,
            (Target::MetaRegex(a), Target::MetaRegex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for Target {}

/// Boolean rule attributes plus the optional dep-file pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs {
    pub virtual_: bool,
    pub rebuild: bool,
    pub nometa: bool,
    pub quiet: bool,
    pub keep_going: bool,
    pub no_fail: bool,
    pub linked: bool,
    pub dep: Option<String>,
}

/// The result of matching a rule against a concrete target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// The concrete target the match was made for.
    pub target: String,
    /// The `%` substring for a percent rule.
    pub stem: Option<String>,
    /// Regex capture groups, group 0 first. Empty for percent and plain
    /// rules.
    pub captures: Vec<String>,
}

impl RuleMatch {
    /// The value the `$match` recipe variable expands to.
    pub fn match_text(&self) -> &str {
        match &self.stem {
            Some(s) => s,
            None => self.captures.first().map(|s| s.as_str()).unwrap_or(""),
        }
    }

    fn plain(target: &str) -> Self {
        Self {
            target: target.to_string(),
            stem: None,
            captures: Vec::new(),
        }
    }
}

/// An immutable build rule: target patterns, prerequisites, a recipe
/// template, and attributes. Meta rules (percent or regex targets) are
/// instantiated per concrete target before they enter the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub targets: Vec<Target>,
    pub prereqs: Vec<String>,
    pub recipe: Vec<String>,
    pub attrs: Attrs,
    pub loc: SourceLoc,
}

/// How specific a match is, for picking among competing rules. Orders
/// plain before percent before regex, then shorter stems first, so the
/// natural `Ord` on the tuple is "most specific first".
pub type Specificity = (u8, usize);

impl Rule {
    pub fn new(targets: Vec<Target>, prereqs: Vec<String>, loc: SourceLoc) -> Self {
        Self {
            targets,
            prereqs,
            recipe: Vec::new(),
            attrs: Attrs::default(),
            loc,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.targets.iter().any(Target::is_meta)
    }

    /// Match this rule against a concrete target name.
    pub fn matches(&self, target: &str) -> Option<RuleMatch> {
        for t in &self.targets {
            match t {
                Target::Plain(name) => {
                    if name == target {
                        return Some(RuleMatch::plain(target));
                    }
                }
                Target::MetaPercent(pat) => {
                    if let Some(stem) = match_percent(pat, target) {
                        return Some(RuleMatch {
                            target: target.to_string(),
                            stem: Some(stem),
                            captures: Vec::new(),
                        });
                    }
                }
                Target::MetaRegex(re) => {
                    if let Some(caps) = re.captures(target) {
                        let captures = caps
                            .iter()
                            .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
                            .collect();
                        return Some(RuleMatch {
                            target: target.to_string(),
                            stem: None,
                            captures,
                        });
                    }
                }
            }
        }
        None
    }

    /// Rank a successful match for the tie-break: plain beats percent
    /// beats regex, and among percent rules a shorter stem wins.
    pub fn specificity(&self, m: &RuleMatch) -> Specificity {
        if !self.is_meta() {
            return (0, 0);
        }
        match &m.stem {
            Some(stem) => (1, stem.len()),
            None => (2, 0),
        }
    }

    /// Produce the concrete rule for a match: `%` and `\N` references in
    /// targets, prerequisites, and the dep-file pattern are substituted.
    pub fn instantiate(&self, m: &RuleMatch) -> Rule {
        let targets = self
            .targets
            .iter()
            .map(|t| match t {
                Target::Plain(s) => Target::Plain(s.clone()),
                Target::MetaPercent(pat) => Target::Plain(subst_match(pat, m)),
                Target::MetaRegex(_) => Target::Plain(m.target.clone()),
            })
            .collect();
        let prereqs = self.prereqs.iter().map(|p| subst_match(p, m)).collect();
        let mut attrs = self.attrs.clone();
        attrs.dep = attrs.dep.as_deref().map(|d| subst_match(d, m));
        Rule {
            targets,
            prereqs,
            recipe: self.recipe.clone(),
            attrs,
            loc: self.loc.clone(),
        }
    }
}

/// Match `target` against a single-`%` pattern, yielding the stem.
fn match_percent(pat: &str, target: &str) -> Option<String> {
    let pos = pat.find('%')?;
    let (prefix, suffix) = (&pat[..pos], &pat[pos + 1..]);
    if target.len() > prefix.len() + suffix.len()
        && target.starts_with(prefix)
        && target.ends_with(suffix)
    {
        Some(target[prefix.len()..target.len() - suffix.len()].to_string())
    } else {
        None
    }
}

/// Substitute `%` with the stem and `\1`..`\9` with regex captures.
fn subst_match(s: &str, m: &RuleMatch) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '%' => match &m.stem {
                Some(stem) => out.push_str(stem),
                None => out.push('%'),
            },
            '\\' => match chars.peek() {
                Some(d @ '1'..='9') => {
                    let idx = d.to_digit(10).unwrap_or(0) as usize;
                    if let Some(cap) = m.captures.get(idx) {
                        out.push_str(cap);
                    }
                    chars.next();
                }
                _ => out.push('\\'),
            },
            _ => out.push(c),
        }
    }
    out
}

/// A named, ordered collection of rules with its declaration directory
/// and rule-set-level variables.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub name: String,
    /// Directory of the declaring file, project-root-relative. Targets
    /// and prerequisites in this set are resolved against it.
    pub dir: PathBuf,
    pub rules: Vec<Rule>,
    pub vars: HashMap<String, String>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            rules: Vec::new(),
            vars: HashMap::new(),
        }
    }

    /// The default build target: the first plain target declared in this
    /// set.
    pub fn main_target(&self) -> Option<&str> {
        self.rules.iter().find_map(|r| {
            r.targets.iter().find_map(|t| match t {
                Target::Plain(name) => Some(name.as_str()),
                _ => None,
            })
        })
    }
}
