//! Graph construction: rule-set loading, meta-rule resolution, and node
//! binding.
//!
//! The builder turns a map of rule sets plus a requested target list
//! into a DAG of concrete build steps rooted at a synthetic `:all`
//! node. Meta rules are instantiated here, paths are normalized to
//! project-root-relative form, and recipes are expanded in a second
//! pass once the full prerequisite set of every node is known.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::db;
use crate::error::{KnitError, Result};
use crate::expand::{Expander, VarScope};
use crate::rules::{parse, Attrs, Rule, RuleSet, SourceLoc, Target};

/// Name of the root rule set.
pub const ROOT_SET: &str = "";

/// Name of the synthetic root target.
pub const ALL_TARGET: &str = ":all";

pub type NodeId = usize;

/// One concrete build step: a rule bound to specific targets, with
/// edges to the prerequisite nodes that must complete first.
#[derive(Debug, Clone)]
pub struct Node {
    /// All outputs of this step (more than one for a linked rule).
    pub targets: Vec<String>,
    /// Prerequisite paths, including plain source files without rules.
    pub prereqs: Vec<String>,
    /// Recipe lines. Templates until [`expand_recipes`] runs.
    pub recipe: Vec<String>,
    pub attrs: Attrs,
    pub loc: SourceLoc,
    /// Edges to prerequisite nodes.
    pub deps: Vec<NodeId>,
    /// Stable database identifier.
    pub id: u64,
    /// The `%` stem or whole regex match, for `$match`.
    pub match_text: String,
    /// Index of the declaring rule set, for variable scoping.
    pub set_idx: usize,
}

impl Node {
    pub fn is_virtual(&self) -> bool {
        self.attrs.virtual_
    }
}

#[derive(Debug)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub by_target: HashMap<String, NodeId>,
    pub root: NodeId,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Reverse adjacency: for each node, the nodes that depend on it.
    pub fn dependents(&self) -> Vec<Vec<NodeId>> {
        let mut rev = vec![Vec::new(); self.nodes.len()];
        for (id, node) in self.nodes.iter().enumerate() {
            for &dep in &node.deps {
                rev[dep].push(id);
            }
        }
        rev
    }
}

/// A block of rule text together with where it came from.
#[derive(Debug, Clone)]
pub struct RuleBlock {
    pub text: String,
    pub file: String,
    /// Directory of the declaring file, project-root-relative.
    pub dir: PathBuf,
}

/// Yields blocks of rule text by rule-set name. The scripting host
/// sits behind this seam; [`FileRuleSource`] is the plain-file
/// implementation.
pub trait RuleSource {
    fn rule_block(&mut self, name: &str) -> Result<Option<RuleBlock>>;
}

/// Loads `knitfile` (or `Knitfile`) blocks from the project tree: the
/// root set from the project root, referenced sets from their
/// subdirectories.
#[derive(Debug)]
pub struct FileRuleSource {
    project_root: PathBuf,
    root_file: PathBuf,
}

impl FileRuleSource {
    pub fn new(project_root: PathBuf, root_file: PathBuf) -> Self {
        Self {
            project_root,
            root_file,
        }
    }

    /// Search upward from `start` for the rule file, trying the given
    /// name and its first-letter-uppercased variant. Returns the
    /// project root and the rule file path.
    pub fn find_root(start: &Path, file_name: &str) -> Result<(PathBuf, PathBuf)> {
        let mut dir = start.to_path_buf();
        loop {
            for name in name_variants(file_name) {
                let candidate = dir.join(&name);
                if candidate.is_file() {
                    return Ok((dir, candidate));
                }
            }
            if !dir.pop() {
                return Err(KnitError::Config(format!(
                    "no {} found in {} or any parent directory",
                    file_name,
                    start.display()
                )));
            }
        }
    }
}

fn name_variants(name: &str) -> Vec<String> {
    let mut variants = vec![name.to_string()];
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        let upper: String = first.to_uppercase().chain(chars).collect();
        if upper != name {
            variants.push(upper);
        }
    }
    variants
}

impl RuleSource for FileRuleSource {
    fn rule_block(&mut self, name: &str) -> Result<Option<RuleBlock>> {
        let (file, dir) = if name == ROOT_SET {
            (self.root_file.clone(), PathBuf::new())
        } else {
            let dir = PathBuf::from(name);
            let abs_dir = self.project_root.join(&dir);
            let Some(file) = name_variants("knitfile")
                .into_iter()
                .map(|n| abs_dir.join(n))
                .find(|p| p.is_file())
            else {
                return Ok(None);
            };
            (file, dir)
        };
        let text = fs::read_to_string(&file).map_err(|e| {
            KnitError::Config(format!("cannot read rule file '{}': {}", file.display(), e))
        })?;
        Ok(Some(RuleBlock {
            text,
            file: file.to_string_lossy().to_string(),
            dir,
        }))
    }
}

/// Load the root rule set and, transitively, every referenced set.
/// Paths inside each set are rebased to project-root-relative form.
pub fn load_rule_sets(source: &mut dyn RuleSource) -> Result<Vec<RuleSet>> {
    let mut sets: Vec<RuleSet> = Vec::new();
    let mut queue: Vec<String> = vec![ROOT_SET.to_string()];
    let mut seen: Vec<String> = vec![ROOT_SET.to_string()];

    while !queue.is_empty() {
        let name = queue.remove(0);
        let block = source.rule_block(&name)?.ok_or_else(|| {
            KnitError::Config(format!("unknown rule set '{}'", name))
        })?;
        let mut set = RuleSet::new(name.clone(), block.dir.clone());
        let refs = parse::parse_into(&block.text, &mut set, &block.file)?;
        rebase_set(&mut set);
        debug!(
            set = %display_name(&name),
            rules = set.rules.len(),
            refs = refs.len(),
            "loaded rule set"
        );
        sets.push(set);

        for r in refs {
            let full = normalize(&block.dir.join(&r));
            if !seen.contains(&full) {
                seen.push(full.clone());
                queue.push(full);
            }
        }
    }
    Ok(sets)
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "<root>"
    } else {
        name
    }
}

/// Rewrite a set's targets, prerequisites, and dep patterns relative to
/// the project root. Regex targets are left as written; they match the
/// normalized path.
fn rebase_set(set: &mut RuleSet) {
    if set.dir.as_os_str().is_empty() {
        return;
    }
    let dir = set.dir.clone();
    for rule in &mut set.rules {
        for target in &mut rule.targets {
            match target {
                Target::Plain(s) | Target::MetaPercent(s) => *s = normalize(&dir.join(&*s)),
                Target::MetaRegex(_) => {}
            }
        }
        for prereq in &mut rule.prereqs {
            if !Path::new(&*prereq).is_absolute() {
                *prereq = normalize(&dir.join(&*prereq));
            }
        }
        if let Some(dep) = &rule.attrs.dep {
            rule.attrs.dep = Some(normalize(&dir.join(dep)));
        }
    }
}

/// Lexical normalization: drop `.` components, resolve `..` against
/// the stack, join with `/`.
pub fn normalize(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.is_empty() {
                    parts.push("..".to_string());
                } else {
                    parts.pop();
                }
            }
            other => parts.push(other.as_os_str().to_string_lossy().to_string()),
        }
    }
    parts.join("/")
}

/// Build the graph for `targets`, resolving from the root rule set.
pub fn build(sets: &[RuleSet], project_root: &Path, targets: &[String]) -> Result<Graph> {
    let workdir = project_root.to_string_lossy().to_string();
    let mut builder = Builder {
        sets,
        project_root,
        workdir,
        nodes: Vec::new(),
        by_target: HashMap::new(),
        visiting: HashMap::new(),
    };

    let all_loc = SourceLoc {
        file: "<build>".to_string(),
        line: 0,
    };
    let norm_targets: Vec<String> = targets.iter().map(|t| normalize(Path::new(t))).collect();

    builder
        .visiting
        .insert(ALL_TARGET.to_string(), all_loc.clone());
    let mut deps = Vec::new();
    for t in &norm_targets {
        if let Some(id) = builder.resolve(t, 0, (ALL_TARGET, &all_loc))? {
            if !deps.contains(&id) {
                deps.push(id);
            }
        }
    }
    builder.visiting.remove(ALL_TARGET);

    let all_targets = vec![ALL_TARGET.to_string()];
    let id = db::node_id(&all_targets, &all_loc, &builder.workdir);
    let root = builder.nodes.len();
    builder.nodes.push(Node {
        targets: all_targets,
        prereqs: norm_targets,
        recipe: Vec::new(),
        attrs: Attrs {
            virtual_: true,
            rebuild: true,
            nometa: true,
            ..Attrs::default()
        },
        loc: all_loc,
        deps,
        id,
        match_text: String::new(),
        set_idx: 0,
    });
    builder.by_target.insert(ALL_TARGET.to_string(), root);

    Ok(Graph {
        nodes: builder.nodes,
        by_target: builder.by_target,
        root,
    })
}

struct Builder<'a> {
    sets: &'a [RuleSet],
    project_root: &'a Path,
    workdir: String,
    nodes: Vec<Node>,
    by_target: HashMap<String, NodeId>,
    visiting: HashMap<String, SourceLoc>,
}

/// The rule application chosen for one target.
struct Selected {
    rule: Rule,
    set_idx: usize,
    match_text: String,
}

impl<'a> Builder<'a> {
    /// Resolve `target` to a node, creating it (and its prerequisite
    /// subgraph) on first demand. Returns `None` for a plain source
    /// file that no rule produces.
    fn resolve(
        &mut self,
        target: &str,
        scope: usize,
        from: (&str, &SourceLoc),
    ) -> Result<Option<NodeId>> {
        if let Some(&id) = self.by_target.get(target) {
            return Ok(Some(id));
        }
        if let Some(loc) = self.visiting.get(target) {
            return Err(KnitError::Cycle {
                from: from.0.to_string(),
                from_loc: from.1.clone(),
                to: target.to_string(),
                to_loc: loc.clone(),
            });
        }

        let Some(sel) = self.select(target, scope)? else {
            if self.project_root.join(target).exists() {
                return Ok(None);
            }
            return Err(KnitError::NoRule(target.to_string()));
        };

        let rule = sel.rule;
        let out_targets: Vec<String> = rule
            .targets
            .iter()
            .map(|t| t.pattern().to_string())
            .collect();
        debug!(node = %target, rule = %rule.loc, "selected rule");

        self.visiting.insert(target.to_string(), rule.loc.clone());
        let mut deps = Vec::new();
        for prereq in &rule.prereqs {
            if let Some(dep_id) = self.resolve(prereq, sel.set_idx, (target, &rule.loc))? {
                if !deps.contains(&dep_id) {
                    deps.push(dep_id);
                }
            }
        }
        self.visiting.remove(target);

        let id = db::node_id(&out_targets, &rule.loc, &self.workdir);
        let node_id = self.nodes.len();
        self.nodes.push(Node {
            targets: out_targets.clone(),
            prereqs: rule.prereqs.clone(),
            recipe: rule.recipe.clone(),
            attrs: rule.attrs.clone(),
            loc: rule.loc.clone(),
            deps,
            id,
            match_text: sel.match_text,
            set_idx: sel.set_idx,
        });
        for out in out_targets {
            self.by_target.insert(out, node_id);
        }
        Ok(Some(node_id))
    }

    /// Pick the rule for `target` per the tie-break: plain rules of the
    /// requesting set first (at most one with a recipe; recipe-less
    /// ones contribute prerequisites), then meta rules across the rule
    /// sets in load order, root first. Among metas, percent beats
    /// regex, shorter stem beats longer, then declaration order.
    fn select(&self, target: &str, scope: usize) -> Result<Option<Selected>> {
        let scope_set = &self.sets[scope];

        let mut with_recipe: Vec<(&Rule, crate::rules::RuleMatch)> = Vec::new();
        let mut extra_prereqs: Vec<String> = Vec::new();
        let mut extra_attrs = Attrs::default();
        let mut have_extra = false;
        let mut nometa = false;

        for rule in scope_set.rules.iter().filter(|r| !r.is_meta()) {
            if let Some(m) = rule.matches(target) {
                nometa |= rule.attrs.nometa;
                if rule.recipe.is_empty() {
                    extra_prereqs.extend(rule.prereqs.iter().cloned());
                    merge_attrs(&mut extra_attrs, &rule.attrs);
                    have_extra = true;
                } else {
                    with_recipe.push((rule, m));
                }
            }
        }

        if with_recipe.len() > 1 {
            return Err(KnitError::Ambiguous {
                target: target.to_string(),
                first: with_recipe[0].0.loc.clone(),
                second: with_recipe[1].0.loc.clone(),
            });
        }

        let mut selected = match with_recipe.into_iter().next() {
            Some((rule, m)) => Some(Selected {
                rule: rule.instantiate(&m),
                set_idx: scope,
                match_text: m.match_text().to_string(),
            }),
            None if !nometa => self.select_meta(target),
            None => None,
        };

        if selected.is_none() && have_extra {
            // Prerequisite-only declarations form an alias node.
            let loc = scope_set
                .rules
                .iter()
                .find(|r| !r.is_meta() && r.matches(target).is_some())
                .map(|r| r.loc.clone())
                .unwrap_or(SourceLoc {
                    file: "<build>".to_string(),
                    line: 0,
                });
            selected = Some(Selected {
                rule: Rule::new(vec![Target::Plain(target.to_string())], Vec::new(), loc),
                set_idx: scope,
                match_text: String::new(),
            });
        }

        let Some(mut sel) = selected else {
            return Ok(None);
        };

        for p in extra_prereqs {
            if !sel.rule.prereqs.contains(&p) {
                sel.rule.prereqs.push(p);
            }
        }
        merge_attrs(&mut sel.rule.attrs, &extra_attrs);
        Ok(Some(sel))
    }

    /// Most specific meta rule across the sets. Equally specific
    /// matches resolve by rule-set load order (root first), then
    /// declaration order, regardless of which set asked.
    fn select_meta(&self, target: &str) -> Option<Selected> {
        let mut best: Option<(crate::rules::Specificity, usize, usize)> = None;
        let mut best_sel: Option<Selected> = None;

        for (set_idx, set) in self.sets.iter().enumerate() {
            for (decl_idx, rule) in set
                .rules
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_meta())
            {
                let Some(m) = rule.matches(target) else {
                    continue;
                };
                let rank = (rule.specificity(&m), set_idx, decl_idx);
                if best.map_or(true, |b| rank < b) {
                    best = Some(rank);
                    best_sel = Some(Selected {
                        rule: rule.instantiate(&m),
                        set_idx,
                        match_text: m.match_text().to_string(),
                    });
                }
            }
        }
        best_sel
    }
}

fn merge_attrs(into: &mut Attrs, from: &Attrs) {
    into.virtual_ |= from.virtual_;
    into.rebuild |= from.rebuild;
    into.nometa |= from.nometa;
    into.quiet |= from.quiet;
    into.keep_going |= from.keep_going;
    into.no_fail |= from.no_fail;
    into.linked |= from.linked;
    if into.dep.is_none() {
        into.dep = from.dep.clone();
    }
}

/// Expand every node's recipe with the match context: `$input`,
/// `$output`, `$match`, `$dep`, then CLI assignments, rule-set
/// variables, and the environment table. Runs after structural
/// construction so the full prerequisite set is visible.
pub fn expand_recipes(
    graph: &mut Graph,
    sets: &[RuleSet],
    expander: &dyn Expander,
    cli_vars: &HashMap<String, String>,
    env_vars: &HashMap<String, String>,
) -> Result<()> {
    for node in &mut graph.nodes {
        if node.recipe.is_empty() {
            continue;
        }
        let mut node_vars = HashMap::new();
        node_vars.insert("input".to_string(), node.prereqs.join(" "));
        node_vars.insert("output".to_string(), node.targets.join(" "));
        node_vars.insert("match".to_string(), node.match_text.clone());
        node_vars.insert(
            "dep".to_string(),
            node.attrs.dep.clone().unwrap_or_default(),
        );

        let set_vars = &sets[node.set_idx].vars;
        let mut scope = VarScope::new();
        scope
            .push(&node_vars)
            .push(cli_vars)
            .push(set_vars)
            .push(env_vars);

        let mut expanded = Vec::with_capacity(node.recipe.len());
        for line in &node.recipe {
            expanded.push(expander.expand(line, &scope)?);
        }
        node.recipe = expanded;
    }
    Ok(())
}
