//! The executor: staleness decisions, dynamic task elision, and the
//! worker pool.
//!
//! A single-threaded dispatcher owns the pending-prerequisite counters
//! and the ready queue; workers receive ready nodes over a channel,
//! decide staleness against the database, run recipes, and report
//! completion events back. A node's recipe therefore runs strictly
//! after every transitive prerequisite has completed, with no ordering
//! among independent nodes.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::SystemTime;

use crossbeam_channel::unbounded;
use tracing::{debug, warn};

use crate::db::{self, Db, NodeRecord, OutputState, PrereqState};
use crate::error::{KnitError, Result};
use crate::graph::{Graph, Node, NodeId};
use crate::printer::{Printer, Status, Stream};
use crate::rules::depfile;

#[derive(Debug, Clone)]
pub struct BuildOpts {
    pub always_build: bool,
    /// Content hashing for staleness; timestamps only when off.
    pub hash: bool,
    pub dry_run: bool,
    pub keep_going: bool,
    pub jobs: usize,
    /// Command prefix each recipe line is passed to, e.g. `sh -c`.
    pub shell: Vec<String>,
    /// Paths the user declared updated (`-u`).
    pub updated: HashSet<String>,
}

impl Default for BuildOpts {
    fn default() -> Self {
        Self {
            always_build: false,
            hash: true,
            dry_run: false,
            keep_going: false,
            jobs: num_cpus::get(),
            shell: vec!["sh".to_string(), "-c".to_string()],
            updated: HashSet::new(),
        }
    }
}

/// Worker-side result for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    UpToDate,
    /// The recipe ran; `changed` reports whether any output's content
    /// hash moved, which is what dependents' staleness keys on.
    Built { changed: bool },
}

#[derive(Debug, Clone, Copy)]
struct Task {
    node: NodeId,
    /// Some prerequisite was rebuilt and its outputs actually changed.
    prereq_changed: bool,
}

#[derive(Debug, Default)]
pub struct BuildSummary {
    /// Nodes whose (non-empty) recipe ran or, under dry-run, would run.
    pub executed: usize,
}

/// One build invocation: graph + database + printer + options.
pub struct Engine<'a> {
    graph: &'a Graph,
    db: &'a Db,
    printer: &'a dyn Printer,
    project_root: &'a Path,
    opts: BuildOpts,
}

impl<'a> Engine<'a> {
    pub fn new(
        graph: &'a Graph,
        db: &'a Db,
        printer: &'a dyn Printer,
        project_root: &'a Path,
        opts: BuildOpts,
    ) -> Self {
        Self {
            graph,
            db,
            printer,
            project_root,
            opts,
        }
    }

    /// Walk the graph from the root, running stale recipes in
    /// topological order. The database is saved before returning on
    /// every path except dry-run.
    pub fn build(&self) -> Result<BuildSummary> {
        let result = self.run_graph();
        if !self.opts.dry_run {
            self.db.save()?;
        }
        let summary = result?;
        if summary.executed == 0 {
            return Err(KnitError::NothingToDo);
        }
        Ok(summary)
    }

    fn run_graph(&self) -> Result<BuildSummary> {
        let node_count = self.graph.nodes.len();
        let revdeps = self.graph.dependents();
        let mut pending: Vec<usize> = self.graph.nodes.iter().map(|n| n.deps.len()).collect();
        let mut blocked = vec![false; node_count];
        let mut statuses: Vec<Option<Outcome>> = vec![None; node_count];
        let cancel = AtomicBool::new(false);

        let (task_tx, task_rx) = unbounded::<Task>();
        let (event_tx, event_rx) = unbounded::<(NodeId, Result<Outcome>)>();

        let mut summary = BuildSummary::default();
        let mut first_err: Option<KnitError> = None;

        thread::scope(|scope| {
            for _ in 0..self.opts.jobs.max(1) {
                let task_rx = task_rx.clone();
                let event_tx = event_tx.clone();
                let cancel = &cancel;
                scope.spawn(move || {
                    for task in task_rx.iter() {
                        let res = self.run_node(task, cancel);
                        if event_tx.send((task.node, res)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(event_tx);

            let mut in_flight = 0usize;
            for (id, count) in pending.iter().enumerate() {
                if *count == 0 {
                    task_tx
                        .send(Task {
                            node: id,
                            prereq_changed: false,
                        })
                        .ok();
                    in_flight += 1;
                }
            }

            while in_flight > 0 {
                let Ok((id, res)) = event_rx.recv() else {
                    break;
                };
                in_flight -= 1;

                let failed = res.is_err();
                match res {
                    Ok(outcome) => {
                        statuses[id] = Some(outcome);
                        if matches!(outcome, Outcome::Built { .. })
                            && !self.graph.node(id).recipe.is_empty()
                        {
                            summary.executed += 1;
                        }
                    }
                    Err(err) => {
                        if !self.opts.keep_going {
                            cancel.store(true, Ordering::SeqCst);
                        }
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                }

                for &dependent in &revdeps[id] {
                    if failed {
                        blocked[dependent] = true;
                    }
                    pending[dependent] -= 1;
                    if pending[dependent] > 0 {
                        continue;
                    }
                    if blocked[dependent] || cancel.load(Ordering::SeqCst) {
                        abandon(dependent, &revdeps, &mut pending, &mut blocked);
                        continue;
                    }
                    let prereq_changed = self.graph.node(dependent).deps.iter().any(|&d| {
                        matches!(statuses[d], Some(Outcome::Built { changed: true }))
                    });
                    task_tx
                        .send(Task {
                            node: dependent,
                            prereq_changed,
                        })
                        .ok();
                    in_flight += 1;
                }
            }
            drop(task_tx);
        });

        match first_err {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Staleness decision plus, when stale, recipe execution and
    /// post-run bookkeeping. Runs on a worker thread.
    fn run_node(&self, task: Task, cancel: &AtomicBool) -> Result<Outcome> {
        let node = self.graph.node(task.node);

        if !self.is_stale(node, task.prereq_changed) {
            self.printer.finish(node, Status::UpToDate);
            debug!(node = %node.targets[0], "up to date");
            return Ok(Outcome::UpToDate);
        }

        if node.recipe.is_empty() {
            // Alias and virtual grouping nodes: nothing to run, but
            // record their state so recipe-digest checks settle.
            if !self.opts.dry_run {
                let prior = self.db.lookup(node.id);
                let (_, record) = self.observe_outputs(node, &prior)?;
                self.db.record(node.id, record);
            }
            return Ok(Outcome::Built {
                changed: task.prereq_changed,
            });
        }

        self.printer.start(node);
        if self.opts.dry_run {
            self.printer.finish(node, Status::Built);
            return Ok(Outcome::Built { changed: true });
        }

        let prior = self.db.lookup(node.id);
        for line in &node.recipe {
            if cancel.load(Ordering::SeqCst) {
                self.printer.finish(node, Status::Failed);
                return Err(KnitError::Recipe {
                    target: node.targets[0].clone(),
                    msg: "interrupted".to_string(),
                });
            }
            if let Err(err) = self.run_command(node, line) {
                if node.attrs.no_fail {
                    debug!(node = %node.targets[0], "ignoring failed command");
                    continue;
                }
                self.printer.finish(node, Status::Failed);
                return Err(err);
            }
        }

        let (changed, record) = self.observe_outputs(node, &prior)?;
        self.db.record(node.id, record);
        self.printer.finish(node, Status::Built);
        debug!(node = %node.targets[0], changed, "built");
        Ok(Outcome::Built { changed })
    }

    fn run_command(&self, node: &Node, line: &str) -> Result<()> {
        let mut cmd = Command::new(&self.opts.shell[0]);
        cmd.args(&self.opts.shell[1..])
            .arg(line)
            .current_dir(self.project_root);
        let output = cmd.output().map_err(|e| KnitError::Recipe {
            target: node.targets[0].clone(),
            msg: format!("failed to spawn '{}': {}", self.opts.shell[0], e),
        })?;

        if !output.stdout.is_empty() {
            self.printer.output(node, Stream::Stdout, &output.stdout);
        }
        if !output.stderr.is_empty() {
            self.printer.output(node, Stream::Stderr, &output.stderr);
        }
        if !output.status.success() {
            return Err(KnitError::Recipe {
                target: node.targets[0].clone(),
                msg: match output.status.code() {
                    Some(code) => format!("command exited with status {}", code),
                    None => "command killed by signal".to_string(),
                },
            });
        }
        Ok(())
    }

    /// The staleness rules. Any one of them makes the node rebuild;
    /// virtual nodes skip the output-file tests and inherit from their
    /// prerequisites instead.
    fn is_stale(&self, node: &Node, prereq_changed: bool) -> bool {
        if node.attrs.rebuild || self.opts.always_build {
            return true;
        }

        let record = self.db.lookup(node.id);
        if db::hash_str(&node.recipe.join("\n")) != record.recipe_digest {
            debug!(node = %node.targets[0], "recipe changed");
            return true;
        }

        let mut oldest_output: Option<SystemTime> = None;
        if !node.is_virtual() {
            for target in &node.targets {
                match fs::metadata(self.project_root.join(target)) {
                    Ok(md) => {
                        let mtime = md.modified().ok();
                        if oldest_output.is_none() || mtime < oldest_output {
                            oldest_output = mtime;
                        }
                    }
                    Err(_) => {
                        debug!(output = %target, "output missing");
                        return true;
                    }
                }
            }
        }

        if prereq_changed {
            return true;
        }
        if node.prereqs.iter().any(|p| self.opts.updated.contains(p)) {
            return true;
        }

        let paths = self.prereq_paths(node, &record);
        let abs: Vec<String> = paths.iter().map(|(_, a)| a.clone()).collect();
        if self.opts.hash {
            for ((rel, abs), (_, hashed)) in paths.iter().zip(db::hash_files(&abs)) {
                match hashed {
                    Ok(current) => match record.prereq_hash(rel) {
                        Some(prior) if prior == current => {}
                        Some(_) => {
                            debug!(node = %node.targets[0], prereq = %rel, "content changed");
                            return true;
                        }
                        // A prerequisite this node has never been
                        // built against.
                        None => return true,
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return true;
                    }
                    Err(e) => {
                        warn!(prereq = %rel, "hashing failed ({}), falling back to mtime", e);
                        if self.mtime_newer(abs, oldest_output) {
                            return true;
                        }
                    }
                }
            }
        } else {
            for (_, abs) in &paths {
                if self.mtime_newer(abs, oldest_output) {
                    return true;
                }
            }
        }
        false
    }

    /// Prerequisite files subject to content checks: the declared
    /// prerequisites that are not virtual targets, plus everything the
    /// last build recorded (which includes dep-file discoveries).
    /// Returned as (root-relative, absolute) pairs; the relative form
    /// is the database key.
    fn prereq_paths(&self, node: &Node, record: &NodeRecord) -> Vec<(String, String)> {
        let mut paths: Vec<(String, String)> = Vec::new();
        let mut push = |rel: &str, root: &Path, paths: &mut Vec<(String, String)>| {
            if !paths.iter().any(|(r, _)| r == rel) {
                let abs = root.join(rel).to_string_lossy().to_string();
                paths.push((rel.to_string(), abs));
            }
        };
        for p in &node.prereqs {
            if !self.is_virtual_target(p) {
                push(p, self.project_root, &mut paths);
            }
        }
        for pr in &record.prereqs {
            push(&pr.path, self.project_root, &mut paths);
        }
        paths
    }

    fn is_virtual_target(&self, name: &str) -> bool {
        self.graph
            .by_target
            .get(name)
            .map(|&id| self.graph.node(id).is_virtual())
            .unwrap_or(false)
    }

    fn mtime_newer(&self, path: &str, oldest_output: Option<SystemTime>) -> bool {
        let Some(out_mtime) = oldest_output else {
            return false;
        };
        match fs::metadata(path).and_then(|md| md.modified()) {
            Ok(mtime) => mtime > out_mtime,
            // Missing prerequisite: rebuild and let the recipe report
            // the real problem.
            Err(_) => true,
        }
    }

    /// Post-run bookkeeping: hash the outputs to decide whether this
    /// rebuild actually changed anything, ingest the dep-file, and
    /// assemble the new database record.
    fn observe_outputs(&self, node: &Node, prior: &NodeRecord) -> Result<(bool, NodeRecord)> {
        let mut outputs = Vec::new();
        let mut changed = prior.is_empty();

        if !node.is_virtual() {
            for target in &node.targets {
                let path = self.project_root.join(target);
                let Ok(md) = fs::metadata(&path) else {
                    // Tolerated for no-fail and partial linked rules:
                    // no state recorded, so the next run rebuilds.
                    changed = true;
                    continue;
                };
                let hash = if self.opts.hash {
                    match db::hash_file(&path) {
                        Ok(h) => h,
                        Err(e) => {
                            return Err(KnitError::Recipe {
                                target: target.clone(),
                                msg: format!("cannot hash output: {}", e),
                            })
                        }
                    }
                } else {
                    0
                };
                match prior.output(target) {
                    Some(old) if self.opts.hash && old.hash == hash => {}
                    _ => changed = true,
                }
                outputs.push(OutputState {
                    path: target.clone(),
                    mtime: md.modified().ok(),
                    size: md.len(),
                    hash,
                });
            }
        }
        if !self.opts.hash {
            // Without content hashes a rebuild always counts as a
            // change, like timestamp-based tools.
            changed = true;
        }

        let mut prereqs: Vec<String> = node
            .prereqs
            .iter()
            .filter(|p| !self.is_virtual_target(p))
            .cloned()
            .collect();
        if let Some(dep) = &node.attrs.dep {
            let dep_path = self.project_root.join(dep);
            let content = fs::read_to_string(&dep_path).map_err(|e| KnitError::Recipe {
                target: node.targets[0].clone(),
                msg: format!("dep-file '{}' was not produced: {}", dep, e),
            })?;
            for extra in depfile::parse(&content) {
                let extra = crate::graph::normalize(Path::new(&extra));
                if !prereqs.contains(&extra) {
                    prereqs.push(extra);
                }
            }
        }

        let mut states = Vec::new();
        if self.opts.hash {
            let abs: Vec<String> = prereqs
                .iter()
                .map(|p| self.project_root.join(p).to_string_lossy().to_string())
                .collect();
            for (rel, (_, hashed)) in prereqs.iter().zip(db::hash_files(&abs)) {
                match hashed {
                    Ok(hash) => states.push(PrereqState {
                        path: rel.clone(),
                        hash,
                    }),
                    Err(e) => {
                        warn!(prereq = %rel, "not recording unhashable prerequisite: {}", e);
                    }
                }
            }
        }

        let record = NodeRecord {
            recipe_digest: db::hash_str(&node.recipe.join("\n")),
            outputs,
            prereqs: states,
        };
        Ok((changed, record))
    }

    /// Delete every non-virtual output in the graph. No recipes run.
    pub fn clean(&self) -> Result<()> {
        let mut removed = 0usize;
        for node in &self.graph.nodes {
            if node.is_virtual() {
                continue;
            }
            for target in &node.targets {
                let path = self.project_root.join(target);
                if path.is_file() {
                    fs::remove_file(&path)?;
                    self.printer.info(&format!("removed {}", target));
                    removed += 1;
                }
            }
        }
        if removed == 0 {
            self.printer.info("nothing to clean");
        }
        Ok(())
    }
}

/// Mark a node unreachable (its prerequisite failed or the build was
/// cancelled) and propagate the counter updates its completion would
/// have produced.
fn abandon(
    node: NodeId,
    revdeps: &[Vec<NodeId>],
    pending: &mut [usize],
    blocked: &mut [bool],
) {
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        for &dependent in &revdeps[id] {
            blocked[dependent] = true;
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                stack.push(dependent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::VarExpander;
    use crate::graph;
    use crate::printer::{Event, RecordingPrinter};
    use crate::rules::{parse, RuleSet};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn setup(dir: &Path, knitfile: &str, targets: &[&str]) -> (Graph, Db) {
        let mut set = RuleSet::new(graph::ROOT_SET, "");
        parse::parse_into(knitfile, &mut set, "knitfile").unwrap();
        let sets = vec![set];
        let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        let mut g = graph::build(&sets, dir, &targets).unwrap();
        graph::expand_recipes(&mut g, &sets, &VarExpander, &HashMap::new(), &HashMap::new())
            .unwrap();
        let db = Db::open(&dir.join(".knit")).unwrap();
        (g, db)
    }

    fn engine<'a>(
        g: &'a Graph,
        db: &'a Db,
        printer: &'a RecordingPrinter,
        root: &'a Path,
        opts: BuildOpts,
    ) -> Engine<'a> {
        Engine::new(g, db, printer, root, opts)
    }

    fn opts() -> BuildOpts {
        BuildOpts {
            jobs: 2,
            ..BuildOpts::default()
        }
    }

    #[test]
    fn test_first_build_runs_everything_then_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "hello").unwrap();
        let knitfile = "out.txt: in.txt\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let summary = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap();
        assert_eq!(summary.executed, 1);
        assert!(dir.path().join("out.txt").is_file());

        // Same invocation again: everything is up to date.
        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let err = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap_err();
        assert!(matches!(err, KnitError::NothingToDo));
    }

    #[test]
    fn test_touch_without_change_is_elided_with_hashing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "hello").unwrap();
        let knitfile = "out.txt: in.txt\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();

        // Rewrite identical content (mtime moves, hash does not).
        fs::write(dir.path().join("in.txt"), "hello").unwrap();
        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let err = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap_err();
        assert!(matches!(err, KnitError::NothingToDo));
    }

    #[test]
    fn test_elision_stops_propagation() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("src.txt"), "one\n").unwrap();
        // mid.txt only keeps the first line, so appending to src.txt
        // rebuilds mid.txt to identical content.
        let knitfile = "\
final.txt: mid.txt\n\tcp mid.txt final.txt\n\
mid.txt: src.txt\n\thead -n 1 src.txt > mid.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["final.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();

        fs::write(dir.path().join("src.txt"), "one\ntwo\n").unwrap();
        let (g, db) = setup(dir.path(), knitfile, &["final.txt"]);
        let printer = RecordingPrinter::new();
        let summary = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap();

        // Only mid.txt reran; final.txt was elided.
        assert_eq!(summary.executed, 1);
        let events = printer.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Start(t) if t == "mid.txt")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::Start(t) if t == "final.txt")));
    }

    #[test]
    fn test_recipe_change_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "hello").unwrap();

        let (g, db) = setup(dir.path(), "out.txt: in.txt\n\tcp in.txt out.txt\n", &["out.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();

        // Same outputs, different command text.
        let (g, db) = setup(
            dir.path(),
            "out.txt: in.txt\n\tcat in.txt > out.txt\n",
            &["out.txt"],
        );
        let printer = RecordingPrinter::new();
        let summary = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap();
        assert_eq!(summary.executed, 1);
    }

    #[test]
    fn test_failed_recipe_reports_and_blocks_dependents() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "x").unwrap();
        let knitfile = "\
final.txt: mid.txt\n\tcp mid.txt final.txt\n\
mid.txt: in.txt\n\tfalse\n";

        let (g, db) = setup(dir.path(), knitfile, &["final.txt"]);
        let printer = RecordingPrinter::new();
        let err = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap_err();
        assert!(matches!(err, KnitError::Recipe { .. }));
        assert!(!dir.path().join("final.txt").exists());
        let events = printer.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Finish(t, Status::Failed) if t == "mid.txt")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::Start(t) if t == "final.txt")));
    }

    #[test]
    fn test_keep_going_builds_independent_subtree() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.in"), "a").unwrap();
        fs::write(dir.path().join("b.in"), "b").unwrap();
        let knitfile = "\
all:V: a.out b.out\n\
a.out: a.in\n\tfalse\n\
b.out: b.in\n\tcp b.in b.out\n";

        let (g, db) = setup(dir.path(), knitfile, &["all"]);
        let printer = RecordingPrinter::new();
        let mut o = opts();
        o.keep_going = true;
        let err = engine(&g, &db, &printer, dir.path(), o).build().unwrap_err();
        assert!(matches!(err, KnitError::Recipe { .. }));
        assert!(dir.path().join("b.out").is_file());
    }

    #[test]
    fn test_no_fail_attribute_continues() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "x").unwrap();
        let knitfile = "out.txt:E: in.txt\n\tfalse\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let summary = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap();
        assert_eq!(summary.executed, 1);
        assert!(dir.path().join("out.txt").is_file());
    }

    #[test]
    fn test_dry_run_executes_nothing_and_keeps_db() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "x").unwrap();
        let knitfile = "out.txt: in.txt\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let mut o = opts();
        o.dry_run = true;
        let summary = engine(&g, &db, &printer, dir.path(), o).build().unwrap();
        assert_eq!(summary.executed, 1);
        assert!(!dir.path().join("out.txt").exists());
        assert!(!dir.path().join(".knit/db.json").exists());
        assert!(printer
            .events()
            .iter()
            .any(|e| matches!(e, Event::Start(t) if t == "out.txt")));
    }

    #[test]
    fn test_updated_override_forces_rebuild() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "x").unwrap();
        let knitfile = "out.txt: in.txt\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let mut o = opts();
        o.updated.insert("in.txt".to_string());
        let summary = engine(&g, &db, &printer, dir.path(), o).build().unwrap();
        assert_eq!(summary.executed, 1);
    }

    #[test]
    fn test_dep_file_discovered_prereqs_trigger_rebuild() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.src"), "code").unwrap();
        fs::write(dir.path().join("extra.h"), "v1").unwrap();
        // The recipe writes a dep-file naming extra.h, which is not a
        // declared prerequisite.
        let knitfile = "out.bin:D[out.d]: main.src\n\
\tcp main.src out.bin && echo 'out.bin: main.src extra.h' > out.d\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.bin"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();

        // Nothing changed: elided.
        let (g, db) = setup(dir.path(), knitfile, &["out.bin"]);
        let printer = RecordingPrinter::new();
        assert!(matches!(
            engine(&g, &db, &printer, dir.path(), opts()).build(),
            Err(KnitError::NothingToDo)
        ));

        // Touching only the discovered prerequisite forces the rebuild.
        fs::write(dir.path().join("extra.h"), "v2").unwrap();
        let (g, db) = setup(dir.path(), knitfile, &["out.bin"]);
        let printer = RecordingPrinter::new();
        let summary = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap();
        assert_eq!(summary.executed, 1);
    }

    #[test]
    fn test_missing_dep_file_is_a_recipe_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "x").unwrap();
        let knitfile = "out.txt:D[out.d]: in.txt\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let err = engine(&g, &db, &printer, dir.path(), opts())
            .build()
            .unwrap_err();
        assert!(matches!(err, KnitError::Recipe { .. }));
    }

    #[test]
    fn test_clean_removes_outputs_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "x").unwrap();
        let knitfile = "out.txt: in.txt\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();
        assert!(dir.path().join("out.txt").is_file());

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).clean().unwrap();
        assert!(!dir.path().join("out.txt").exists());
        assert!(dir.path().join("in.txt").is_file());
    }

    #[test]
    fn test_topological_order_observed_in_printer_stream() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("src.txt"), "x").unwrap();
        let knitfile = "\
final.txt: mid.txt\n\tcp mid.txt final.txt\n\
mid.txt: src.txt\n\tcp src.txt mid.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["final.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();

        let events = printer.events();
        let finish_mid = events
            .iter()
            .position(|e| matches!(e, Event::Finish(t, Status::Built) if t == "mid.txt"))
            .unwrap();
        let start_final = events
            .iter()
            .position(|e| matches!(e, Event::Start(t) if t == "final.txt"))
            .unwrap();
        assert!(finish_mid < start_final);
    }

    #[test]
    fn test_always_build_reruns_everything() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "x").unwrap();
        let knitfile = "out.txt: in.txt\n\tcp in.txt out.txt\n";

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), opts()).build().unwrap();

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let mut o = opts();
        o.always_build = true;
        let summary = engine(&g, &db, &printer, dir.path(), o).build().unwrap();
        assert_eq!(summary.executed, 1);
    }

    #[test]
    fn test_timestamps_only_mode_rebuilds_on_touch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in.txt"), "hello").unwrap();
        let knitfile = "out.txt: in.txt\n\tcp in.txt out.txt\n";
        let mut o = opts();
        o.hash = false;

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        engine(&g, &db, &printer, dir.path(), o.clone())
            .build()
            .unwrap();

        // Make the prerequisite strictly newer than the output.
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("in.txt"), "hello").unwrap();

        let (g, db) = setup(dir.path(), knitfile, &["out.txt"]);
        let printer = RecordingPrinter::new();
        let summary = engine(&g, &db, &printer, dir.path(), o).build().unwrap();
        assert_eq!(summary.executed, 1);
    }
}
