//! Command-line surface and invocation dispatch.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::db::{self, Db};
use crate::error::{KnitError, Result};
use crate::exec::{BuildOpts, Engine};
use crate::expand::VarExpander;
use crate::graph::{self, FileRuleSource};
use crate::printer::{self, Printer, QuietPrinter};
use crate::rules::{RuleSet, Target};

pub fn command() -> Command {
    Command::new("knit")
        .version(env!("CARGO_PKG_VERSION"))
        .about("An incremental build orchestrator")
        .disable_version_flag(true)
        .arg(
            Arg::new("args")
                .help("NAME=VALUE assignments and targets to build")
                .num_args(0..),
        )
        .arg(
            Arg::new("always-build")
                .short('B')
                .long("always-build")
                .help("Treat every node as out of date")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cache")
                .long("cache")
                .value_name("DIR")
                .help("Keep the build database under DIR, keyed by project path"),
        )
        .arg(
            Arg::new("directory")
                .short('C')
                .value_name("DIR")
                .help("Change to DIR before doing anything"),
        )
        .arg(
            Arg::new("dry-run")
                .short('n')
                .long("dry-run")
                .help("Print recipes without running them")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .value_name("FILE")
                .help("Rule file to use (searched up the directory hierarchy)"),
        )
        .arg(
            Arg::new("hash")
                .long("hash")
                .value_name("BOOL")
                .num_args(0..=1)
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool))
                .help("Decide staleness by content hash (default on)"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("Number of parallel workers (default: CPU count)"),
        )
        .arg(
            Arg::new("keep-going")
                .long("keep-going")
                .help("Keep building independent work after a failure")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Do not echo commands or progress")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("style")
                .short('s')
                .long("style")
                .value_name("STYLE")
                .help("Output style: basic, steps, or progress"),
        )
        .arg(
            Arg::new("shell")
                .long("shell")
                .value_name("NAME")
                .help("Shell to run recipe lines with"),
        )
        .arg(
            Arg::new("tool")
                .short('t')
                .long("tool")
                .value_name("TOOL")
                .help("Run a sub-tool: clean, targets"),
        )
        .arg(
            Arg::new("updated")
                .short('u')
                .value_name("PATH")
                .action(ArgAction::Append)
                .help("Treat PATH as updated regardless of its content"),
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .long("debug")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .help("Print version information")
                .action(ArgAction::Version),
        )
}

/// Parse arguments, run the invocation, and return the process exit
/// code.
pub fn run() -> i32 {
    let matches = command().get_matches();
    init_logging(matches.get_flag("debug"));

    match execute(&matches) {
        Ok(()) => 0,
        Err(KnitError::NothingToDo) => 0,
        Err(err) => {
            eprintln!("knit: {}", err);
            err.exit_code()
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("knit=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn execute(matches: &ArgMatches) -> Result<()> {
    if let Some(dir) = matches.get_one::<String>("directory") {
        std::env::set_current_dir(dir)
            .map_err(|e| KnitError::Config(format!("cannot chdir to '{}': {}", dir, e)))?;
    }
    let cwd = std::env::current_dir()?;
    let config = Config::load_from_dir(&cwd)?;

    let rule_file = matches
        .get_one::<String>("file")
        .cloned()
        .unwrap_or_else(|| config.build.rule_file.clone());
    let (project_root, root_file) = locate_rule_file(&cwd, &rule_file)?;

    let mut source = FileRuleSource::new(project_root.clone(), root_file);
    let sets = graph::load_rule_sets(&mut source)?;

    let (cli_vars, targets) = split_args(matches);
    let targets = if targets.is_empty() {
        let main = sets[0]
            .main_target()
            .ok_or_else(|| KnitError::Config("no targets given and no default target".to_string()))?;
        vec![main.to_string()]
    } else {
        targets
    };

    let mut g = graph::build(&sets, &project_root, &targets)?;
    graph::expand_recipes(&mut g, &sets, &VarExpander, &cli_vars, &env_table())?;

    let opts = build_opts(matches, &config);
    let style = matches
        .get_one::<String>("style")
        .cloned()
        .unwrap_or_else(|| config.output.style.clone());
    let total = g.nodes.iter().filter(|n| !n.recipe.is_empty()).count();
    let mut boxed: Box<dyn Printer> = printer::for_style(&style, total)
        .ok_or_else(|| KnitError::Config(format!("unknown output style '{}'", style)))?;
    if matches.get_flag("quiet") || config.output.quiet {
        boxed = Box::new(QuietPrinter(boxed));
    }

    let cache = matches
        .get_one::<String>("cache")
        .map(PathBuf::from)
        .or_else(|| config.build.cache.as_ref().map(PathBuf::from));
    let database = Db::open(&db::cache_dir(&project_root, cache.as_deref()))?;

    let engine = Engine::new(&g, &database, boxed.as_ref(), &project_root, opts);

    match matches.get_one::<String>("tool").map(String::as_str) {
        Some("clean") => engine.clean(),
        Some("targets") => {
            list_targets(&sets);
            Ok(())
        }
        Some(other) => Err(KnitError::Config(format!(
            "unknown tool '{}' (available: clean, targets)",
            other
        ))),
        None => run_build(&engine, boxed.as_ref(), &targets),
    }
}

fn run_build(engine: &Engine, printer: &dyn Printer, targets: &[String]) -> Result<()> {
    match engine.build() {
        Ok(summary) => {
            tracing::debug!(executed = summary.executed, "build finished");
            Ok(())
        }
        Err(KnitError::NothingToDo) => {
            printer.info(&format!("'{}' is up to date", targets.join("' '")));
            Err(KnitError::NothingToDo)
        }
        Err(err) => Err(err),
    }
}

/// Positional arguments split into `NAME=VALUE` assignments and
/// targets.
fn split_args(matches: &ArgMatches) -> (HashMap<String, String>, Vec<String>) {
    let mut vars = HashMap::new();
    let mut targets = Vec::new();
    if let Some(args) = matches.get_many::<String>("args") {
        for arg in args {
            match arg.split_once('=') {
                Some((name, value))
                    if !name.is_empty()
                        && name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
                {
                    vars.insert(name.to_string(), value.to_string());
                }
                _ => targets.push(arg.clone()),
            }
        }
    }
    (vars, targets)
}

/// The environment, exposed to recipe expansion as `env.NAME`.
fn env_table() -> HashMap<String, String> {
    std::env::vars()
        .map(|(k, v)| (format!("env.{}", k), v))
        .collect()
}

fn build_opts(matches: &ArgMatches, config: &Config) -> BuildOpts {
    let shell = matches
        .get_one::<String>("shell")
        .cloned()
        .unwrap_or_else(|| config.build.shell.clone());
    let updated: HashSet<String> = matches
        .get_many::<String>("updated")
        .map(|vals| {
            vals.map(|p| graph::normalize(Path::new(p)))
                .collect()
        })
        .unwrap_or_default();
    BuildOpts {
        always_build: matches.get_flag("always-build"),
        hash: matches
            .get_one::<bool>("hash")
            .copied()
            .unwrap_or(config.build.hash),
        dry_run: matches.get_flag("dry-run"),
        keep_going: matches.get_flag("keep-going"),
        jobs: matches
            .get_one::<usize>("jobs")
            .copied()
            .unwrap_or_else(|| config.jobs()),
        shell: vec![shell, "-c".to_string()],
        updated,
    }
}

/// `-f` may name a file directly or a name to search upward for.
fn locate_rule_file(cwd: &Path, rule_file: &str) -> Result<(PathBuf, PathBuf)> {
    let direct = cwd.join(rule_file);
    if rule_file.contains(std::path::MAIN_SEPARATOR) && direct.is_file() {
        let root = direct
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());
        return Ok((root, direct));
    }
    FileRuleSource::find_root(cwd, rule_file)
}

fn list_targets(sets: &[RuleSet]) {
    let mut seen = Vec::new();
    for set in sets {
        for rule in &set.rules {
            for target in &rule.targets {
                if let Target::Plain(name) = target {
                    if !seen.contains(name) {
                        println!("{}", name);
                        seen.push(name.clone());
                    }
                }
            }
        }
    }
}
