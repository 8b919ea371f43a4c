pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod expand;
pub mod graph;
pub mod printer;
pub mod rules;

pub use db::Db;
pub use error::{KnitError, Result};
pub use exec::{BuildOpts, Engine};
pub use graph::{Graph, Node};
pub use rules::{Rule, RuleSet};
