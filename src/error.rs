use thiserror::Error;

use crate::rules::SourceLoc;

pub type Result<T> = std::result::Result<T, KnitError>;

#[derive(Error, Debug)]
pub enum KnitError {
    #[error("{0}")]
    Config(String),

    #[error("{file}:{line}: {msg}")]
    Parse {
        file: String,
        line: usize,
        msg: String,
    },

    #[error("no rule to make target '{0}'")]
    NoRule(String),

    #[error("dependency cycle: '{from}' ({from_loc}) depends on '{to}' ({to_loc})")]
    Cycle {
        from: String,
        from_loc: SourceLoc,
        to: String,
        to_loc: SourceLoc,
    },

    #[error("ambiguous rules for target '{target}': declared at {first} and {second}")]
    Ambiguous {
        target: String,
        first: SourceLoc,
        second: SourceLoc,
    },

    #[error("recipe for '{target}' failed: {msg}")]
    Recipe { target: String, msg: String },

    #[error("expansion error: {0}")]
    Expand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] serde_json::Error),

    #[error("nothing to be done")]
    NothingToDo,
}

impl KnitError {
    /// Process exit code this error maps to: 0 for the up-to-date
    /// outcome, 1 for build failures, 2 for configuration and graph
    /// problems.
    pub fn exit_code(&self) -> i32 {
        match self {
            KnitError::NothingToDo => 0,
            KnitError::Recipe { .. } | KnitError::Io(_) | KnitError::Db(_) => 1,
            KnitError::Config(_)
            | KnitError::Parse { .. }
            | KnitError::NoRule(_)
            | KnitError::Cycle { .. }
            | KnitError::Ambiguous { .. }
            | KnitError::Expand(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(KnitError::NothingToDo.exit_code(), 0);
        assert_eq!(
            KnitError::Recipe {
                target: "a".to_string(),
                msg: "exit 1".to_string()
            }
            .exit_code(),
            1
        );
        assert_eq!(KnitError::Config("bad flag".to_string()).exit_code(), 2);
        assert_eq!(KnitError::NoRule("missing.o".to_string()).exit_code(), 2);
    }
}
