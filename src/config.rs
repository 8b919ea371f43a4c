use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{KnitError, Result};

/// Tool configuration, beneath CLI flags: `knit.toml` in the project
/// root, then `KNIT_*` environment variables, then built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub build: BuildConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Name of the rule file searched up the directory hierarchy.
    pub rule_file: String,
    /// Shell each recipe line is passed to (as `<shell> -c line`).
    pub shell: String,
    /// Worker count; 0 means the CPU count.
    pub jobs: usize,
    /// Content-hash staleness; timestamps only when false.
    pub hash: bool,
    /// User cache directory; the default keeps state in `.knit` under
    /// the project root.
    pub cache: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// One of `basic`, `steps`, `progress`.
    pub style: String,
    pub quiet: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            build: BuildConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            rule_file: "knitfile".to_string(),
            shell: "sh".to_string(),
            jobs: 0,
            hash: true,
            cache: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            style: "basic".to_string(),
            quiet: false,
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration for a project directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        let config_file = dir.join("knit.toml");
        if config_file.exists() {
            builder = builder.add_source(File::from(config_file));
        }

        builder = builder.add_source(
            Environment::with_prefix("KNIT")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder
            .build()
            .map_err(|e| KnitError::Config(format!("bad configuration: {}", e)))?;

        let mut result = Config::default();
        if let Ok(build) = loaded.get::<BuildConfig>("build") {
            result.build = build;
        }
        if let Ok(output) = loaded.get::<OutputConfig>("output") {
            result.output = output;
        }
        result.validate()?;
        Ok(result)
    }

    fn validate(&self) -> Result<()> {
        match self.output.style.as_str() {
            "basic" | "steps" | "progress" => Ok(()),
            other => Err(KnitError::Config(format!(
                "unknown output style '{}' (expected basic, steps, or progress)",
                other
            ))),
        }
    }

    /// Effective worker count.
    pub fn jobs(&self) -> usize {
        if self.build.jobs == 0 {
            num_cpus::get()
        } else {
            self.build.jobs
        }
    }
}
