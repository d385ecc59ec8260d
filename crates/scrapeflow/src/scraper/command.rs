//! Command lines for the external scraping tool.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::config::{JobSpecification, ScraperConfig};
use crate::error::ConfigError;

/// A fully resolved invocation of the external tool. The working directory
/// is applied to the child process only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ScrapeCommand {
    fn base(config: &ScraperConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.base_args.clone(),
            working_directory: PathBuf::from(&config.working_directory),
            env: config.env.clone(),
        }
    }

    /// `-r <subject> <category code> <count|keywords> [time filter] [--csv] [--rules]`
    pub fn parent(config: &ScraperConfig, job: &JobSpecification) -> Result<Self, ConfigError> {
        let mut command = Self::base(config);
        command.args.extend([
            "-r".to_string(),
            job.name.clone(),
            job.category.code().to_string(),
            job.query()?.argument(),
        ]);
        if let Some(tf) = job.effective_time_filter() {
            command.args.push(tf.as_str().to_string());
        }
        if job.options.csv {
            command.args.push("--csv".to_string());
        }
        if job.options.rules {
            command.args.push("--rules".to_string());
        }
        Ok(command)
    }

    /// `-c <url> <limit>`; a limit of 0 fetches every child.
    pub fn children(config: &ScraperConfig, url: &str) -> Self {
        let mut command = Self::base(config);
        command.args.extend([
            "-c".to_string(),
            url.to_string(),
            config.child_limit.to_string(),
        ]);
        command
    }
}

impl fmt::Display for ScrapeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// How to handle the tool's interactive confirmation prompt.
#[derive(Debug, Clone)]
pub struct ConfirmPolicy {
    pub pattern: Regex,
    pub response: String,
    pub prompt_timeout: Duration,
    /// The prompt must appear within `prompt_timeout`; otherwise the call fails.
    pub required: bool,
}

impl ConfirmPolicy {
    pub fn from_config(config: &ScraperConfig, auto_confirm: bool) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&config.confirm_prompt).map_err(|e| ConfigError::InvalidPattern {
            pattern: config.confirm_prompt.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern,
            response: config.confirm_response.clone(),
            prompt_timeout: config.prompt_timeout(),
            required: !auto_confirm,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub command: ScrapeCommand,
    pub timeout: Duration,
    pub confirm: ConfirmPolicy,
}

impl InvokeRequest {
    pub fn new(command: ScrapeCommand, config: &ScraperConfig, auto_confirm: bool) -> Result<Self, ConfigError> {
        Ok(Self {
            command,
            timeout: config.timeout(),
            confirm: ConfirmPolicy::from_config(config, auto_confirm)?,
        })
    }
}
