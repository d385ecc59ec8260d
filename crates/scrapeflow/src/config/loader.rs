use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::{Config, ExecutionKind, JobSpecification, Schedule};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        let value: serde_json::Value = serde_json::from_str(&content)?;
        load_config_from_value(value)
    } else {
        load_config_from_str(&content)
    }
}

/// Parses a YAML document (JSON is accepted too, being a YAML subset).
pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let value: serde_json::Value = serde_yaml::from_str(content)?;
    load_config_from_value(value)
}

fn load_config_from_value(value: serde_json::Value) -> Result<Config, ConfigError> {
    validate_schema(&value)?;

    let config: Config = serde_json::from_value(value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();

    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    let scraper = &config.scraper;
    if let Err(e) = regex::Regex::new(&scraper.confirm_prompt) {
        return Err(ConfigError::InvalidPattern {
            pattern: scraper.confirm_prompt.clone(),
            reason: e.to_string(),
        });
    }

    let delay = scraper.child_delay;
    if !(delay.min_secs >= 0.0 && delay.min_secs <= delay.max_secs) {
        return Err(ConfigError::Validation {
            message: format!(
                "scraper.child_delay: min_secs ({}) must be between 0 and max_secs ({})",
                delay.min_secs, delay.max_secs
            ),
        });
    }

    if !(0..=9).contains(&config.archive.compression_level) {
        return Err(ConfigError::Validation {
            message: format!(
                "archive.compression_level must be 0-9, got {}",
                config.archive.compression_level
            ),
        });
    }

    if config.switches.archive_enabled {
        if config.archive.staging_directory.is_none() {
            return Err(ConfigError::Missing(
                "archive.staging_directory (required while archiving is enabled)".to_string(),
            ));
        }
        if config.switches.upload_enabled && config.storage.root.is_none() {
            return Err(ConfigError::Missing(
                "storage.root (required while uploading is enabled)".to_string(),
            ));
        }
    }

    for kind in [ExecutionKind::Scheduled, ExecutionKind::Manual] {
        let mut job_ids = HashSet::new();
        for job in config.jobs.for_kind(kind) {
            validate_job(job)?;

            if !job_ids.insert(job.job_id()) {
                return Err(ConfigError::InvalidJob {
                    name: job.name.clone(),
                    reason: format!("Duplicate {} job id '{}'", kind, job.job_id()),
                });
            }
        }
    }

    Ok(())
}

fn validate_job(job: &JobSpecification) -> Result<(), ConfigError> {
    job.query()?;

    if job.time_filter.is_some() && job.effective_time_filter().is_none() {
        log::warn!(
            "Job '{}': time_filter is ignored for category '{}'",
            job.name,
            job.category
        );
    }

    if let Some(Schedule::Cron(expression)) = &job.schedule {
        let fields = expression.split_whitespace().count();
        if !(6..=7).contains(&fields) {
            return Err(ConfigError::InvalidJob {
                name: job.name.clone(),
                reason: format!(
                    "Cron expression '{}' must have 6 or 7 fields (seconds first), got {}",
                    expression, fields
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{Category, TimeFilter};

    const MINIMAL: &str = r#"
version: "1.0"
worker_count: 2
scraper:
  program: poetry
  base_args: [run, python, Urs.py]
  working_directory: /opt/urs/urs
  scrapes_directory: /opt/urs/scrapes
archive:
  staging_directory: /var/lib/scrapeflow/staging
storage:
  root: /var/lib/scrapeflow/objects
"#;

    fn with_jobs(jobs: &str) -> String {
        format!("{}{}", MINIMAL, jobs)
    }

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.scraper.locate_attempts, 5);
        assert_eq!(config.scraper.locate_delay_ms, 2000);
        assert_eq!(config.scraper.confirm_prompt, r"\[Y/N\]");
        assert_eq!(config.archive.compression_level, 6);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retry_delay_secs, 300);
        assert!(config.switches.master_enabled);
        assert!(config.jobs.scheduled.is_empty());
    }

    #[test]
    fn test_load_jobs() {
        let yaml = with_jobs(
            r#"
jobs:
  scheduled:
    - name: ExampleSub
      category: top
      n_results: 25
      time_filter: day
      schedule: "0 0 */6 * * *"
  manual:
    - name: ExampleSub
      category: s
      keywords: "cashback rewards"
      options:
        csv: true
"#,
        );

        let config = load_config_from_str(&yaml).unwrap();
        assert_eq!(config.jobs.scheduled.len(), 1);
        let job = &config.jobs.scheduled[0];
        assert_eq!(job.category, Category::Top);
        assert_eq!(job.time_filter, Some(TimeFilter::Day));
        assert!(job.enabled);
        assert!(job.options.auto_confirm);

        let manual = &config.jobs.manual[0];
        assert_eq!(manual.category, Category::Search);
        assert!(manual.options.csv);
    }

    #[test]
    fn test_load_json_document() {
        let json = r#"{
            "version": "1.0",
            "scraper": {
                "program": "urs",
                "working_directory": "/opt/urs",
                "scrapes_directory": "/opt/urs/scrapes"
            },
            "switches": { "archive_enabled": false }
        }"#;

        let config = load_config_from_str(json).unwrap();
        assert!(!config.switches.archive_enabled);
    }

    #[test]
    fn test_invalid_version() {
        let yaml = MINIMAL.replace("\"1.0\"", "\"2.0\"");
        assert!(load_config_from_str(&yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected_by_schema() {
        let yaml = format!("{}\nunexpected: true\n", MINIMAL);
        let result = load_config_from_str(&yaml);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_search_without_keywords_rejected() {
        let yaml = with_jobs(
            r#"
jobs:
  manual:
    - name: ExampleSub
      category: search
      n_results: 10
"#,
        );
        let result = load_config_from_str(&yaml);
        assert!(matches!(result, Err(ConfigError::InvalidJob { .. })));
    }

    #[test]
    fn test_duplicate_job_ids_rejected() {
        let yaml = with_jobs(
            r#"
jobs:
  scheduled:
    - name: ExampleSub
      category: hot
      n_results: 10
    - name: ExampleSub
      category: hot
      n_results: 10
      enabled: false
"#,
        );
        let result = load_config_from_str(&yaml);
        assert!(matches!(result, Err(ConfigError::InvalidJob { .. })));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let yaml = with_jobs(
            r#"
jobs:
  scheduled:
    - name: ExampleSub
      category: hot
      n_results: 10
      schedule: "0 * * * *"
"#,
        );
        assert!(load_config_from_str(&yaml).is_err());
    }

    #[test]
    fn test_invalid_prompt_pattern() {
        let yaml = MINIMAL.replace(
            "  scrapes_directory: /opt/urs/scrapes\n",
            "  scrapes_directory: /opt/urs/scrapes\n  confirm_prompt: \"[Y/N\"\n",
        );
        let result = load_config_from_str(&yaml);
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_missing_storage_root_when_uploading() {
        let yaml = MINIMAL.replace("storage:\n  root: /var/lib/scrapeflow/objects\n", "");
        let result = load_config_from_str(&yaml);
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_inverted_delay_range_rejected() {
        let yaml = MINIMAL.replace(
            "  scrapes_directory: /opt/urs/scrapes\n",
            "  scrapes_directory: /opt/urs/scrapes\n  child_delay: { min_secs: 9, max_secs: 2 }\n",
        );
        assert!(load_config_from_str(&yaml).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scrapeflow.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.scraper.program, "poetry");

        let missing = load_config(dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));
    }
}
