//! Validation for configuration files.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{ConfigFile, WILDCARD_HOST};
use crate::types::is_valid_task_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for ConfigFile {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.hosts.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "hosts.empty",
                message: format!("{} has no host or {WILDCARD_HOST} entries", self.path.display()),
            });
        }

        for (host, cfg) in &self.hosts {
            let Some(rakes) = &cfg.rakes else {
                continue;
            };

            if rakes.is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "rakes.empty",
                    message: format!("host {host} has an empty rakes list"),
                });
            }

            let mut seen = HashSet::new();
            for entry in rakes {
                let Some(name) = entry.rake.as_deref() else {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Warning,
                        code: "rakes.name.missing",
                        message: format!("host {host} has a rakes entry without a rake name"),
                    });
                    continue;
                };

                // Identity is matched token-by-token against process argv.
                if !is_valid_task_name(name) {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Error,
                        code: "rakes.name.invalid",
                        message: format!(
                            "host {host}: rake name {name:?} must be a single token without whitespace"
                        ),
                    });
                }

                if !seen.insert(name) {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Warning,
                        code: "rakes.name.duplicate",
                        message: format!(
                            "host {host}: rake {name} is listed more than once; last entry wins"
                        ),
                    });
                }
            }
        }

        if let Some(wait) = self
            .hosts
            .values()
            .filter_map(|cfg| cfg.conf_reload_wait)
            .find(|wait| *wait == 0)
        {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "conf_reload_wait.zero",
                message: format!(
                    "conf_reload_wait of {wait} reloads the config on every tick"
                ),
            });
        }

        issues
    }
}

/// Error-level issues only, rendered one per line.
pub fn render_errors(issues: &[ValidationIssue]) -> Option<String> {
    let errors: Vec<String> = issues
        .iter()
        .filter(|issue| issue.level == ValidationLevel::Error)
        .map(|issue| format!("[{}] {}", issue.code, issue.message))
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}
