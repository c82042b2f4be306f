use crate::error::{AppError, AppResult};
use crate::scheduler::registry::{EXPIRY_CHECK, REMINDER_DISPATCH, TASK_CHECK};
use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

pub const DEFAULT_REMINDER_DISPATCH_SCHEDULE: &str = "0 * * * * *";
pub const DEFAULT_TASK_CHECK_SCHEDULE: &str = "0 0 * * * *";
pub const EXPIRY_CHECK_SCHEDULE: &str = "0 * * * * *";

/// Top level of a job-spec file. `jobs:` is accepted as an alias.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobFile {
    #[serde(default, alias = "jobs")]
    pub tasks: Vec<JobSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub schedule: String,
    /// Handler name, optionally as `name(param)`. Defaults to the job name.
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub parameters: Option<String>,
    /// RFC 3339 instant after which an expiry event is published.
    #[serde(default)]
    pub deadline: Option<String>,
    /// Mandatory jobs make startup fail when their handler is unknown.
    #[serde(default)]
    pub required: bool,
}

/// A validated job ready to be scheduled.
pub struct JobDefinition {
    pub name: String,
    pub expression: String,
    pub schedule: Cron,
    pub handler: String,
    pub parameters: String,
    pub deadline: Option<DateTime<Utc>>,
    pub required: bool,
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .field("handler", &self.handler)
            .field("parameters", &self.parameters)
            .field("deadline", &self.deadline)
            .field("required", &self.required)
            .finish()
    }
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        expression: &str,
        handler: impl Into<String>,
        parameters: impl Into<String>,
    ) -> AppResult<Self> {
        let name = name.into();
        Ok(Self {
            schedule: parse_cron(&name, expression)?,
            expression: expression.trim().to_string(),
            name,
            handler: handler.into(),
            parameters: parameters.into(),
            deadline: None,
            required: false,
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
        self.schedule
            .find_next_occurrence(&after, false)
            .map_err(|e| {
                AppError::configuration(format!(
                    "Failed to compute next run of job '{}': {}",
                    self.name, e
                ))
            })
    }
}

/// Validated jobs plus the non-fatal problems found on the way.
#[derive(Debug, Default)]
pub struct JobPlan {
    pub jobs: Vec<JobDefinition>,
    pub warnings: Vec<String>,
}

impl JobPlan {
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|job| job.name == name)
    }
}

pub fn parse_cron(job_name: &str, expression: &str) -> AppResult<Cron> {
    Cron::new(expression.trim())
        .with_seconds_required()
        .parse()
        .map_err(|e| {
            AppError::configuration(format!(
                "Invalid cron expression '{}' for job '{}': {}",
                expression, job_name, e
            ))
        })
}

/// Splits `name(param)` into its parts. Anything else is a bare name.
pub fn parse_function_call(call: &str) -> (String, String) {
    let call = call.trim();
    if let (Some(open), Some(close)) = (call.find('('), call.rfind(')')) {
        if open < close {
            let name = call[..open].trim().to_string();
            let param = call[open + 1..close].trim().to_string();
            return (name, param);
        }
    }
    (call.trim_end_matches("()").trim().to_string(), String::new())
}

/// Store key holding a job's deadline.
pub fn expiry_key(job_name: &str) -> String {
    format!("task:{}:expiry", job_name.trim().replace(' ', "_"))
}

pub fn parse_job_file(yaml: &str) -> AppResult<JobFile> {
    if yaml.trim().is_empty() {
        return Ok(JobFile::default());
    }
    serde_yaml::from_str(yaml)
        .map_err(|e| AppError::configuration(format!("Failed to parse job file: {}", e)))
}

pub fn load_job_file(path: &Path) -> AppResult<JobFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::configuration(format!(
            "Failed to read job file '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_job_file(&raw)
}

/// Validates every entry and installs the default jobs the file leaves
/// out. Malformed cron expressions, duplicate names and unknown handlers of
/// required jobs are fatal; other problems become warnings.
pub fn plan_jobs<F>(file: &JobFile, is_known: F) -> AppResult<JobPlan>
where
    F: Fn(&str) -> bool,
{
    let mut plan = JobPlan::default();
    let mut seen = HashSet::new();

    for spec in &file.tasks {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(AppError::configuration("Job name cannot be empty"));
        }
        if !seen.insert(name.to_string()) {
            return Err(AppError::configuration(format!(
                "Job '{}' is defined more than once",
                name
            )));
        }
        if spec.schedule.trim().is_empty() {
            return Err(AppError::configuration(format!(
                "Job '{}' has no schedule",
                name
            )));
        }

        let (handler, inline_param) = match spec.function.as_deref().map(str::trim) {
            Some(call) if !call.is_empty() => parse_function_call(call),
            _ => (name.to_string(), String::new()),
        };
        let parameters = if inline_param.is_empty() {
            spec.parameters.clone().unwrap_or_default()
        } else {
            if spec.parameters.as_deref().is_some_and(|p| !p.trim().is_empty()) {
                plan.warnings.push(format!(
                    "Job '{}' has both inline and separate parameters; using '{}'",
                    name, inline_param
                ));
            }
            inline_param
        };

        let mut job = JobDefinition::new(name, &spec.schedule, handler, parameters)?;
        job.required = spec.required;

        if !is_known(&job.handler) {
            if job.required {
                return Err(AppError::configuration(format!(
                    "No handler '{}' registered for required job '{}'",
                    job.handler, name
                )));
            }
            plan.warnings.push(format!(
                "No handler '{}' registered for job '{}'; its ticks will be skipped",
                job.handler, name
            ));
        }

        if let Some(raw) = spec.deadline.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            match DateTime::parse_from_rfc3339(raw) {
                Ok(deadline) => job.deadline = Some(deadline.with_timezone(&Utc)),
                Err(e) if job.required => {
                    return Err(AppError::configuration(format!(
                        "Invalid deadline '{}' for job '{}': {}",
                        raw, name, e
                    )))
                }
                Err(e) => plan.warnings.push(format!(
                    "Ignoring invalid deadline '{}' for job '{}': {}",
                    raw, name, e
                )),
            }
        }

        plan.jobs.push(job);
    }

    for (handler, schedule) in [
        (REMINDER_DISPATCH, DEFAULT_REMINDER_DISPATCH_SCHEDULE),
        (TASK_CHECK, DEFAULT_TASK_CHECK_SCHEDULE),
        (EXPIRY_CHECK, EXPIRY_CHECK_SCHEDULE),
    ] {
        let covered = plan
            .jobs
            .iter()
            .any(|job| job.handler == handler || job.name == handler);
        if !covered {
            plan.jobs
                .push(JobDefinition::new(handler, schedule, handler, "")?);
        }
    }

    Ok(plan)
}
