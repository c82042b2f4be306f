use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use taskwarden_lib::config::AppConfig;
use taskwarden_lib::error::AppResult;
use taskwarden_lib::scheduler::jobs::{load_job_file, plan_jobs};
use taskwarden_lib::scheduler::registry::BUILTIN_HANDLERS;
use taskwarden_lib::{logging, Runtime};

/// Taskwarden: tasks, reminders and secrets behind an HTTP API, driven by a
/// cron job runner.
#[derive(Parser, Debug)]
#[command(name = "taskwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the scheduler and the HTTP API until interrupted
    Serve {
        /// Job-spec YAML file
        #[arg(short = 'j', long = "jobs")]
        jobs: Option<PathBuf>,
        /// Address the HTTP API listens on
        #[arg(short = 'b', long = "bind")]
        bind: Option<SocketAddr>,
        /// SQLite database URL
        #[arg(short = 'd', long = "database")]
        database: Option<String>,
    },
    /// Validate a job-spec file and print the resulting plan
    CheckJobs {
        file: PathBuf,
    },
    /// Run one job handler immediately
    RunJob {
        /// Handler name, e.g. `task_check`
        name: String,
        /// Parameter handed to the handler
        #[arg(default_value = "")]
        parameter: String,
    },
    /// List the job handlers this build provides
    Handlers,
    /// Send one email through the configured SMTP server
    SendMail {
        #[arg(short = 's', long = "subject")]
        subject: String,
        #[arg(long = "body")]
        body: String,
        /// Recipient; MAIL_RECEIVER is used when none is given
        #[arg(long = "to")]
        to: Vec<String>,
        #[arg(long = "cc")]
        cc: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    let cli = Cli::parse();

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command) -> AppResult<()> {
    match command {
        Command::Serve {
            jobs,
            bind,
            database,
        } => {
            let mut config = AppConfig::from_env()?;
            if let Some(jobs) = jobs {
                config.jobs_file = jobs;
            }
            if let Some(bind) = bind {
                config.http_bind = bind;
            }
            if let Some(database) = database {
                config.database_url = database;
            }
            taskwarden_lib::run(config).await
        }
        Command::CheckJobs { file } => check_jobs(&file),
        Command::RunJob { name, parameter } => {
            let runtime = Runtime::init(AppConfig::from_env()?).await?;
            let result = runtime.run_job(&name, &parameter).await;
            runtime.shutdown().await;
            result?;
            println!("Job '{}' completed", name);
            Ok(())
        }
        Command::Handlers => {
            for name in BUILTIN_HANDLERS {
                println!("{}", name);
            }
            Ok(())
        }
        Command::SendMail {
            subject,
            body,
            to,
            cc,
        } => taskwarden_lib::send_mail(&subject, &body, to, cc).await,
    }
}

fn check_jobs(file: &std::path::Path) -> AppResult<()> {
    let spec = load_job_file(file)?;
    let plan = plan_jobs(&spec, |name| BUILTIN_HANDLERS.contains(&name))?;

    for job in &plan.jobs {
        println!(
            "{:<24} {:<20} {}({})",
            job.name, job.expression, job.handler, job.parameters
        );
    }
    for warning in &plan.warnings {
        println!("warning: {}", warning);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::parse_from([
            "taskwarden",
            "serve",
            "--jobs",
            "ops.yml",
            "--bind",
            "0.0.0.0:9000",
        ]);
        assert_eq!(
            cli.command,
            Command::Serve {
                jobs: Some(PathBuf::from("ops.yml")),
                bind: Some("0.0.0.0:9000".parse().expect("addr")),
                database: None,
            }
        );
    }

    #[test]
    fn test_run_job_parameter_is_optional() {
        let cli = Cli::parse_from(["taskwarden", "run-job", "task_check"]);
        assert_eq!(
            cli.command,
            Command::RunJob {
                name: "task_check".into(),
                parameter: String::new(),
            }
        );
    }

    #[test]
    fn test_send_mail_repeats_recipients() {
        let cli = Cli::parse_from([
            "taskwarden",
            "send-mail",
            "-s",
            "Hi",
            "--body",
            "There",
            "--to",
            "a@example.com",
            "--to",
            "b@example.com",
        ]);
        match cli.command {
            Command::SendMail { to, cc, .. } => {
                assert_eq!(to, vec!["a@example.com", "b@example.com"]);
                assert!(cc.is_empty());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_check_jobs_rejects_bad_cron() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.yml");
        std::fs::write(&path, "tasks:\n  - name: x\n    schedule: \"* * * * *\"\n").expect("write");
        assert!(check_jobs(&path).is_err());

        std::fs::write(&path, "tasks:\n  - name: task_check\n    schedule: \"0 */5 * * * *\"\n")
            .expect("write");
        assert!(check_jobs(&path).is_ok());
    }
}
