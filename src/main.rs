use anyhow::{Context, Result};
use bisection_search::config::Config;
use bisection_search::env::{DeviceTestEnv, HostTestEnv, ProbeCommand, TestEnvironment};
use bisection_search::report::{RunReport, Target};
use bisection_search::search::{bug_search, SearchOutcome};
use bisection_search::testable::{device_vm_command, host_vm_command, Dex2OatWrapperTestable};
use chrono::Utc;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "bisection-search",
    about = "Finds the method and optimization pass responsible for a miscompilation",
    after_help = "Example:\n  bisection-search --cp test_float/classes.dex --correct-output test_float/out_comp Test19742",
    version
)]
struct Args {
    /// Classpath holding the test class
    #[arg(long, visible_alias = "cp")]
    classpath: String,

    /// File containing correct output for the program
    #[arg(long)]
    correct_output: PathBuf,

    /// Run on host instead of an attached device
    #[arg(long)]
    host: bool,

    /// Use the 64-bit runtime
    #[arg(long)]
    x64: bool,

    /// Per-probe timeout in seconds (defaults to the configured value)
    #[arg(long)]
    timeout: Option<u64>,

    /// Extra option passed to the runtime (repeatable)
    #[arg(long = "dalvikvm-option", value_name = "OPT", allow_hyphen_values = true)]
    dalvikvm_options: Vec<String>,

    /// Argument passed to the program's main method (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    program_args: Vec<String>,

    /// Write a JSON report of the run to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log every probe to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Name of class to run
    classname: String,
}

struct RunSummary {
    outcome: SearchOutcome,
    probe_count: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut logfile = None;
    match run(&args, &mut logfile) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            if let Some(path) = logfile {
                eprintln!("Logfile: {}", path.display());
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args, logfile: &mut Option<PathBuf>) -> Result<()> {
    let started_at = Utc::now();
    let config = Config::load();
    info!(path = %Config::config_location(), ?config, "configuration loaded");
    let correct_output = fs::read_to_string(&args.correct_output).with_context(|| {
        format!("Failed to read correct output '{}'", args.correct_output.display())
    })?;
    let timeout = Duration::from_secs(args.timeout.unwrap_or(config.timeout_secs));

    let (target, summary) = if args.host {
        let env = HostTestEnv::new(&args.classpath, args.x64, &config)?;
        *logfile = Some(env.logfile().to_path_buf());
        let base_cmd = host_vm_command(env.android_root(), args.x64);
        (Target::Host, bisect(env, base_cmd, args, &config, correct_output, timeout)?)
    } else {
        let env = DeviceTestEnv::new(&args.classpath, &config)?;
        *logfile = Some(env.logfile().to_path_buf());
        let base_cmd = device_vm_command(args.x64);
        (Target::Device, bisect(env, base_cmd, args, &config, correct_output, timeout)?)
    };

    match &summary.outcome {
        SearchOutcome::NoBug => println!("Couldn't find any bugs."),
        SearchOutcome::FaultyMethod { method } => {
            println!("Faulty method: {}. Fails with just mandatory passes.", method)
        }
        SearchOutcome::FaultyMethodAndPass { method, pass } => {
            println!("Faulty method and pass: {}, {}.", method, pass)
        }
    }
    let log_path = logfile.clone().unwrap_or_default();
    println!("Logfile: {}", log_path.display());

    if let Some(report_path) = &args.report {
        RunReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            target,
            classpath: args.classpath.clone(),
            class_name: args.classname.clone(),
            outcome: summary.outcome,
            probe_count: summary.probe_count,
            logfile: log_path,
        }
        .write(report_path)?;
    }
    Ok(())
}

fn bisect<E: TestEnvironment>(
    env: E,
    base_cmd: ProbeCommand,
    args: &Args,
    config: &Config,
    correct_output: String,
    timeout: Duration,
) -> Result<RunSummary> {
    let base_cmd = base_cmd.args(args.dalvikvm_options.iter().cloned());
    let mut testable = Dex2OatWrapperTestable::new(base_cmd, env, &args.classname, correct_output, timeout)?
        .with_program_args(args.program_args.clone())
        .with_extra_mandatory_passes(config.extra_mandatory_passes.iter().cloned());

    let outcome = bug_search(&mut testable)?;
    cleanup_after(testable.env_mut(), &outcome);
    Ok(RunSummary {
        outcome,
        probe_count: testable.probe_count(),
    })
}

/// Removes scratch artifacts after a run that found nothing; evidence of a
/// found bug stays on disk. Returns whether the scratch area was cleaned.
///
/// A completed search is reported even when cleanup fails.
fn cleanup_after<E: TestEnvironment>(env: &mut E, outcome: &SearchOutcome) -> bool {
    if *outcome != SearchOutcome::NoBug {
        return false;
    }
    match env.cleanup() {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %format!("{:#}", err), "failed to clean up test directory");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bisection_search::env::CommandOutput;
    use bisection_search::error::BisectionError;
    use bisection_search::testable::Method;
    use std::path::Path;

    /// Counts cleanups; fails them when `broken` is set.
    struct CleanupEnv {
        broken: bool,
        cleanups: usize,
    }

    impl TestEnvironment for CleanupEnv {
        fn create_file(&mut self, name: Option<&str>) -> Result<String> {
            Ok(name.unwrap_or("tmp").to_string())
        }

        fn write_lines(&mut self, _file_path: &str, _lines: &[String]) -> Result<()> {
            Ok(())
        }

        fn run_command(&mut self, cmd: &ProbeCommand, _timeout: Duration) -> Result<CommandOutput> {
            anyhow::bail!("unexpected command {}", cmd)
        }

        fn classpath(&self) -> &str {
            "classes.dex"
        }

        fn logfile(&self) -> &Path {
            Path::new("/scratch/log")
        }

        fn cleanup(&mut self) -> Result<()> {
            self.cleanups += 1;
            if self.broken {
                return Err(BisectionError::Environment("device went away".to_string()).into());
            }
            Ok(())
        }
    }

    #[test]
    fn test_cleanup_runs_only_without_a_bug() {
        let mut env = CleanupEnv {
            broken: false,
            cleanups: 0,
        };
        assert!(cleanup_after(&mut env, &SearchOutcome::NoBug));
        let found = SearchOutcome::FaultyMethod {
            method: Method::new("void Test.main()"),
        };
        assert!(!cleanup_after(&mut env, &found));
        assert_eq!(env.cleanups, 1);
    }

    #[test]
    fn test_failed_cleanup_does_not_fail_the_run() {
        let mut env = CleanupEnv {
            broken: true,
            cleanups: 0,
        };
        assert!(!cleanup_after(&mut env, &SearchOutcome::NoBug));
        assert_eq!(env.cleanups, 1);
    }
}
