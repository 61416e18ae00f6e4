//! Probe harness: one recompile-and-run of the program under test with
//! optional method and pass filters.

use crate::env::{ProbeCommand, TestEnvironment};
use crate::error::BisectionError;
use crate::util::tail_chars;
use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Passes that run regardless of `--run-passes`; filtering them out would
/// produce code the runtime cannot execute.
pub const MANDATORY_PASSES: &[&str] = &[
    "x86_memory_operand_generation",
    "dex_cache_array_fixups_arm",
    "dex_cache_array_fixups_mips",
    "pc_relative_fixups_x86",
    "pc_relative_fixups_mips",
];

/// Structural entries of the pass dump that are not optimization passes.
pub const NON_PASSES: &[&str] = &["builder", "prepare_for_register_allocation", "liveness", "register"];

const COMPILED_METHODS_FILE: &str = "compiled_methods";
const PASSES_TO_RUN_FILE: &str = "passes_to_run";
const STDERR_TAIL_MAX_CHARS: usize = 2_000;

static TIMINGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TIMINGS ([^\r\n]+)").expect("valid TIMINGS regex"));

/// Runtime invocation for a host build tree's output directory.
pub fn host_vm_command(android_root: &Path, x64: bool) -> ProbeCommand {
    let vm = if x64 { "dalvikvm64" } else { "dalvikvm" };
    ProbeCommand::new(android_root.join("bin").join(vm).to_string_lossy()).args([
        "-XXlib:libart.so".to_string(),
        "-Xnorelocate".to_string(),
        format!(
            "-Ximage:{}",
            android_root.join("framework/core-optimizing-pic.art").display()
        ),
    ])
}

/// Runtime invocation on a device, resolved through the device's `PATH`.
pub fn device_vm_command(x64: bool) -> ProbeCommand {
    ProbeCommand::new(if x64 { "dalvikvm64" } else { "dalvikvm" })
}

/// One compiled unit, as named by the compiler's pass dump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Method(String);

impl Method {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One optimization pass run for a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptimizationPass {
    pub name: String,
    /// Always kept when narrowing the pass list.
    pub mandatory: bool,
}

impl OptimizationPass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
        }
    }

    pub fn mandatory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: true,
        }
    }
}

impl fmt::Display for OptimizationPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// What the bisection engine needs from a compilation under test.
pub trait Testable {
    /// Compiles with the given filters and runs the program.
    ///
    /// `None` means no filter; `Some(&[])` is an empty filter. Returns
    /// `Ok(true)` iff the output matched the expected output. Crashes,
    /// timeouts and wrong output are all `Ok(false)`.
    fn test(
        &mut self,
        compiled_methods: Option<&[Method]>,
        passes_to_run: Option<&[OptimizationPass]>,
    ) -> Result<bool>;

    /// Every method compiled by an unfiltered run, in compilation order.
    fn all_methods(&mut self) -> Result<Vec<Method>>;

    /// Every optional or mandatory pass run for `method`, in pipeline order.
    fn all_passes_for_method(&mut self, method: &Method) -> Result<Vec<OptimizationPass>>;
}

/// Drives the runtime with `-Xcompiler-option` filters through a
/// [`TestEnvironment`].
pub struct Dex2OatWrapperTestable<E: TestEnvironment> {
    base_cmd: ProbeCommand,
    env: E,
    class_name: String,
    program_args: Vec<String>,
    correct_output: String,
    timeout: Duration,
    mandatory_passes: HashSet<String>,
    compiled_methods_path: String,
    passes_to_run_path: String,
    probes: usize,
}

impl<E: TestEnvironment> Dex2OatWrapperTestable<E> {
    pub fn new(
        base_cmd: ProbeCommand,
        mut env: E,
        class_name: impl Into<String>,
        correct_output: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let compiled_methods_path = env.create_file(Some(COMPILED_METHODS_FILE))?;
        let passes_to_run_path = env.create_file(Some(PASSES_TO_RUN_FILE))?;
        Ok(Self {
            base_cmd,
            env,
            class_name: class_name.into(),
            program_args: Vec::new(),
            correct_output: correct_output.into(),
            timeout,
            mandatory_passes: MANDATORY_PASSES.iter().map(|p| p.to_string()).collect(),
            compiled_methods_path,
            passes_to_run_path,
            probes: 0,
        })
    }

    /// Arguments passed to the program's main method.
    pub fn with_program_args(mut self, args: Vec<String>) -> Self {
        self.program_args = args;
        self
    }

    pub fn with_extra_mandatory_passes<I, S>(mut self, passes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mandatory_passes.extend(passes.into_iter().map(Into::into));
        self
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    /// Number of programs run so far, introspection runs included.
    pub fn probe_count(&self) -> usize {
        self.probes
    }

    fn prepare_cmd(
        &mut self,
        compiled_methods: Option<&[Method]>,
        passes_to_run: Option<&[OptimizationPass]>,
    ) -> Result<ProbeCommand> {
        // A single compiler thread keeps the per-method dump in a stable order.
        let mut cmd = self.base_cmd.clone().args(["-Xcompiler-option", "-j1"]);
        if let Some(methods) = compiled_methods {
            let lines: Vec<String> = methods.iter().map(|m| m.as_str().to_owned()).collect();
            self.env.write_lines(&self.compiled_methods_path, &lines)?;
            cmd = cmd
                .arg("-Xcompiler-option")
                .arg(format!("--compiled-methods={}", self.compiled_methods_path));
        }
        if let Some(passes) = passes_to_run {
            let lines: Vec<String> = passes.iter().map(|p| p.name.clone()).collect();
            self.env.write_lines(&self.passes_to_run_path, &lines)?;
            cmd = cmd
                .arg("-Xcompiler-option")
                .arg(format!("--run-passes={}", self.passes_to_run_path));
        }
        cmd = cmd
            .args(["-Xcompiler-option", "--dump-passes", "-classpath"])
            .arg(self.env.classpath())
            .arg(self.class_name.clone())
            .args(self.program_args.iter().cloned());
        Ok(cmd)
    }

    fn run_for_dump(&mut self, compiled_methods: Option<&[Method]>) -> Result<String> {
        let cmd = self.prepare_cmd(compiled_methods, None)?;
        self.probes += 1;
        let output = self.env.run_command(&cmd, self.timeout)?;
        Ok(output.stderr)
    }
}

impl<E: TestEnvironment> Testable for Dex2OatWrapperTestable<E> {
    fn test(
        &mut self,
        compiled_methods: Option<&[Method]>,
        passes_to_run: Option<&[OptimizationPass]>,
    ) -> Result<bool> {
        let cmd = self.prepare_cmd(compiled_methods, passes_to_run)?;
        self.probes += 1;
        let output = self.env.run_command(&cmd, self.timeout)?;
        let passed = output.status.is_success() && output.stdout == self.correct_output;
        debug!(
            probe = self.probes,
            methods = compiled_methods.map(<[Method]>::len),
            passes = passes_to_run.map(<[OptimizationPass]>::len),
            status = %output.status,
            passed,
            "probe finished"
        );
        if !passed {
            debug!(stderr = %tail_chars(&output.stderr, STDERR_TAIL_MAX_CHARS), "failing probe stderr");
        }
        Ok(passed)
    }

    fn all_methods(&mut self) -> Result<Vec<Method>> {
        let dump = self.run_for_dump(None)?;
        Ok(parse_compiled_methods(&dump)?)
    }

    fn all_passes_for_method(&mut self, method: &Method) -> Result<Vec<OptimizationPass>> {
        let dump = self.run_for_dump(Some(std::slice::from_ref(method)))?;
        Ok(parse_method_passes(&dump, &self.mandatory_passes)?)
    }
}

/// Methods named by `TIMINGS <method>` headers, in dump order.
pub fn parse_compiled_methods(dump: &str) -> Result<Vec<Method>, BisectionError> {
    let methods: Vec<Method> = TIMINGS_RE
        .captures_iter(dump)
        .map(|caps| Method::new(&caps[1]))
        .collect();
    if methods.is_empty() {
        return Err(BisectionError::DumpFormat("no 'TIMINGS <method>' header found".to_string()));
    }
    Ok(methods)
}

/// Passes listed in the first `TIMINGS` block of `dump`.
///
/// The block starts at the `TIMINGS` header, skips one header line, and
/// ends at the first line containing `end,`. Each pass line ends with the
/// pass name.
pub fn parse_method_passes(
    dump: &str,
    mandatory_passes: &HashSet<String>,
) -> Result<Vec<OptimizationPass>, BisectionError> {
    let lines: Vec<&str> = dump.lines().collect();
    let mut start = None;
    let mut end = None;
    for (i, line) in lines.iter().enumerate() {
        if start.is_none() && line.contains("TIMINGS") {
            start = Some(i);
        }
        if line.contains("end,") {
            end = Some(i);
            break;
        }
    }
    let (Some(start), Some(end)) = (start, end) else {
        return Err(BisectionError::DumpFormat(
            "no 'TIMINGS' block terminated by 'end,' found".to_string(),
        ));
    };

    let body = lines.get(start + 2..end).unwrap_or(&[]);
    Ok(body
        .iter()
        .filter_map(|line| line.split_whitespace().last())
        .filter(|name| !NON_PASSES.contains(name))
        .map(|name| OptimizationPass {
            name: name.to_string(),
            mandatory: mandatory_passes.contains(name),
        })
        .collect())
}
