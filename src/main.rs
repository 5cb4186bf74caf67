use clap::Parser;
use dirs::home_dir;
use regex::Regex;
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

const TOOLS_DIR: &str = "/var/lib/juju/tools";
const LOCAL_MARKER: &str = "localhost";
const SSH_USER: &str = "ubuntu";
const SSH_CONNECT_TIMEOUT_SECS: u32 = 20;
const VERSION_PATTERN: &str = r"^\d{1,9}\.\d{1,9}(\.|-(\w+))\d{1,9}(\.\d{1,9})?$";

#[derive(Parser, Debug)]
#[command(
    name = "relink",
    version,
    about = "Fix a stuck upgrade by relinking machine agent tools"
)]
struct Cli {
    /// Target agent version, e.g. 1.24.1 or 1.25-alpha1.2.
    #[arg(id = "target-version", value_name = "VERSION")]
    version: String,
}

#[derive(Debug, Error)]
enum RelinkError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("no state servers found")]
    NoStateServers,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    output: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait ShellRunner {
    fn run(&self, argv: &[String], script: &str) -> Result<CommandOutput, io::Error>;
}

struct SystemShellRunner;

impl ShellRunner for SystemShellRunner {
    fn run(&self, argv: &[String], script: &str) -> Result<CommandOutput, io::Error> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            status_code,
            output: combined,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Discovery {
    Found(BTreeSet<String>),
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Proceed(String),
    Skip(SkipReason),
}

#[derive(Debug, PartialEq, Eq)]
enum SkipReason {
    NoAgentFound,
    MultipleAgents,
    AlreadyFixed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::NoAgentFound => "no agent found",
            SkipReason::MultipleAgents => "multiple agents found",
            SkipReason::AlreadyFixed => "already fixed",
        };
        write!(f, "{reason}")
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), RelinkError> {
    validate_version(&cli.version)?;
    fix_environment(&SystemShellRunner, &cli.version)
}

fn validate_version(version: &str) -> Result<(), RelinkError> {
    let pattern = Regex::new(VERSION_PATTERN).map_err(|err| RelinkError::Config(err.to_string()))?;
    if !pattern.is_match(version) {
        return Err(RelinkError::Config(format!(
            "invalid version {version:?}; expected a form like 1.24.1 or 1.25-alpha1.2"
        )));
    }
    Ok(())
}

fn ssh_command(addr: &str) -> Vec<String> {
    vec![
        "ssh".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
        format!("{SSH_USER}@{addr}"),
        "sudo".to_string(),
        "/bin/bash".to_string(),
    ]
}

fn local_command() -> Vec<String> {
    vec!["sudo".to_string(), "/bin/bash".to_string()]
}

fn state_server_addresses<R: ShellRunner>(runner: &R) -> Result<Vec<String>, RelinkError> {
    let argv = vec!["juju".to_string(), "api-endpoints".to_string()];
    let out = runner
        .run(&argv, "")
        .map_err(|err| RelinkError::Process(format!("cannot list state servers: {err}")))?;
    if !out.success() {
        return Err(RelinkError::Process(format!(
            "cannot list state servers: {}",
            out.output.trim()
        )));
    }
    let mut addrs: Vec<String> = out
        .output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            Some(line.split(':').next().unwrap_or(line).to_string())
        })
        .collect();
    let Some(first) = addrs.first().cloned() else {
        return Err(RelinkError::NoStateServers);
    };
    // The first address is probed twice so even a single-entry list gets a
    // full classification pass; the duplicate is caught as "already fixed".
    addrs.push(first);
    Ok(addrs)
}

fn current_environment<R: ShellRunner>(runner: &R) -> Result<String, RelinkError> {
    let argv = vec!["juju".to_string(), "switch".to_string()];
    let out = runner
        .run(&argv, "")
        .map_err(|err| RelinkError::Process(format!("cannot get the current environment: {err}")))?;
    if !out.success() {
        return Err(RelinkError::Process(format!(
            "cannot get the current environment: {}",
            out.output.trim()
        )));
    }
    Ok(out.output.trim().to_string())
}

fn juju_home() -> PathBuf {
    if let Ok(path) = env::var("JUJU_HOME") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".juju");
    base
}

fn discover_agents<R: ShellRunner>(runner: &R, addr: &str) -> Discovery {
    let script = format!("ls -d {TOOLS_DIR}/machine-*\n");
    match runner.run(&ssh_command(addr), &script) {
        Ok(out) if out.success() => {
            let agents = out
                .output
                .lines()
                .filter_map(|line| {
                    let line = line.trim();
                    if line.is_empty() {
                        return None;
                    }
                    Some(line.rsplit('/').next().unwrap_or(line).to_string())
                })
                .filter(|segment| segment.starts_with("machine-"))
                .collect();
            Discovery::Found(agents)
        }
        _ => Discovery::Failed,
    }
}

fn classify(discovery: &Discovery, seen: &BTreeSet<String>) -> Decision {
    let agents = match discovery {
        Discovery::Failed => return Decision::Skip(SkipReason::NoAgentFound),
        Discovery::Found(agents) => agents,
    };
    if agents.len() > 1 {
        return Decision::Skip(SkipReason::MultipleAgents);
    }
    let Some(agent) = agents.iter().next() else {
        return Decision::Skip(SkipReason::NoAgentFound);
    };
    if seen.contains(agent) {
        return Decision::Skip(SkipReason::AlreadyFixed);
    }
    Decision::Proceed(agent.clone())
}

/// Builds the host-side fix procedure. Every step prints its own reason and
/// exits non-zero on failure; the captured output is the operator's only
/// diagnostic.
fn fix_script(agent: &str, version: &str, tools_dir: &str) -> String {
    format!(
        r#"cd {tools_dir} || {{ echo "cannot change to tools directory {tools_dir}"; exit 1; }}
count=$(ls -d {version}-*-* 2>/dev/null | wc -l)
if [ "$count" -eq 0 ]; then
    echo "no tools unpacked for version {version} in {tools_dir}"
    exit 1
fi
if [ "$count" -ne 1 ]; then
    echo "more than one tools directory matches {version}-*-*"
    exit 1
fi
ln --symbolic --force {version}-*-* {agent} || {{ echo "cannot relink {agent} to {version} tools"; exit 1; }}
pkill jujud || {{ echo "cannot kill the running agent for {agent}"; exit 1; }}
"#
    )
}

fn fix_environment<R: ShellRunner>(runner: &R, version: &str) -> Result<(), RelinkError> {
    let addrs = state_server_addresses(runner)?;
    if addrs.iter().any(|addr| addr == LOCAL_MARKER) {
        fix_local(runner, version)?;
    } else {
        fix_remote(runner, version, &addrs)?;
    }
    println!("fix complete");
    Ok(())
}

// The local provider has exactly one agent, machine-0, and no login step, so
// there is no discovery or classification on this branch.
fn fix_local<R: ShellRunner>(runner: &R, version: &str) -> Result<(), RelinkError> {
    let environment = current_environment(runner)?;
    let tools_dir = juju_home().join(&environment).join("tools");
    println!("fixing local environment {environment}");
    let script = fix_script("machine-0", version, &tools_dir.to_string_lossy());
    let out = runner.run(&local_command(), &script)?;
    if !out.success() {
        return Err(RelinkError::Process(out.output));
    }
    println!("{LOCAL_MARKER} fixed");
    Ok(())
}

fn fix_remote<R: ShellRunner>(
    runner: &R,
    version: &str,
    addrs: &[String],
) -> Result<(), RelinkError> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for addr in addrs {
        println!("checking {addr}");
        let discovery = discover_agents(runner, addr);
        match classify(&discovery, &seen) {
            Decision::Skip(reason) => {
                println!("skipping {addr}: {reason}");
            }
            Decision::Proceed(agent) => {
                println!("{addr} is {agent}");
                let script = fix_script(&agent, version, TOOLS_DIR);
                let out = runner.run(&ssh_command(addr), &script)?;
                if !out.success() {
                    return Err(RelinkError::Process(out.output));
                }
                println!("{addr} fixed");
                seen.insert(agent);
            }
        }
    }
    Ok(())
}
