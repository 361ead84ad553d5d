//! VM-management tool invocation.
//!
//! Every command goes through [`CommandRunner`]: VM names are checked against
//! a fixed character set, the tool is spawned with discrete arguments (never
//! through a shell), the call is bounded by a timeout, and the result is
//! classified into an [`Outcome`].

use std::ffi::OsStr;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest VM name accepted (Hyper-V's own limit).
pub const MAX_VM_NAME_LEN: usize = 100;

// ── Actions & results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    List,
    Start,
    Shutdown,
    Restart,
}

impl VmAction {
    pub fn as_str(self) -> &'static str {
        match self {
            VmAction::List => "list",
            VmAction::Start => "start",
            VmAction::Shutdown => "shutdown",
            VmAction::Restart => "restart",
        }
    }

    /// Message reported when the tool succeeds without printing anything.
    pub fn default_output(self) -> &'static str {
        match self {
            VmAction::List => "",
            VmAction::Start => "VM started",
            VmAction::Shutdown => "VM shut down",
            VmAction::Restart => "VM restarted",
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    NotFound,
    AlreadyInState,
    Timeout,
    ExecutionError,
}

/// Why an invocation ended in [`Outcome::ExecutionError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Rejected before anything was spawned.
    UnsafeVmName,
    PermissionDenied,
    Spawn(String),
    NonZeroExit,
}

#[derive(Debug, Clone)]
pub struct VmCommandResult {
    pub action: VmAction,
    pub vm_name: Option<String>,
    /// `None` if the process was never spawned or was killed.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub outcome: Outcome,
    pub failure: Option<Failure>,
}

impl VmCommandResult {
    fn unspawned(action: VmAction, vm_name: Option<&str>, outcome: Outcome, failure: Option<Failure>) -> Self {
        Self {
            action,
            vm_name: vm_name.map(str::to_owned),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            outcome,
            failure,
        }
    }

    /// A `NotFound` result produced without running the tool, for callers
    /// that already know the VM does not exist.
    pub fn not_found(action: VmAction, vm_name: &str) -> Self {
        Self::unspawned(action, Some(vm_name), Outcome::NotFound, None)
    }

    /// `Success` and `AlreadyInState` both count as a completed request.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success | Outcome::AlreadyInState)
    }

    /// Trimmed stdout, falling back to stderr.
    pub fn output(&self) -> &str {
        let out = self.stdout.trim();
        if out.is_empty() {
            self.stderr.trim()
        } else {
            out
        }
    }

    /// Names from a `list` invocation, one per non-blank line, in tool order.
    pub fn vm_names(&self) -> Vec<String> {
        parse_vm_list(&self.stdout)
    }

    /// One-line description for logs.
    pub fn details(&self) -> String {
        let vm = self.vm_name.as_deref().unwrap_or("");
        match (&self.outcome, &self.failure) {
            (Outcome::Success | Outcome::AlreadyInState, _) => {
                let out = self.output();
                if out.is_empty() {
                    self.action.default_output().to_owned()
                } else {
                    out.to_owned()
                }
            }
            (Outcome::NotFound, _) => format!("VM '{vm}' not found"),
            (Outcome::Timeout, _) => format!("timed out after {:.1}s", self.duration.as_secs_f64()),
            (Outcome::ExecutionError, Some(Failure::UnsafeVmName)) => {
                format!("unsafe VM name rejected: {vm:?}")
            }
            (Outcome::ExecutionError, Some(Failure::Spawn(e))) => format!("failed to spawn tool: {e}"),
            (Outcome::ExecutionError, Some(Failure::PermissionDenied)) => {
                format!("permission denied: {}", self.output())
            }
            (Outcome::ExecutionError, _) => format!(
                "exit code {}: {}",
                self.exit_code.map_or_else(|| "none".to_owned(), |c| c.to_string()),
                self.output()
            ),
        }
    }
}

// ── Tool syntax ──────────────────────────────────────────────────────────────

/// Command-line syntax of a VM-management tool.
///
/// Implementations only build argument vectors and name the output markers
/// used for classification; spawning and timeouts stay in [`CommandRunner`].
pub trait VmTool: Send + Sync {
    fn program(&self) -> &OsStr;

    /// Arguments for one action. `vm` has already passed [`is_safe_vm_name`]
    /// and is `Some` for every action except `List`.
    fn args(&self, action: VmAction, vm: Option<&str>) -> Vec<String>;

    fn not_found_markers(&self) -> &[&str] {
        &[]
    }

    fn already_in_state_markers(&self) -> &[&str] {
        &[]
    }

    fn permission_denied_markers(&self) -> &[&str] {
        &[]
    }
}

pub const HYPERV_NOT_FOUND_MARKERS: &[&str] = &[
    "unable to find a virtual machine with name",
    "ObjectNotFound",
];

pub const HYPERV_ALREADY_IN_STATE_MARKERS: &[&str] = &[
    "already in the specified state",
    "cannot be performed while the object is in its current state",
];

pub const HYPERV_PERMISSION_MARKERS: &[&str] = &[
    "You do not have the required permission",
    "Access is denied",
    "UnauthorizedAccessException",
];

/// Hyper-V cmdlets driven through `powershell -Command`.
#[derive(Debug, Clone)]
pub struct HyperV {
    program: String,
}

impl HyperV {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for HyperV {
    fn default() -> Self {
        Self::new("powershell")
    }
}

impl VmTool for HyperV {
    fn program(&self) -> &OsStr {
        OsStr::new(&self.program)
    }

    fn args(&self, action: VmAction, vm: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = ["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"]
            .into_iter()
            .map(String::from)
            .collect();

        // PowerShell re-joins everything after -Command, so the name travels
        // as a single-quoted literal. Safe names never contain a quote.
        let name = format!("'{}'", vm.unwrap_or_default());
        let name = name.as_str();
        let cmd: Vec<&str> = match action {
            VmAction::List => vec!["Get-VM", "|", "Select-Object", "-ExpandProperty", "Name"],
            VmAction::Start => vec!["Start-VM", "-Name", name, "-Confirm:$false"],
            VmAction::Shutdown => vec!["Stop-VM", "-Name", name, "-Force", "-Confirm:$false"],
            VmAction::Restart => vec!["Restart-VM", "-Name", name, "-Force", "-Confirm:$false"],
        };
        args.extend(cmd.into_iter().map(str::to_owned));
        args
    }

    fn not_found_markers(&self) -> &[&str] {
        HYPERV_NOT_FOUND_MARKERS
    }

    fn already_in_state_markers(&self) -> &[&str] {
        HYPERV_ALREADY_IN_STATE_MARKERS
    }

    fn permission_denied_markers(&self) -> &[&str] {
        HYPERV_PERMISSION_MARKERS
    }
}

// ── Validation & parsing ─────────────────────────────────────────────────────

/// Letters, digits, space, `-`, `_` and `.`; 1–100 chars; no leading or
/// trailing space. Names made only of dots are refused, since `.` and `..`
/// are path segments rather than names once they appear in a URL.
pub fn is_safe_vm_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().all(|c| c == '.')
        && name.chars().count() <= MAX_VM_NAME_LEN
        && !name.starts_with(' ')
        && !name.ends_with(' ')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
}

pub fn parse_vm_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

fn contains_any(haystacks: &[String], markers: &[&str]) -> bool {
    markers
        .iter()
        .any(|m| haystacks.iter().any(|h| h.contains(m)))
}

/// Maps a finished process to an outcome.
///
/// A listing is judged by its exit code alone, with permission markers read
/// from stderr only, since its stdout is nothing but VM names. For the other
/// actions the quoted VM name, as Hyper-V echoes it, is blanked out of both
/// streams before marker matching, so a name that happens to contain a marker
/// cannot change the outcome. Markers win over the exit code there, so tools
/// that print a warning and exit 0 are still recognised.
pub fn classify(
    tool: &dyn VmTool,
    action: VmAction,
    vm_name: Option<&str>,
    exit_code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> (Outcome, Option<Failure>) {
    if action == VmAction::List {
        return if exit_code == Some(0) {
            (Outcome::Success, None)
        } else if contains_any(&[stderr.to_owned()], tool.permission_denied_markers()) {
            (Outcome::ExecutionError, Some(Failure::PermissionDenied))
        } else {
            (Outcome::ExecutionError, Some(Failure::NonZeroExit))
        };
    }

    let scrub = |text: &str| match vm_name {
        Some(name) if !name.is_empty() => text
            .replace(&format!("'{name}'"), "''")
            .replace(&format!("\"{name}\""), "\"\""),
        _ => text.to_owned(),
    };
    let streams = [scrub(stdout), scrub(stderr)];
    if contains_any(&streams, tool.not_found_markers()) {
        (Outcome::NotFound, None)
    } else if contains_any(&streams, tool.already_in_state_markers()) {
        (Outcome::AlreadyInState, None)
    } else if exit_code == Some(0) {
        (Outcome::Success, None)
    } else if contains_any(&streams, tool.permission_denied_markers()) {
        (Outcome::ExecutionError, Some(Failure::PermissionDenied))
    } else {
        (Outcome::ExecutionError, Some(Failure::NonZeroExit))
    }
}

// ── CommandRunner ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CommandRunner {
    tool: Arc<dyn VmTool>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(tool: impl VmTool + 'static, timeout: Duration) -> Self {
        Self {
            tool: Arc::new(tool),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the command on its own task. If the caller goes away the
    /// subprocess still runs to completion or timeout.
    pub async fn execute(&self, action: VmAction, vm_name: Option<String>) -> VmCommandResult {
        let runner = self.clone();
        let name = vm_name.clone();
        match tokio::spawn(async move { runner.run(action, name.as_deref()).await }).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%action, error = %e, "command task failed");
                VmCommandResult::unspawned(
                    action,
                    vm_name.as_deref(),
                    Outcome::ExecutionError,
                    Some(Failure::Spawn(e.to_string())),
                )
            }
        }
    }

    /// Validate, spawn, wait (bounded) and classify. Never retries.
    pub async fn run(&self, action: VmAction, vm_name: Option<&str>) -> VmCommandResult {
        let name_ok = match (action, vm_name) {
            (VmAction::List, _) => true,
            (_, Some(name)) => is_safe_vm_name(name),
            (_, None) => false,
        };
        if !name_ok {
            warn!(%action, vm = ?vm_name, "refusing unsafe VM name");
            return VmCommandResult::unspawned(
                action,
                vm_name,
                Outcome::ExecutionError,
                Some(Failure::UnsafeVmName),
            );
        }
        // List never takes a name.
        let target = if action == VmAction::List { None } else { vm_name };

        let args = self.tool.args(action, target);
        debug!(%action, program = ?self.tool.program(), ?args, "spawning VM tool");

        let started = Instant::now();
        let child = Command::new(self.tool.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(%action, error = %e, "failed to spawn VM tool");
                let failure = if e.kind() == std::io::ErrorKind::PermissionDenied {
                    Failure::PermissionDenied
                } else {
                    Failure::Spawn(e.to_string())
                };
                return VmCommandResult::unspawned(action, vm_name, Outcome::ExecutionError, Some(failure));
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let duration = started.elapsed();

        let output = match waited {
            Err(_) => {
                warn!(%action, vm = ?vm_name, timeout = ?self.timeout, "VM tool timed out");
                return VmCommandResult {
                    duration,
                    ..VmCommandResult::unspawned(action, vm_name, Outcome::Timeout, None)
                };
            }
            Ok(Err(e)) => {
                warn!(%action, error = %e, "failed waiting for VM tool");
                return VmCommandResult {
                    duration,
                    ..VmCommandResult::unspawned(
                        action,
                        vm_name,
                        Outcome::ExecutionError,
                        Some(Failure::Spawn(e.to_string())),
                    )
                };
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();
        let (outcome, failure) =
            classify(self.tool.as_ref(), action, target, exit_code, &stdout, &stderr);
        debug!(%action, ?exit_code, ?outcome, elapsed_ms = duration.as_millis() as u64, "VM tool finished");

        VmCommandResult {
            action,
            vm_name: vm_name.map(str::to_owned),
            exit_code,
            stdout,
            stderr,
            duration,
            outcome,
            failure,
        }
    }
}
