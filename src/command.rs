//! Process kinds and the command construction policy for each.
//!
//! Commands are never assembled as shell strings. Every kind builds an argv
//! from configuration plus validated user input, so the set of things a
//! client can make the gateway execute stays small and auditable.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{GatewayConfig, Interpreter};
use crate::error::{GatewayError, Result};
use crate::sandbox::ResourceLimits;

const MAX_PACKAGE_NAME_LEN: usize = 200;

/// The closed set of things the runner knows how to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// Interactive shell. No deadline, ended by cancel or disconnect.
    Shell,
    /// Package installer run.
    Install,
    /// Snippet execution.
    Exec,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessKind::Shell => "shell",
            ProcessKind::Install => "install",
            ProcessKind::Exec => "exec",
        })
    }
}

/// Pseudo-terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Everything the runner needs to start one child.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub kind: ProcessKind,
    pub program: String,
    pub args: Vec<String>,
    /// Working directory, relative to the workspace root.
    pub working_dir: String,
    /// Wall-clock deadline. `None` runs until exit or cancel.
    pub timeout: Option<Duration>,
    /// Whether the child accepts input.
    pub interactive: bool,
    /// Run on a pseudo-terminal of this size instead of pipes.
    pub tty: Option<TerminalSize>,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// A bare command with no deadline, limits or input, run at the root.
    pub fn new(kind: ProcessKind, program: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            working_dir: String::new(),
            timeout: None,
            interactive: false,
            tty: None,
            limits: ResourceLimits::unlimited(),
            env: BTreeMap::new(),
        }
    }

    /// The interactive shell configured for this gateway.
    ///
    /// Shells get no rlimits: the user is expected to run long builds and
    /// servers from them.
    pub fn shell(config: &GatewayConfig, size: Option<TerminalSize>) -> Self {
        let mut spec = Self::new(ProcessKind::Shell, config.shell.clone())
            .args(config.shell_args.iter().cloned())
            .interactive(true);
        if config.shell_tty {
            spec.tty = Some(size.unwrap_or_default());
            spec.env
                .insert("TERM".to_string(), "xterm-256color".to_string());
        }
        spec
    }

    /// Installs one package through the configured installer template.
    pub fn install(config: &GatewayConfig, package: &str) -> Result<Self> {
        validate_package_name(package)?;
        let (program, args) = config.install_template.render("package", &[package]);
        Ok(Self::new(ProcessKind::Install, program)
            .args(args)
            .timeout(Some(config.install_timeout))
            .limits(install_limits(&config.limits)))
    }

    /// Installs everything listed in a jail-relative requirements file.
    pub fn install_requirements(config: &GatewayConfig, file: &str) -> Self {
        let (program, args) = config.requirements_template.render("file", &[file]);
        Self::new(ProcessKind::Install, program)
            .args(args)
            .timeout(Some(config.install_timeout))
            .limits(install_limits(&config.limits))
    }

    /// Runs `script` (relative to `working_dir`) with `interpreter`.
    ///
    /// The requested timeout is clamped to the configured exec timeout.
    pub fn snippet(
        config: &GatewayConfig,
        interpreter: &Interpreter,
        script: &str,
        working_dir: &str,
        timeout: Option<Duration>,
    ) -> Self {
        let timeout = timeout
            .map(|t| t.min(config.exec_timeout))
            .unwrap_or(config.exec_timeout);
        let mut limits = config.limits;
        if !interpreter.limit_address_space {
            limits.address_space_bytes = None;
        }
        Self::new(ProcessKind::Exec, interpreter.program.clone())
            .args(interpreter.args.iter().cloned())
            .arg(script)
            .working_dir(working_dir)
            .timeout(Some(timeout))
            .limits(limits)
            .env("PYTHONUNBUFFERED", "1")
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    #[must_use]
    pub fn tty(mut self, size: Option<TerminalSize>) -> Self {
        self.tty = size;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Client-supplied timeout in seconds. Zero or absent means the configured
/// default.
pub fn requested_timeout(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

// Installers compile native extensions and are bounded by the install
// timeout instead of a CPU limit.
fn install_limits(limits: &ResourceLimits) -> ResourceLimits {
    ResourceLimits {
        cpu_secs: None,
        ..*limits
    }
}

/// Accepts package specifiers such as `requests`, `numpy==1.26.4`,
/// `uvicorn[standard]` or `pkg@git+https://host/repo`, and rejects anything
/// carrying shell metacharacters, whitespace or a leading dash.
pub fn validate_package_name(name: &str) -> Result<()> {
    let invalid = || GatewayError::InvalidPackageName(name.to_string());
    if name.is_empty() || name.len() > MAX_PACKAGE_NAME_LEN || name.starts_with('-') {
        return Err(invalid());
    }
    let allowed = |c: char| {
        c.is_ascii_alphanumeric()
            || matches!(
                c,
                '.' | '_' | '-' | '=' | ',' | '[' | ']' | '~' | '+' | '@' | ':' | '/'
            )
    };
    if name.chars().all(allowed) {
        Ok(())
    } else {
        Err(invalid())
    }
}
