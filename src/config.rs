//! Gateway configuration.
//!
//! All values are fixed at startup. The binary fills them from command-line
//! flags (or `SANDGATE_*` environment variables); library users start from
//! [`GatewayConfig::new`] and override with the `with_*` builders.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::sandbox::ResourceLimits;

pub const DEFAULT_MAX_PROCESSES_PER_SESSION: usize = 8;
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 240;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
pub const DEFAULT_SHELL: &str = "/bin/bash";
pub const DEFAULT_INSTALL_TEMPLATE: &str = "python3 -m pip install {package}";
pub const DEFAULT_REQUIREMENTS_TEMPLATE: &str = "python3 -m pip install -r {file}";
pub const DEFAULT_SNIPPET_DIR: &str = "paste_runs";
pub const DEFAULT_CPU_LIMIT_SECS: u64 = 60;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
pub const DEFAULT_FILE_SIZE_LIMIT_MB: u64 = 50;

/// A whitespace-separated argv template with `{name}` placeholder tokens.
///
/// Placeholders are substituted as whole argv elements, never spliced into
/// a larger string and never handed to a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    parts: Vec<String>,
}

impl CommandTemplate {
    /// Renders the template into `(program, args)`. Every token equal to
    /// `{placeholder}` expands to `values`; a template without the token gets
    /// the values appended.
    pub fn render(&self, placeholder: &str, values: &[&str]) -> (String, Vec<String>) {
        let token = format!("{{{placeholder}}}");
        let mut argv = Vec::with_capacity(self.parts.len() + values.len());
        let mut substituted = false;
        for part in &self.parts {
            if *part == token {
                argv.extend(values.iter().map(|v| v.to_string()));
                substituted = true;
            } else {
                argv.push(part.clone());
            }
        }
        if !substituted {
            argv.extend(values.iter().map(|v| v.to_string()));
        }
        let program = argv.remove(0);
        (program, argv)
    }
}

impl FromStr for CommandTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = s.split_whitespace().map(str::to_string).collect();
        if parts.is_empty() {
            return Err("command template must not be empty".to_string());
        }
        if parts[0].starts_with('{') {
            return Err("command template must start with a program".to_string());
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join(" "))
    }
}

/// Runtimes that reserve large virtual ranges at startup and abort under
/// RLIMIT_AS.
const ADDRESS_SPACE_HUNGRY: &[&str] = &["node", "nodejs", "deno", "bun"];

/// An interpreter allowed to run snippets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: String,
    /// File extension (without the dot) for snippet files.
    pub extension: String,
    /// Arguments placed before the script path.
    pub args: Vec<String>,
    /// Whether RLIMIT_AS is applied to snippets run by this interpreter.
    pub limit_address_space: bool,
}

impl Interpreter {
    /// The address-space limit is disabled for JavaScript runtimes, whose
    /// heap is bounded by their own flags instead.
    pub fn new(program: impl Into<String>, extension: impl Into<String>) -> Self {
        let program = program.into();
        let name = Path::new(&program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program.as_str());
        let limit_address_space = !ADDRESS_SPACE_HUNGRY.contains(&name);
        Self {
            program,
            extension: extension.into(),
            args: Vec::new(),
            limit_address_space,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_address_space_limit(mut self, enabled: bool) -> Self {
        self.limit_address_space = enabled;
        self
    }
}

/// Parses `LANG=PROGRAM[:EXT]`, as accepted by `--interpreter`.
pub fn parse_interpreter(s: &str) -> Result<(String, Interpreter), String> {
    let (language, rest) = s
        .split_once('=')
        .ok_or_else(|| format!("expected LANG=PROGRAM[:EXT], got {s:?}"))?;
    let language = language.trim().to_lowercase();
    if language.is_empty() {
        return Err(format!("missing language in {s:?}"));
    }
    let (program, extension) = match rest.rsplit_once(':') {
        Some((program, ext)) => (program, ext),
        None => (rest, language.as_str()),
    };
    if program.is_empty() {
        return Err(format!("missing program in {s:?}"));
    }
    let extension = extension.trim_start_matches('.').to_string();
    Ok((language.clone(), Interpreter::new(program, extension)))
}

/// The interpreters enabled when none are configured. Node's heap is capped
/// at `memory_limit_mb` (0 leaves it at the runtime default).
pub fn default_interpreters(memory_limit_mb: u64) -> BTreeMap<String, Interpreter> {
    let heap = (memory_limit_mb > 0).then(|| format!("--max-old-space-size={memory_limit_mb}"));
    BTreeMap::from([
        ("python".to_string(), Interpreter::new("python3", "py")),
        (
            "javascript".to_string(),
            Interpreter::new("node", "js").with_args(heap),
        ),
        ("sh".to_string(), Interpreter::new("sh", "sh")),
    ])
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub workspace_root: PathBuf,
    pub max_processes_per_session: usize,
    /// Default and upper bound for `exec` processes.
    pub exec_timeout: Duration,
    pub install_timeout: Duration,
    /// Time between the polite signal and SIGKILL on cancellation.
    pub grace_period: Duration,
    /// Idle time after which a session is expired. Zero disables expiry.
    pub session_ttl: Duration,
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Run shells on a pseudo-terminal instead of pipes.
    pub shell_tty: bool,
    pub install_template: CommandTemplate,
    pub requirements_template: CommandTemplate,
    pub interpreters: BTreeMap<String, Interpreter>,
    /// Jail-relative directory receiving snippet files.
    pub snippet_dir: String,
    pub limits: ResourceLimits,
}

impl GatewayConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_processes_per_session: DEFAULT_MAX_PROCESSES_PER_SESSION,
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            install_timeout: Duration::from_secs(DEFAULT_INSTALL_TIMEOUT_SECS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            shell: DEFAULT_SHELL.to_string(),
            shell_args: Vec::new(),
            shell_tty: true,
            install_template: CommandTemplate {
                parts: DEFAULT_INSTALL_TEMPLATE.split(' ').map(str::to_string).collect(),
            },
            requirements_template: CommandTemplate {
                parts: DEFAULT_REQUIREMENTS_TEMPLATE
                    .split(' ')
                    .map(str::to_string)
                    .collect(),
            },
            interpreters: default_interpreters(DEFAULT_MEMORY_LIMIT_MB),
            snippet_dir: DEFAULT_SNIPPET_DIR.to_string(),
            limits: ResourceLimits {
                cpu_secs: Some(DEFAULT_CPU_LIMIT_SECS),
                address_space_bytes: Some(DEFAULT_MEMORY_LIMIT_MB * 1024 * 1024),
                file_size_bytes: Some(DEFAULT_FILE_SIZE_LIMIT_MB * 1024 * 1024),
            },
        }
    }

    #[must_use]
    pub fn with_max_processes_per_session(mut self, max: usize) -> Self {
        self.max_processes_per_session = max;
        self
    }

    #[must_use]
    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>, args: Vec<String>, tty: bool) -> Self {
        self.shell = shell.into();
        self.shell_args = args;
        self.shell_tty = tty;
        self
    }

    #[must_use]
    pub fn with_install_template(mut self, template: CommandTemplate) -> Self {
        self.install_template = template;
        self
    }

    #[must_use]
    pub fn with_requirements_template(mut self, template: CommandTemplate) -> Self {
        self.requirements_template = template;
        self
    }

    #[must_use]
    pub fn with_interpreter(mut self, language: impl Into<String>, interpreter: Interpreter) -> Self {
        self.interpreters.insert(language.into(), interpreter);
        self
    }

    #[must_use]
    pub fn with_interpreters(mut self, interpreters: BTreeMap<String, Interpreter>) -> Self {
        self.interpreters = interpreters;
        self
    }

    #[must_use]
    pub fn with_snippet_dir(mut self, dir: impl Into<String>) -> Self {
        self.snippet_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}
