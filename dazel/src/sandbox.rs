use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use tracing::debug;

use crate::profile::LaunchProfile;
use crate::DazelError;

// Compose files must use these values: mount the repository at
// CODE_MOUNT_POINT, the output base at CONTAINER_OUTPUT_BASE, and name the
// bazel container BUILD_CONTAINER_NAME. They are also exported to
// docker-compose as DAZEL_* variables for substitution.
pub const CODE_MOUNT_POINT: &str = "/code";
pub const CONTAINER_OUTPUT_BASE: &str = "/root/.cache/bazel/_bazel_dazel";
pub const CONTAINER_OUTPUT_USER_ROOT: &str = "/var/bazel/workspace/_bazel_dazel";
pub const BUILD_CONTAINER_NAME: &str = "dazel_build";
pub const CONTAINER_BAZEL_BIN: &str = "/usr/bin/bazel";

pub const DOCKER_COMMAND: &str = "docker";
pub const DOCKER_COMPOSE_COMMAND: &str = "docker-compose";
pub const DOCKER_COMPOSE_PROJECT_NAME: &str = "dazel";

const DEFAULT_COLUMNS: u16 = 80;
const DEFAULT_LINES: u16 = 24;

/// Where a spawned program's stdout goes. Stdin and stderr are always inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoute {
    Inherit,
    Stderr,
}

pub trait ProcessRunner {
    fn locate(&self, program: &str) -> Option<PathBuf>;

    fn run(
        &self,
        program: &str,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
        route: OutputRoute,
    ) -> Result<i32, io::Error>;

    /// Hands the process over to `program`. On unix this only returns when
    /// the program could not be started.
    fn exec(&self, program: &str, args: &[String]) -> Result<i32, io::Error>;
}

pub struct RealProcessRunner;

impl ProcessRunner for RealProcessRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn run(
        &self,
        program: &str,
        args: &[String],
        env_overrides: &BTreeMap<String, String>,
        route: OutputRoute,
    ) -> Result<i32, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        if route == OutputRoute::Stderr {
            cmd.stdout(io::stderr());
        }
        let status = cmd.status()?;
        Ok(exit_code(status))
    }

    #[cfg(unix)]
    fn exec(&self, program: &str, args: &[String]) -> Result<i32, io::Error> {
        use std::os::unix::process::CommandExt;
        Err(Command::new(program).args(args).exec())
    }

    #[cfg(not(unix))]
    fn exec(&self, program: &str, args: &[String]) -> Result<i32, io::Error> {
        self.run(program, args, &BTreeMap::new(), OutputRoute::Inherit)
    }
}

/// Exit code of a finished child. Signal deaths map to `128 + signal`
/// the way shells report them.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Terminal properties forwarded into the build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub columns: u16,
    pub lines: u16,
    pub term: String,
    pub stdout_is_tty: bool,
}

impl TerminalInfo {
    pub fn detect() -> Self {
        let window = stdout_window_size();
        let columns = env_dimension("COLUMNS")
            .or(window.map(|(cols, _)| cols))
            .unwrap_or(DEFAULT_COLUMNS);
        let lines = env_dimension("LINES")
            .or(window.map(|(_, rows)| rows))
            .unwrap_or(DEFAULT_LINES);
        Self {
            columns,
            lines,
            term: env::var("TERM").unwrap_or_default(),
            stdout_is_tty: io::stdout().is_terminal(),
        }
    }
}

fn env_dimension(name: &str) -> Option<u16> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .filter(|value| *value > 0)
}

#[cfg(unix)]
fn stdout_window_size() -> Option<(u16, u16)> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let result = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut size) };
    if result == 0 && size.ws_col > 0 && size.ws_row > 0 {
        Some((size.ws_col, size.ws_row))
    } else {
        None
    }
}

#[cfg(not(unix))]
fn stdout_window_size() -> Option<(u16, u16)> {
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Plain(String),
    Quoted(String),
}

/// An argument vector that can also be shown as a shell-style command line.
///
/// The vector is what gets spawned; quoting only affects `render`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    tokens: Vec<Token>,
}

impl CommandLine {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            tokens: Vec::new(),
        }
    }

    pub fn arg(&mut self, value: impl Into<String>) -> &mut Self {
        self.tokens.push(Token::Plain(value.into()));
        self
    }

    pub fn quoted(&mut self, value: impl Into<String>) -> &mut Self {
        self.tokens.push(Token::Quoted(value.into()));
        self
    }

    fn repeated_flag(&mut self, flag: &str, entries: &[String]) -> &mut Self {
        for entry in entries {
            self.arg(flag).quoted(entry.as_str());
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> Vec<String> {
        self.tokens
            .iter()
            .map(|token| match token {
                Token::Plain(value) | Token::Quoted(value) => value.clone(),
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let mut line = self.program.clone();
        for token in &self.tokens {
            line.push(' ');
            match token {
                Token::Plain(value) => line.push_str(value),
                Token::Quoted(value) => {
                    line.push('"');
                    line.push_str(value);
                    line.push('"');
                }
            }
        }
        line
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Brings the compose stack up. Returns 0 without spawning anything when no
/// compose file is configured, otherwise the exit code of docker-compose.
pub fn ensure_started<R: ProcessRunner>(
    profile: &LaunchProfile,
    runner: &R,
) -> Result<i32, DazelError> {
    let Some(compose_path) = profile.compose_path() else {
        return Ok(0);
    };
    if runner.locate(DOCKER_COMPOSE_COMMAND).is_none() {
        return Err(DazelError::MissingDependency(
            DOCKER_COMPOSE_COMMAND.to_string(),
        ));
    }

    let args = vec![
        "-f".to_string(),
        compose_path.to_string_lossy().to_string(),
        "up".to_string(),
        "-d".to_string(),
        "--remove-orphans".to_string(),
    ];
    let env_overrides = compose_env(profile);
    debug!(
        "running {} {} with COMPOSE_PROJECT_NAME={}",
        DOCKER_COMPOSE_COMMAND,
        args.join(" "),
        DOCKER_COMPOSE_PROJECT_NAME
    );
    runner
        .run(
            DOCKER_COMPOSE_COMMAND,
            &args,
            &env_overrides,
            OutputRoute::Stderr,
        )
        .map_err(|err| {
            DazelError::Process(format!("failed to run {DOCKER_COMPOSE_COMMAND}: {err}"))
        })
}

fn compose_env(profile: &LaunchProfile) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    envs.insert(
        "COMPOSE_PROJECT_NAME".to_string(),
        DOCKER_COMPOSE_PROJECT_NAME.to_string(),
    );
    envs.insert(
        "DAZEL_WORKSPACE_ROOT".to_string(),
        profile
            .workspace_root()
            .map(|root| root.to_string_lossy().to_string())
            .unwrap_or_default(),
    );
    envs.insert(
        "DAZEL_CODE_MOUNT_POINT".to_string(),
        CODE_MOUNT_POINT.to_string(),
    );
    envs.insert(
        "DAZEL_OUTPUT_BASE".to_string(),
        CONTAINER_OUTPUT_BASE.to_string(),
    );
    envs.insert(
        "DAZEL_OUTPUT_USER_ROOT".to_string(),
        CONTAINER_OUTPUT_USER_ROOT.to_string(),
    );
    envs.insert(
        "DAZEL_BUILD_CONTAINER_NAME".to_string(),
        BUILD_CONTAINER_NAME.to_string(),
    );
    if !profile.ports().is_empty() {
        envs.insert("DAZEL_PORTS".to_string(), profile.ports().join(","));
    }
    envs
}

/// Builds the `docker exec` invocation that runs bazel in the build container.
pub fn build_exec_command(
    profile: &LaunchProfile,
    terminal: &TerminalInfo,
    args: &[String],
) -> CommandLine {
    let mut cmd = CommandLine::new(DOCKER_COMMAND);
    cmd.arg("exec")
        .arg("-i")
        .arg("-e")
        .arg(format!("COLUMNS={}", terminal.columns))
        .arg("-e")
        .arg(format!("LINES={}", terminal.lines))
        .arg("-e")
        .arg(format!("TERM={}", terminal.term))
        .arg("-w")
        .arg(CODE_MOUNT_POINT)
        .repeated_flag("-e", profile.env_vars());
    if terminal.stdout_is_tty {
        cmd.arg("-t");
    }
    if profile.privileged() {
        cmd.arg("--privileged");
    }
    if let Some(user) = profile.run_as_user() {
        cmd.arg(format!("--user={user}"));
    }
    cmd.arg(BUILD_CONTAINER_NAME).arg(CONTAINER_BAZEL_BIN);
    if let Some(rc_file) = profile.runtime_config_file() {
        cmd.arg(format!("--bazelrc={CODE_MOUNT_POINT}/{rc_file}"));
    }
    cmd.arg(format!("--output_user_root={CONTAINER_OUTPUT_USER_ROOT}"))
        .arg(format!("--output_base={CONTAINER_OUTPUT_BASE}"));
    for arg in args {
        cmd.quoted(arg.as_str());
    }
    cmd
}

/// Runs bazel with `args` in the build container. On unix dazel is replaced
/// by `docker exec`, so signals and the exit status belong to the forwarded
/// command; elsewhere its exit code is returned.
pub fn send_command<R: ProcessRunner>(
    profile: &LaunchProfile,
    terminal: &TerminalInfo,
    args: &[String],
    runner: &R,
) -> Result<i32, DazelError> {
    let command = build_exec_command(profile, terminal, args);
    debug!("sending command: {command}");
    runner
        .exec(command.program(), &command.args())
        .map_err(|err| DazelError::Process(format!("failed to run {DOCKER_COMMAND} exec: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawConfig, RawValue};
    use std::cell::RefCell;
    use std::path::Path;
    use tempfile::tempdir;

    #[derive(Debug, Clone)]
    struct RecordedCall {
        program: String,
        args: Vec<String>,
        env_overrides: BTreeMap<String, String>,
        route: OutputRoute,
        replaced: bool,
    }

    #[derive(Default)]
    struct MockRunner {
        missing: Vec<&'static str>,
        calls: RefCell<Vec<RecordedCall>>,
        codes: RefCell<Vec<i32>>,
    }

    impl MockRunner {
        fn push_code(&self, code: i32) {
            self.codes.borrow_mut().push(code);
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.borrow().clone()
        }

        fn record(
            &self,
            program: &str,
            args: &[String],
            env_overrides: &BTreeMap<String, String>,
            route: OutputRoute,
            replaced: bool,
        ) -> Result<i32, io::Error> {
            self.calls.borrow_mut().push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
                env_overrides: env_overrides.clone(),
                route,
                replaced,
            });
            let mut queued = self.codes.borrow_mut();
            if queued.is_empty() {
                return Ok(0);
            }
            Ok(queued.remove(0))
        }
    }

    impl ProcessRunner for MockRunner {
        fn locate(&self, program: &str) -> Option<PathBuf> {
            if self.missing.iter().any(|name| *name == program) {
                None
            } else {
                Some(Path::new("/usr/bin").join(program))
            }
        }

        fn run(
            &self,
            program: &str,
            args: &[String],
            env_overrides: &BTreeMap<String, String>,
            route: OutputRoute,
        ) -> Result<i32, io::Error> {
            self.record(program, args, env_overrides, route, false)
        }

        fn exec(&self, program: &str, args: &[String]) -> Result<i32, io::Error> {
            self.record(program, args, &BTreeMap::new(), OutputRoute::Inherit, true)
        }
    }

    fn profile(pairs: Vec<(&str, RawValue)>) -> LaunchProfile {
        let config: RawConfig = pairs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        LaunchProfile::from_config(config).expect("profile")
    }

    fn terminal(tty: bool) -> TerminalInfo {
        TerminalInfo {
            columns: 120,
            lines: 40,
            term: "xterm-256color".to_string(),
            stdout_is_tty: tty,
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn ensure_started_is_noop_without_compose_file() {
        let runner = MockRunner {
            missing: vec![DOCKER_COMPOSE_COMMAND],
            ..MockRunner::default()
        };
        let code = ensure_started(&profile(vec![]), &runner).unwrap();
        assert_eq!(code, 0);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn ensure_started_requires_docker_compose() {
        let runner = MockRunner {
            missing: vec![DOCKER_COMPOSE_COMMAND],
            ..MockRunner::default()
        };
        let profile = profile(vec![("DOCKER_COMPOSE_FILE", RawValue::text("compose.yml"))]);
        let err = ensure_started(&profile, &runner).unwrap_err();
        assert!(matches!(err, DazelError::MissingDependency(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn ensure_started_runs_compose_up() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let profile = profile(vec![
            ("WORKSPACE_ROOT", RawValue::text(dir.path().to_string_lossy())),
            ("DOCKER_COMPOSE_FILE", RawValue::text("docker-compose.yml")),
            ("PORTS", RawValue::text("80, 443")),
        ]);

        let code = ensure_started(&profile, &runner).unwrap();
        assert_eq!(code, 0);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.program, DOCKER_COMPOSE_COMMAND);
        assert_eq!(call.route, OutputRoute::Stderr);
        assert!(!call.replaced);
        let compose_path = dir.path().join("docker-compose.yml");
        assert_eq!(
            call.args,
            vec![
                "-f".to_string(),
                compose_path.to_string_lossy().to_string(),
                "up".to_string(),
                "-d".to_string(),
                "--remove-orphans".to_string(),
            ]
        );
        assert_eq!(
            call.env_overrides.get("COMPOSE_PROJECT_NAME").map(String::as_str),
            Some("dazel")
        );
        assert_eq!(
            call.env_overrides.get("DAZEL_BUILD_CONTAINER_NAME").map(String::as_str),
            Some(BUILD_CONTAINER_NAME)
        );
        assert_eq!(
            call.env_overrides.get("DAZEL_PORTS").map(String::as_str),
            Some("80,443")
        );
    }

    #[test]
    fn ensure_started_propagates_compose_exit_code() {
        let runner = MockRunner::default();
        runner.push_code(17);
        let profile = profile(vec![("DOCKER_COMPOSE_FILE", RawValue::text("compose.yml"))]);
        assert_eq!(ensure_started(&profile, &runner).unwrap(), 17);
    }

    #[test]
    fn exec_command_appends_quoted_args_after_flags() {
        let command = build_exec_command(
            &profile(vec![]),
            &terminal(false),
            &strings(&["build", "//foo:bar"]),
        );
        let rendered = command.render();
        assert!(rendered
            .ends_with(r#"--output_base=/root/.cache/bazel/_bazel_dazel "build" "//foo:bar""#));
        assert_eq!(rendered.matches('"').count(), 4);

        let args = command.args();
        assert_eq!(&args[args.len() - 2..], ["build", "//foo:bar"]);
    }

    #[test]
    fn exec_command_matches_expected_layout() {
        let profile = profile(vec![
            ("ENV_VARS", RawValue::text("HOME,CI=1")),
            ("DOCKER_RUN_PRIVILEGED", RawValue::Flag(true)),
            ("USER", RawValue::text("1000")),
            ("BAZEL_RC_FILE", RawValue::text("tools/ci.bazelrc")),
        ]);
        let command = build_exec_command(&profile, &terminal(true), &strings(&["test", "//..."]));
        assert_eq!(
            command.render(),
            concat!(
                "docker exec -i -e COLUMNS=120 -e LINES=40 -e TERM=xterm-256color -w /code ",
                r#"-e "HOME" -e "CI=1" -t --privileged --user=1000 dazel_build /usr/bin/bazel "#,
                "--bazelrc=/code/tools/ci.bazelrc ",
                "--output_user_root=/var/bazel/workspace/_bazel_dazel ",
                "--output_base=/root/.cache/bazel/_bazel_dazel ",
                r#""test" "//...""#
            )
        );
        assert_eq!(command.program(), "docker");
        assert!(command.args().contains(&"HOME".to_string()));
    }

    #[test]
    fn exec_command_skips_tty_when_not_interactive() {
        let command = build_exec_command(&profile(vec![]), &terminal(false), &[]);
        let args = command.args();
        assert!(!args.iter().any(|arg| arg == "-t"));
        assert!(!args.iter().any(|arg| arg == "--privileged"));
        assert!(!args.iter().any(|arg| arg.starts_with("--user=")));
        assert!(!args.iter().any(|arg| arg.starts_with("--bazelrc=")));
        assert_eq!(
            args.last().map(String::as_str),
            Some("--output_base=/root/.cache/bazel/_bazel_dazel")
        );
    }

    #[test]
    fn send_command_returns_forwarded_exit_code() {
        let runner = MockRunner::default();
        runner.push_code(2);
        let code = send_command(
            &profile(vec![]),
            &terminal(false),
            &strings(&["build", "//foo:bar"]),
            &runner,
        )
        .unwrap();
        assert_eq!(code, 2);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "docker");
        assert_eq!(calls[0].route, OutputRoute::Inherit);
        assert!(calls[0].replaced);
        assert!(calls[0].env_overrides.is_empty());
        assert_eq!(calls[0].args.first().map(String::as_str), Some("exec"));
    }

    #[test]
    fn send_command_surfaces_spawn_failures() {
        struct FailingRunner;
        impl ProcessRunner for FailingRunner {
            fn locate(&self, _program: &str) -> Option<PathBuf> {
                None
            }

            fn run(
                &self,
                _program: &str,
                _args: &[String],
                _env_overrides: &BTreeMap<String, String>,
                _route: OutputRoute,
            ) -> Result<i32, io::Error> {
                Err(io::Error::new(io::ErrorKind::NotFound, "docker not found"))
            }

            fn exec(&self, program: &str, args: &[String]) -> Result<i32, io::Error> {
                self.run(program, args, &BTreeMap::new(), OutputRoute::Inherit)
            }
        }

        let err = send_command(&profile(vec![]), &terminal(false), &[], &FailingRunner)
            .unwrap_err();
        assert!(err.to_string().contains("docker exec"));
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_reports_real_status() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(2 << 8)), 2);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGINT)), 130);
    }
}
