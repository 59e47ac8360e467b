//! Purpose: `cplrun` CLI entry point; inspect and run CPL pipeline recipes.
//! Role: Binary crate root; parses args, resolves recipes, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout, pretty when attached to a terminal.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Recipe execution always goes through `Recipe::prepare`/`spawn`/`collect`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use cplrun::api::{
    Diagnostics, Envelope, Error, ErrorKind, Frame, LibraryHandle, LibraryRegistry, LogEntry,
    LogLevel, MemoryDump, ParamValue, ParameterDescriptor, Recipe, RunRequest, forward_log,
    read_log, to_exit_code,
};
use cplrun::esorex::{RcConfig, default_rc_path, load_rc, load_sof};
use cplrun::search::RecipeSearch;

/// Exit code when the worker finished cleanly but the recipe reported failure.
const RECIPE_FAILED_EXIT_CODE: i32 = 14;
const WATCHDOG_TICK: Duration = Duration::from_millis(50);

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    let context = HostContext::load(cli.rc.as_deref(), cli.recipe_dir)
        .map_err(|err| (err, color_mode))?;

    command_dispatch::dispatch_command(cli.command, &context, color_mode)
        .map_err(add_load_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let replacement = arg.to_str().and_then(|value| match value {
                "---help" => Some("--help"),
                "---version" => Some("--version"),
                _ => None,
            });
            replacement.map(OsString::from).unwrap_or_else(|| arg)
        })
        .collect()
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "cplrun",
    version,
    about = "Inspect and run CPL pipeline recipes in isolated worker processes",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Recipes are loaded from shared modules on the recipe search path.

Mental model:
  - `list` shows which recipes the search path provides
  - `info` shows a recipe's parameters and frame configuration
  - `exec` runs a recipe in a forked worker and reports its result
"#,
    after_help = r#"EXAMPLES
  $ cplrun --recipe-dir /usr/lib/esopipes-plugins list
  $ cplrun info muse_bias
  $ cplrun exec muse_bias --sof bias.sof --param nifu=1 --output-dir out/

LEARN MORE
  The recipe search path defaults to esorex.caller.recipe-dir from ~/.esorex/esorex.rc.
  $ cplrun <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        help = "esorex rc file (default: ~/.esorex/esorex.rc when present)",
        value_hint = ValueHint::FilePath
    )]
    rc: Option<PathBuf>,
    #[arg(
        long = "recipe-dir",
        help = "Recipe search directory; repeatable, overrides the rc file",
        value_hint = ValueHint::DirPath
    )]
    recipe_dir: Vec<PathBuf>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum MemoryDumpCli {
    Never,
    IfLeaked,
    Always,
}

impl From<MemoryDumpCli> for MemoryDump {
    fn from(value: MemoryDumpCli) -> Self {
        match value {
            MemoryDumpCli::Never => MemoryDump::Never,
            MemoryDumpCli::IfLeaked => MemoryDump::IfLeaked,
            MemoryDumpCli::Always => MemoryDump::Always,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Show the CPL versions this build knows about")]
    Versions,
    #[command(
        about = "List recipes found on the search path",
        after_help = r#"EXAMPLES
  $ cplrun list
  $ cplrun --recipe-dir ./plugins list --json"#
    )]
    List {
        #[arg(long, help = "Emit JSON even when attached to a terminal")]
        json: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Show a recipe's metadata, parameters, and frame configuration"
    )]
    Info {
        #[arg(help = "Recipe name")]
        recipe: String,
        #[arg(
            long,
            help = "Load this module instead of searching the recipe path",
            value_hint = ValueHint::FilePath
        )]
        module: Option<PathBuf>,
        #[arg(long, help = "Prefer this recipe version (number or version string)")]
        version: Option<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Run a recipe in an isolated worker process",
        after_help = r#"EXAMPLES
  $ cplrun exec rtest --frame RRRECIPE_DOCATG_RAW=raw.fits --param intopt=3
  $ cplrun exec muse_bias --sof bias.sof --output-dir out/ --timeout 10m

NOTES
  - Parameter values are typed by the recipe's declared parameter type
  - Output files are written to --output-dir (default: current directory)
  - A non-zero recipe return code exits with status 14"#
    )]
    Exec(ExecArgs),
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ cplrun completion bash > ~/.local/share/bash-completion/completions/cplrun
  $ cplrun completion zsh > ~/.zfunc/_cplrun"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct ExecArgs {
    #[arg(help = "Recipe name")]
    recipe: String,
    #[arg(
        long,
        help = "Load this module instead of searching the recipe path",
        value_hint = ValueHint::FilePath
    )]
    module: Option<PathBuf>,
    #[arg(long, help = "Prefer this recipe version (number or version string)")]
    version: Option<String>,
    #[arg(long, help = "Set-of-frames file: 'filename tag [group]' per line", value_hint = ValueHint::FilePath)]
    sof: Option<PathBuf>,
    #[arg(long = "frame", value_name = "TAG=FILE", help = "Input frame; repeatable")]
    frames: Vec<String>,
    #[arg(long = "param", value_name = "NAME=VALUE", help = "Parameter override; repeatable")]
    params: Vec<String>,
    #[arg(long = "env", value_name = "NAME=VALUE", help = "Environment variable for the worker")]
    env: Vec<String>,
    #[arg(long = "unset", value_name = "NAME", help = "Remove an environment variable in the worker")]
    unset: Vec<String>,
    #[arg(long = "output-dir", help = "Run directory for products", value_hint = ValueHint::DirPath)]
    output_dir: Option<PathBuf>,
    #[arg(long = "log-file", help = "Recipe log file", value_hint = ValueHint::FilePath)]
    log_file: Option<PathBuf>,
    #[arg(long = "log-level", help = "Recipe log level: debug|info|warning|error|off")]
    log_level: Option<String>,
    #[arg(
        long = "msg-level",
        help = "Lowest recipe log level replayed to stderr: debug|info|warning|error|off"
    )]
    msg_level: Option<String>,
    #[arg(long = "memory-dump", default_value = "never", value_enum, help = "Dump the CPL allocation table")]
    memory_dump: MemoryDumpCli,
    #[arg(long = "memory-trace", help = "Trace allocations with glibc mtrace")]
    memory_trace: bool,
    #[arg(long = "stack-dump", help = "Attach gdb to a crashing worker")]
    stack_dump: bool,
    #[arg(long, help = "Kill the worker after this long (e.g. 500ms, 30s, 10m)")]
    timeout: Option<String>,
}

/// Settings shared by every command: rc file contents and the recipe search path.
struct HostContext {
    rc: RcConfig,
    search: RecipeSearch,
    registry: LibraryRegistry,
}

impl HostContext {
    fn load(rc_path: Option<&Path>, recipe_dirs: Vec<PathBuf>) -> Result<Self, Error> {
        let rc = match rc_path {
            Some(path) => load_rc(path)?,
            None => {
                let path = default_rc_path();
                if path.is_file() {
                    load_rc(&path)?
                } else {
                    RcConfig::default()
                }
            }
        };
        let dirs = if !recipe_dirs.is_empty() {
            recipe_dirs
        } else if !rc.recipe_dirs.is_empty() {
            rc.recipe_dirs.clone()
        } else {
            vec![PathBuf::from(".")]
        };
        Ok(Self {
            rc,
            search: RecipeSearch::new(dirs),
            registry: LibraryRegistry::new(),
        })
    }

    fn resolve_module(
        &self,
        name: &str,
        module: Option<&Path>,
        version: Option<&str>,
    ) -> Result<LibraryHandle, Error> {
        match module {
            Some(path) => self.registry.load(path),
            None => {
                let found = self.search.locate(&self.registry, name, version)?;
                self.registry.load(&found.module)
            }
        }
    }
}

fn versions_json() -> Value {
    json!({
        "cplrun": env!("CARGO_PKG_VERSION"),
        "floor": cplrun::api::VERSION_FLOOR,
        "type_tag_boundary": cplrun::api::TYPE_TAG_BOUNDARY,
        "supported": cplrun::api::SUPPORTED_VERSIONS,
    })
}

fn recipe_info_json(recipe: &Recipe) -> Value {
    let library = recipe.library();
    json!({
        "name": recipe.name(),
        "module": library.label(),
        "version": recipe.version(),
        "version_string": recipe.version_string(),
        "synopsis": recipe.synopsis(),
        "description": recipe.description(),
        "author": recipe.author(),
        "email": recipe.email(),
        "copyright": recipe.copyright(),
        "cpl": {
            "version": library.version(),
            "version_string": library.version_string(),
            "support": library.support(),
            "description": library.description(),
        },
        "parameters": recipe.parameters(),
        "frame_config": recipe.frame_config(),
    })
}

fn split_assignment<'a>(input: &'a str, what: &str) -> Result<(&'a str, &'a str), Error> {
    input
        .split_once('=')
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| (name.trim(), value))
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid {what} '{input}'"))
                .with_hint(format!("Use {what}=VALUE form, for example `NAME=VALUE`."))
        })
}

fn find_descriptor<'a>(
    descriptors: &'a [ParameterDescriptor],
    name: &str,
) -> Option<&'a ParameterDescriptor> {
    descriptors
        .iter()
        .find(|descriptor| descriptor.name == name)
        .or_else(|| {
            descriptors
                .iter()
                .find(|descriptor| descriptor.alias.as_deref() == Some(name))
        })
}

/// Types command-line and rc parameter values by the recipe's declared parameter types.
fn typed_parameters(
    descriptors: &[ParameterDescriptor],
    rc_params: &[(String, String)],
    cli_params: &[String],
) -> Result<Vec<(String, ParamValue)>, Error> {
    let mut out = Vec::new();
    for (name, text) in rc_params {
        let Some(value_type) = find_descriptor(descriptors, name).and_then(|d| d.value_type) else {
            tracing::debug!(parameter = %name, "ignoring rc setting for unknown parameter");
            continue;
        };
        out.push((name.clone(), ParamValue::parse_as(text, value_type)?));
    }
    for assignment in cli_params {
        let (name, text) = split_assignment(assignment, "--param")?;
        let descriptor = find_descriptor(descriptors, name).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("unknown parameter '{name}'"))
                .with_hint("Run `cplrun info <recipe>` to list parameter names and aliases.")
        })?;
        let value_type = descriptor.value_type.ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("parameter '{name}' has an unsupported type"))
        })?;
        out.push((name.to_string(), ParamValue::parse_as(text, value_type)?));
    }
    Ok(out)
}

fn absolute_path(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to resolve current directory")
                .with_source(err)
        })
}

fn collect_frames(args: &ExecArgs) -> Result<Vec<Frame>, Error> {
    let mut frames = match &args.sof {
        Some(sof) => load_sof(&absolute_path(sof)?)?,
        None => Vec::new(),
    };
    for assignment in &args.frames {
        let (tag, file) = split_assignment(assignment, "--frame")?;
        frames.push(Frame::new(tag, absolute_path(Path::new(file))?));
    }
    Ok(frames)
}

fn build_request(
    args: &ExecArgs,
    rc: &RcConfig,
    recipe: &Recipe,
) -> Result<RunRequest, Error> {
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| rc.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let output_dir = absolute_path(&output_dir)?;
    std::fs::create_dir_all(&output_dir).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create output directory")
            .with_path(&output_dir)
            .with_source(err)
    })?;

    let mut request = RunRequest::new(&output_dir);
    request.parameters = typed_parameters(
        &recipe.parameters(),
        &rc.params_for(&recipe.name()),
        &args.params,
    )?;
    request.frames = collect_frames(args)?;
    for assignment in &args.env {
        let (name, value) = split_assignment(assignment, "--env")?;
        request = request.with_env(name, value);
    }
    for name in &args.unset {
        request = request.without_env(name.as_str());
    }
    if let Some(log_file) = args.log_file.as_ref().or(rc.log_file.as_ref()) {
        request = request.with_log_file(absolute_path(log_file)?);
    }
    let level = args.log_level.as_deref().or(rc.log_level.as_deref());
    if let Some(level) = level {
        request = request.with_log_level(parse_level(level, "log level")?);
    }
    Ok(request.with_diagnostics(Diagnostics {
        memory_dump: args.memory_dump.into(),
        memory_trace: args.memory_trace,
        stack_dump: args.stack_dump,
    }))
}

fn parse_level(text: &str, what: &str) -> Result<LogLevel, Error> {
    LogLevel::parse(text).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid {what} '{text}'"))
            .with_hint("Use debug, info, warning, error, or off.")
    })
}

/// Level from which recipe log entries are replayed through `tracing`.
fn msg_threshold(args: &ExecArgs, rc: &RcConfig) -> Result<LogLevel, Error> {
    match args.msg_level.as_deref().or(rc.msg_level.as_deref()) {
        Some(level) => parse_level(level, "message level"),
        None => Ok(LogLevel::Debug),
    }
}

/// Reads the worker's log after the run and replays it; unreadable logs are skipped.
fn recipe_log(recipe: &str, request: &RunRequest, threshold: LogLevel) -> Vec<LogEntry> {
    match read_log(&request.log_file) {
        Ok(entries) => {
            forward_log(recipe, &entries, threshold);
            entries
        }
        Err(err) => {
            tracing::debug!(error = %err, "skipping recipe log");
            Vec::new()
        }
    }
}

/// Kills the worker on timeout or on SIGINT/SIGTERM delivered to the host.
struct Watchdog {
    done: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn start(pid: i32, timeout: Option<Duration>) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));
        let interrupted = Arc::new(AtomicBool::new(false));
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&interrupted)) {
                tracing::debug!(signal, error = %err, "cannot watch host signal");
            }
        }
        let started = Instant::now();
        let thread = {
            let done = Arc::clone(&done);
            let timed_out = Arc::clone(&timed_out);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let expired = timeout.is_some_and(|limit| started.elapsed() >= limit);
                    if expired || interrupted.load(Ordering::Acquire) {
                        timed_out.store(expired, Ordering::Release);
                        tracing::warn!(pid, expired, "stopping recipe worker");
                        // SAFETY: the worker is reaped only after `finish` has joined this thread.
                        unsafe { libc::kill(pid, libc::SIGKILL) };
                        return;
                    }
                    thread::sleep(WATCHDOG_TICK);
                }
            })
        };
        Self {
            done,
            timed_out,
            thread: Some(thread),
        }
    }

    fn finish(mut self) -> bool {
        self.done.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.timed_out.load(Ordering::Acquire)
    }
}

fn execute(
    recipe: &mut Recipe,
    request: &RunRequest,
    timeout: Option<Duration>,
) -> Result<Envelope, Error> {
    let running = recipe.prepare(request)?.spawn()?;
    let watchdog = Watchdog::start(running.pid(), timeout);
    let mut timed_out = false;
    let result = running.collect_with(|| timed_out = watchdog.finish());
    result.map_err(|err| {
        if timed_out {
            let limit = timeout.map(format_timeout).unwrap_or_default();
            err.with_hint(format!("Recipe was killed after the {limit} timeout."))
        } else {
            err
        }
    })
}

fn exec_result_json(
    recipe: &str,
    request: &RunRequest,
    envelope: &Envelope,
    log: &[LogEntry],
) -> Value {
    let mut value = serde_json::to_value(envelope).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut value {
        map.insert("recipe".to_string(), json!(recipe));
        let log = serde_json::to_value(log).unwrap_or_else(|_| Value::Array(Vec::new()));
        map.insert("log".to_string(), log);
        map.insert(
            "output_dir".to_string(),
            json!(request.dir.display().to_string()),
        );
        if let Some(finished) = notice_time_now() {
            map.insert("finished".to_string(), json!(finished));
        }
    }
    value
}

fn recipe_outcome(envelope: &Envelope) -> RunOutcome {
    if envelope.exit_code == 0 {
        RunOutcome::ok()
    } else {
        RunOutcome::with_code(RECIPE_FAILED_EXIT_CODE)
    }
}

fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint("Use a number plus ms|s|m|h (e.g. 10s).")
    };
    let trimmed = input.trim();
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => ("", ""),
    };
    if num_str.is_empty() || unit.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}

fn format_timeout(timeout: Duration) -> String {
    let ms = timeout.as_millis();
    if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

fn add_load_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::ModuleNotFound => {
            err.with_hint("Check the module path or add its directory with --recipe-dir.")
        }
        ErrorKind::NotACompatibleModule => {
            err.with_hint("The file is not a CPL recipe module; point --module at a pipeline plugin.")
        }
        ErrorKind::RecipeCrashed => {
            err.with_hint("Inspect recipe.backtrace in the output directory, or rerun with --stack-dump.")
        }
        _ => err,
    }
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() || err.kind() != ErrorKind::Io {
        return err;
    }
    err.with_hint("I/O error. Check the path, filesystem, and disk space.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn emit_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|header| header.chars().count()).collect();
    for row in rows {
        for (idx, width) in widths.iter_mut().enumerate() {
            let len = row.get(idx).map(|cell| cell.chars().count()).unwrap_or(0);
            *width = (*width).max(len);
        }
    }
    let header_cells: Vec<String> = headers.iter().map(|header| header.to_string()).collect();
    println!("{}", format_table_line(&header_cells, &widths));
    for row in rows {
        println!("{}", format_table_line(row, &widths));
    }
}

fn format_table_line(cells: &[String], widths: &[usize]) -> String {
    let mut line = String::new();
    for (idx, width) in widths.iter().enumerate() {
        if idx > 0 {
            line.push_str("  ");
        }
        let cell = cells.get(idx).map(String::as_str).unwrap_or("");
        line.push_str(cell);
        let cell_len = cell.chars().count();
        if *width > cell_len {
            line.push_str(&" ".repeat(*width - cell_len));
        }
    }
    line.trim_end().to_string()
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::Io => "i/o error",
        ErrorKind::ModuleNotFound => "module not found",
        ErrorKind::NotACompatibleModule => "not a CPL module",
        ErrorKind::IncompleteAbi => "incomplete CPL ABI",
        ErrorKind::VersionBelowFloor => "CPL version too old",
        ErrorKind::RecipeNotFound => "recipe not found",
        ErrorKind::MalformedConfig => "malformed recipe configuration",
        ErrorKind::Initialization => "recipe initialization failed",
        ErrorKind::RecipeCrashed => "recipe crashed",
        ErrorKind::SpawnFailed => "cannot start recipe worker",
        ErrorKind::Decode => "malformed recipe result",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("class".to_string(), json!(format!("{:?}", err.class())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(signal) = err.signal() {
        inner.insert("signal".to_string(), json!(signal));
    }
    if let Some(backtrace) = err.backtrace() {
        inner.insert("backtrace".to_string(), json!(backtrace));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(signal) = err.signal() {
        lines.push(format!(
            "{} {signal}",
            colorize_label("signal:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(backtrace) = err.backtrace() {
        lines.push(format!(
            "{}\n{}",
            colorize_label("backtrace:", use_color, AnsiColor::Yellow),
            backtrace.trim_end()
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `cplrun --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "cplrun") else {
        return "Try `cplrun --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `cplrun --help`.".to_string();
    }
    format!("Try `cplrun {} --help`.", parts.join(" "))
}
