//! Purpose: Run one recipe execution in a forked worker and collect its result envelope.
//! Exports: `RunRequest`, `LogLevel`, `MemoryDump`, `Diagnostics`, `ExecState`,
//! `PreparedRun`, `RunningExecution`, `read_envelope`.
//! Role: Isolated execution harness; the only code path that forks.
//! Invariants: Exactly one worker per execution; `&mut Recipe` is held until collection.
//! Invariants: The parent reads the length word before the payload.
//! Invariants: A short read is always `RecipeCrashed`, whatever the worker's exit status.
//! Invariants: The worker never returns, unwinds, logs through `tracing`, or loads modules.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::raw::{c_int, c_uint};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::cpl::sys::{
    CPL_DFS_SIGNATURE_CHECKSUM, CPL_DFS_SIGNATURE_DATAMD5, CPL_ERROR_FILE_NOT_CREATED,
    CPL_ERROR_NONE, CPL_FALSE, CPL_MSG_DEBUG, CPL_MSG_ERROR, CPL_MSG_INFO, CPL_MSG_OFF,
    CPL_MSG_WARNING, CplErrorCode, CplErrorState, CplFrameset, CplMsgSeverity,
};
use crate::core::cpl::{CplSymbols, borrowed_string, to_cstring};
use crate::core::crash;
use crate::core::envelope::{
    Envelope, ErrorRecord, HEADER_LEN, MAX_ENVELOPE_LEN, WORD_LEN, declared_len,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::frames::{Frame, build_frameset, product_frames};
use crate::core::params::{ParamValue, apply_overrides, reset_to_defaults};
use crate::core::recipe::Recipe;

/// Message severity, ordered from most to least verbose.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Off,
}

impl LogLevel {
    pub fn to_raw(self) -> CplMsgSeverity {
        match self {
            LogLevel::Debug => CPL_MSG_DEBUG,
            LogLevel::Info => CPL_MSG_INFO,
            LogLevel::Warning => CPL_MSG_WARNING,
            LogLevel::Error => CPL_MSG_ERROR,
            LogLevel::Off => CPL_MSG_OFF,
        }
    }

    pub fn parse(text: &str) -> Option<LogLevel> {
        match text.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "off" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

/// When to dump the runtime's allocation table after the recipe finished.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MemoryDump {
    #[default]
    Never,
    IfLeaked,
    Always,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Diagnostics {
    pub memory_dump: MemoryDump,
    /// glibc `mtrace` into `recipe.mtrace` in the run directory.
    pub memory_trace: bool,
    /// Attach gdb from the crash handler and append its output to the crash record.
    pub stack_dump: bool,
}

/// Everything one execution needs besides the recipe itself.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub dir: PathBuf,
    pub parameters: Vec<(String, ParamValue)>,
    pub frames: Vec<Frame>,
    /// `None` or an empty value removes the variable in the worker.
    pub env: Vec<(String, Option<String>)>,
    pub log_file: PathBuf,
    pub log_level: LogLevel,
    pub diagnostics: Diagnostics,
}

impl RunRequest {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            log_file: dir.join("recipe.log"),
            dir,
            parameters: Vec::new(),
            frames: Vec::new(),
            env: Vec::new(),
            log_level: LogLevel::default(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.parameters.push((name.into(), value));
        self
    }

    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), Some(value.into())));
        self
    }

    pub fn without_env(mut self, name: impl Into<String>) -> Self {
        self.env.push((name.into(), None));
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = path.into();
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecState {
    Idle,
    Prepared,
    Running,
    Collecting,
    Done,
    Crashed,
}

/// Worker inputs converted to C strings before forking.
struct WorkerPlan {
    dir: CString,
    log_file: CString,
    log_level: CplMsgSeverity,
    env: Vec<(CString, Option<CString>)>,
    diagnostics: Diagnostics,
    process_name: String,
}

impl WorkerPlan {
    fn new(request: &RunRequest, process_name: String) -> Self {
        let env = request
            .env
            .iter()
            .map(|(name, value)| {
                let value = value
                    .as_deref()
                    .filter(|value| !value.is_empty())
                    .map(to_cstring);
                (to_cstring(name), value)
            })
            .collect();
        Self {
            dir: to_cstring(&request.dir.to_string_lossy()),
            log_file: to_cstring(&request.log_file.to_string_lossy()),
            log_level: request.log_level.to_raw(),
            env,
            diagnostics: request.diagnostics,
            process_name,
        }
    }
}

impl Recipe {
    /// Resets runtime state and loads the request's frames and parameters into the recipe.
    pub fn prepare(&mut self, request: &RunRequest) -> Result<PreparedRun<'_>, Error> {
        let symbols = *self.library().symbols();
        let tags = *self.library().type_tags();
        let recipe = self.recipe_ptr();
        // SAFETY: the recipe was initialized by `find_plugin`; we hold it exclusively.
        let code = unsafe {
            (symbols.error_reset)();
            (symbols.frameset_delete)((*recipe).frames);
            (*recipe).frames = build_frameset(&symbols, &request.frames);
            reset_to_defaults(&symbols, &tags, (*recipe).parameters);
            apply_overrides(&symbols, &tags, (*recipe).parameters, &request.parameters);
            (symbols.error_get_code)()
        };
        if code != CPL_ERROR_NONE {
            // SAFETY: the message getter returns runtime-owned static storage.
            let detail = unsafe { borrowed_string((symbols.error_get_message)()) };
            return Err(Error::new(ErrorKind::Initialization)
                .with_message(format!(
                    "CPL error {code} while preparing recipe: {}",
                    detail.unwrap_or_default()
                ))
                .with_hint("Check parameter values and input frames."));
        }
        let plan = WorkerPlan::new(request, self.name());
        Ok(PreparedRun {
            recipe: self,
            plan,
            dir: request.dir.clone(),
        })
    }

    /// Prepares, spawns, and collects one execution.
    pub fn run(&mut self, request: &RunRequest) -> Result<Envelope, Error> {
        self.prepare(request)?.spawn()?.collect()
    }
}

pub struct PreparedRun<'a> {
    recipe: &'a mut Recipe,
    plan: WorkerPlan,
    dir: PathBuf,
}

impl<'a> PreparedRun<'a> {
    pub fn state(&self) -> ExecState {
        ExecState::Prepared
    }

    /// Forks the worker; the returned execution must be collected to reap it.
    pub fn spawn(self) -> Result<RunningExecution<'a>, Error> {
        let (read_end, write_end) = pipe()?;
        // SAFETY: the child only runs `run_worker`, which ends in `_exit`.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::new(ErrorKind::SpawnFailed)
                .with_message("cannot fork recipe worker")
                .with_source(io::Error::last_os_error()));
        }
        if pid == 0 {
            drop(read_end);
            run_worker(self.recipe, &self.plan, write_end);
        }
        drop(write_end);
        tracing::debug!(pid, dir = %self.dir.display(), "spawned recipe worker");
        Ok(RunningExecution {
            _recipe: self.recipe,
            pid: Some(pid),
            reader: File::from(read_end),
            dir: self.dir,
        })
    }
}

pub struct RunningExecution<'a> {
    _recipe: &'a mut Recipe,
    pid: Option<libc::pid_t>,
    reader: File,
    dir: PathBuf,
}

impl RunningExecution<'_> {
    /// Worker process id, for hosts that enforce their own deadline by killing it.
    pub fn pid(&self) -> i32 {
        self.pid.unwrap_or(0)
    }

    pub fn state(&self) -> ExecState {
        if self.pid.is_some() {
            ExecState::Running
        } else {
            ExecState::Collecting
        }
    }

    /// Blocks until the worker's envelope is read and the worker is reaped.
    pub fn collect(self) -> Result<Envelope, Error> {
        self.collect_with(|| {})
    }

    /// Like `collect`, but runs `before_reap` once the pipe is drained and while the
    /// worker's pid is still held by this process, so a host deadline can be disarmed
    /// before the pid is released.
    pub fn collect_with(mut self, before_reap: impl FnOnce()) -> Result<Envelope, Error> {
        finish_worker(&mut self.reader, self.pid.take(), &self.dir, before_reap)
    }
}

/// Reads the worker's envelope, then reaps it; a short envelope becomes `RecipeCrashed`
/// carrying the worker's termination details.
fn finish_worker(
    reader: &mut File,
    pid: Option<libc::pid_t>,
    dir: &Path,
    before_reap: impl FnOnce(),
) -> Result<Envelope, Error> {
    let outcome = read_envelope(reader);
    before_reap();
    let status = pid.and_then(reap);
    match outcome {
        Ok(envelope) => {
            tracing::debug!(
                exit_code = envelope.exit_code,
                errors = envelope.errors.len(),
                frames = envelope.frames.len(),
                "recipe worker finished"
            );
            Ok(envelope)
        }
        Err(err) if err.kind() == ErrorKind::RecipeCrashed => {
            Err(with_crash_context(err, status, dir))
        }
        Err(err) => Err(err),
    }
}

impl Drop for RunningExecution<'_> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            // SAFETY: pid is our own un-reaped child.
            unsafe { libc::kill(pid, libc::SIGKILL) };
            reap(pid);
        }
    }
}

/// Reads one envelope using the two-phase protocol: length word, then payload.
pub fn read_envelope<R: Read>(mut reader: R) -> Result<Envelope, Error> {
    let mut header = [0u8; WORD_LEN];
    let got = read_full(&mut reader, &mut header)?;
    if got < WORD_LEN {
        return Err(crashed(format!(
            "result pipe closed after {got} of {WORD_LEN} header bytes"
        )));
    }
    let declared = declared_len(&header);
    let total = usize::try_from(declared)
        .ok()
        .filter(|total| (HEADER_LEN..=MAX_ENVELOPE_LEN).contains(total))
        .ok_or_else(|| crashed(format!("worker declared an impossible length {declared}")))?;

    let mut buf = vec![0u8; total];
    buf[..WORD_LEN].copy_from_slice(&header);
    let got = read_full(&mut reader, &mut buf[WORD_LEN..])?;
    if WORD_LEN + got != total {
        return Err(crashed(format!(
            "result pipe closed after {} of {total} bytes",
            WORD_LEN + got
        )));
    }
    Envelope::decode(&buf)
}

fn crashed(message: String) -> Error {
    Error::new(ErrorKind::RecipeCrashed).with_message(message)
}

fn with_crash_context(err: Error, status: Option<c_int>, dir: &Path) -> Error {
    let mut err = err.with_path(dir);
    if let Some(status) = status {
        if libc::WIFSIGNALED(status) {
            err = err.with_signal(libc::WTERMSIG(status));
        } else if libc::WIFEXITED(status) {
            err = err.with_hint(format!(
                "worker exited with status {} before writing a complete result",
                libc::WEXITSTATUS(status)
            ));
        }
    }
    if let Some(backtrace) = crash::collect_backtrace(dir) {
        err = err.with_backtrace(backtrace);
    }
    err
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to read result pipe")
                    .with_source(err));
            }
        }
    }
    Ok(filled)
}

fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let mut fds = [0 as c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe() writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::new(ErrorKind::Io)
            .with_message("cannot create result pipe")
            .with_source(io::Error::last_os_error()));
    }
    // SAFETY: both descriptors are fresh and owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn reap(pid: libc::pid_t) -> Option<c_int> {
    let mut status: c_int = 0;
    loop {
        // SAFETY: pid is a child of this process; status is a valid out pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Some(status);
        }
        if rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return None;
    }
}

#[derive(Clone, Copy, Default)]
struct CpuTimes {
    user: i64,
    sys: i64,
}

impl CpuTimes {
    fn now() -> Self {
        // SAFETY: tms is plain data; times() fills it.
        let mut tms: libc::tms = unsafe { std::mem::zeroed() };
        // SAFETY: tms is a valid out pointer.
        unsafe { libc::times(&mut tms) };
        Self {
            user: (tms.tms_utime + tms.tms_cutime) as i64,
            sys: (tms.tms_stime + tms.tms_cstime) as i64,
        }
    }

    /// Elapsed (user, sys) CPU time in microseconds.
    fn micros_since(self, start: CpuTimes) -> (i64, i64) {
        // SAFETY: sysconf has no preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as i64;
        (
            (self.user - start.user) * 1_000_000 / ticks,
            (self.sys - start.sys) * 1_000_000 / ticks,
        )
    }
}

struct ErrorSink {
    symbols: CplSymbols,
    records: Vec<ErrorRecord>,
}

thread_local! {
    static ERROR_SINK: RefCell<Option<ErrorSink>> = const { RefCell::new(None) };
}

unsafe extern "C" fn record_error(_current: c_uint, _first: c_uint, _last: c_uint) {
    ERROR_SINK.with(|sink| {
        let mut sink = sink.borrow_mut();
        let Some(sink) = sink.as_mut() else {
            return;
        };
        let symbols = sink.symbols;
        // SAFETY: the getters describe the error currently being dumped.
        unsafe {
            let code = (symbols.error_get_code)();
            if code == CPL_ERROR_NONE {
                return;
            }
            sink.records.push(ErrorRecord {
                code: code.into(),
                line: (symbols.error_get_line)().into(),
                message: borrowed_string((symbols.error_get_message)()).unwrap_or_default(),
                file: borrowed_string((symbols.error_get_file)()).unwrap_or_default(),
                function: borrowed_string((symbols.error_get_function)()).unwrap_or_default(),
            });
        }
    });
}

/// Collects every error raised since `prestate`, oldest first.
fn collect_errors(symbols: &CplSymbols, prestate: CplErrorState) -> Vec<ErrorRecord> {
    ERROR_SINK.with(|sink| {
        *sink.borrow_mut() = Some(ErrorSink {
            symbols: *symbols,
            records: Vec::new(),
        })
    });
    // SAFETY: the callback only reads through `symbols` of the same runtime.
    unsafe { (symbols.errorstate_dump)(prestate, CPL_FALSE, Some(record_error)) };
    ERROR_SINK
        .with(|sink| sink.borrow_mut().take())
        .map(|sink| sink.records)
        .unwrap_or_default()
}

/// # Safety
/// `frames` must be the live frameset of the recipe being executed.
unsafe fn stamp_products(symbols: &CplSymbols, frames: *mut CplFrameset) -> CplErrorCode {
    // SAFETY: frames is live per the caller contract.
    unsafe {
        match symbols.dfs_sign_products {
            Some(sign) => sign(frames, CPL_DFS_SIGNATURE_DATAMD5 | CPL_DFS_SIGNATURE_CHECKSUM),
            None => (symbols.dfs_update_product_header)(frames),
        }
    }
}

fn heap_flag(memory_is_empty: c_int) -> Option<bool> {
    match memory_is_empty {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn apply_env(env: &[(CString, Option<CString>)]) {
    for (name, value) in env {
        // SAFETY: the worker is single-threaded and the strings outlive the calls.
        unsafe {
            match value {
                Some(value) => libc::setenv(name.as_ptr(), value.as_ptr(), 1),
                None => libc::unsetenv(name.as_ptr()),
            };
        }
    }
}

const WORKER_FUNCTION: &CStr = c"run_worker";

fn source_file() -> &'static CStr {
    CStr::from_bytes_with_nul(concat!(file!(), "\0").as_bytes()).unwrap_or(c"harness.rs")
}

fn run_worker(recipe: &Recipe, plan: &WorkerPlan, pipe: OwnedFd) -> ! {
    let code = std::panic::catch_unwind(AssertUnwindSafe(|| worker_body(recipe, plan, pipe)))
        .unwrap_or(2);
    // SAFETY: terminates the forked worker without running the parent's exit handlers.
    unsafe { libc::_exit(code) }
}

fn worker_body(recipe: &Recipe, plan: &WorkerPlan, pipe: OwnedFd) -> c_int {
    let symbols = *recipe.library().symbols();
    let recipe_ptr = recipe.recipe_ptr();
    let plugin = recipe.plugin_ptr();

    apply_env(&plan.env);
    // SAFETY: logging setup takes C strings that outlive the calls.
    let prestate = unsafe {
        (symbols.msg_set_log_name)(plan.log_file.as_ptr());
        (symbols.msg_set_log_level)(plan.log_level);
        (symbols.msg_set_level)(CPL_MSG_OFF);
        (symbols.errorstate_get)()
    };

    let mut cpu = (0, 0);
    // SAFETY: dir is a valid C string.
    let retval = if unsafe { libc::chdir(plan.dir.as_ptr()) } == 0 {
        let start = CpuTimes::now();
        if plan.diagnostics.memory_trace {
            crash::start_memory_trace();
        }
        crash::install(plan.diagnostics.stack_dump, &plan.process_name);

        // SAFETY: the plugin was initialized in the parent and is inherited intact.
        let mut retval = unsafe {
            match (symbols.plugin_get_exec)(plugin) {
                Some(exec) => exec(plugin),
                None => -1,
            }
        };
        // SAFETY: frames belong to the recipe that just ran.
        let stamped = unsafe { stamp_products(&symbols, (*recipe_ptr).frames) };
        if stamped != CPL_ERROR_NONE {
            report_stamp_failure(&symbols);
            if retval == CPL_ERROR_NONE {
                retval = stamped;
            }
        }
        cpu = CpuTimes::now().micros_since(start);
        // SAFETY: closes the log opened above.
        unsafe { (symbols.msg_stop_log)() };
        retval
    } else {
        // SAFETY: records a structured error with static strings.
        unsafe {
            (symbols.error_set_message_macro)(
                WORKER_FUNCTION.as_ptr(),
                CPL_ERROR_FILE_NOT_CREATED,
                source_file().as_ptr(),
                line!(),
                c" ".as_ptr(),
            );
        }
        CPL_ERROR_FILE_NOT_CREATED
    };

    // SAFETY: reads runtime bookkeeping and the recipe's frameset.
    let envelope = unsafe {
        Envelope {
            exit_code: retval.into(),
            user_time_us: cpu.0,
            sys_time_us: cpu.1,
            heap_balanced: heap_flag((symbols.memory_is_empty)()),
            errors: collect_errors(&symbols, prestate),
            frames: product_frames(&symbols, (*recipe_ptr).frames),
        }
    };
    let mut pipe = File::from(pipe);
    // An unencodable envelope is left unwritten; the parent reports the run as crashed.
    let complete = envelope
        .encode()
        .is_ok_and(|bytes| pipe.write_all(&bytes).is_ok());
    drop(pipe);

    // SAFETY: tears down the inherited copies of this recipe's runtime objects.
    unsafe {
        (symbols.frameset_delete)((*recipe_ptr).frames);
        (symbols.parameterlist_delete)((*recipe_ptr).parameters);
        (*recipe_ptr).frames = std::ptr::null_mut();
        (*recipe_ptr).parameters = std::ptr::null_mut();
        if let Some(deinit) = (symbols.plugin_get_deinit)(plugin) {
            deinit(plugin);
        }
        (symbols.pluginlist_delete)(recipe.list_ptr());
        let dump = match plan.diagnostics.memory_dump {
            MemoryDump::Never => false,
            MemoryDump::IfLeaked => (symbols.memory_is_empty)() == 0,
            MemoryDump::Always => true,
        };
        if dump {
            (symbols.memory_dump)();
        }
        (symbols.end)();
    }
    if plan.diagnostics.memory_trace {
        crash::stop_memory_trace();
    }
    if complete { 0 } else { 1 }
}

fn report_stamp_failure(symbols: &CplSymbols) {
    // SAFETY: error getters return runtime-owned strings; msg_error copies its arguments.
    unsafe {
        let message = format!(
            "could not update the product header. {} ({}:{}:{})",
            borrowed_string((symbols.error_get_message)()).unwrap_or_default(),
            borrowed_string((symbols.error_get_function)()).unwrap_or_default(),
            borrowed_string((symbols.error_get_file)()).unwrap_or_default(),
            (symbols.error_get_line)(),
        );
        let message = to_cstring(&message);
        (symbols.msg_error)(WORKER_FUNCTION.as_ptr(), c"%s".as_ptr(), message.as_ptr());
    }
}
