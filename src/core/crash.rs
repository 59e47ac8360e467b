//! Purpose: Best-effort forensic capture for a worker that dies on a fatal signal.
//! Exports: `install`, `collect_backtrace`, file name constants.
//! Role: Side channel of the harness; never part of the primary crash detection path.
//! Invariants: Handlers only run inside the forked worker.
//! Invariants: Handlers restore the default disposition and re-raise, so the worker still dies.
//! Invariants: The signal path uses raw `libc` calls and prebuilt strings; no allocation.

use std::ffi::CString;
use std::fs;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::OnceLock;

pub const UNPROCESSED_BACKTRACE_FILE: &str = "recipe.backtrace-unprocessed";
pub const BACKTRACE_FILE: &str = "recipe.backtrace";
pub const GDB_COMMANDS_FILE: &str = "gdb_commands";
pub const MTRACE_FILE: &str = "recipe.mtrace";

const FATAL_SIGNALS: [c_int; 8] = [
    libc::SIGSEGV,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGFPE,
    libc::SIGQUIT,
    libc::SIGBUS,
    libc::SIGTERM,
    libc::SIGABRT,
];

const GDB_SCRIPT: &[u8] = b"set height 0\nset width 0\nbt full\ninfo sources\ninfo files\n";

struct CrashContext {
    stack_dump: bool,
    record_path: CString,
    commands_path: CString,
    gdb_command: CString,
}

static CONTEXT: OnceLock<CrashContext> = OnceLock::new();

/// Installs fault handlers in the current (worker) process.
///
/// Paths are relative to the worker's working directory at the time of the fault.
pub(crate) fn install(stack_dump: bool, process_name: &str) {
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() };
    let gdb_command = format!(
        "gdb -batch -x {GDB_COMMANDS_FILE} --pid {pid} --readnow >> {UNPROCESSED_BACKTRACE_FILE} 2>&1"
    );
    let _ = CONTEXT.set(CrashContext {
        stack_dump,
        record_path: crate::core::cpl::to_cstring(UNPROCESSED_BACKTRACE_FILE),
        commands_path: crate::core::cpl::to_cstring(GDB_COMMANDS_FILE),
        gdb_command: crate::core::cpl::to_cstring(&gdb_command),
    });

    allow_debugger_attach(process_name);

    for signal in FATAL_SIGNALS {
        // SAFETY: the handler only performs raw syscalls on data prepared above.
        unsafe {
            libc::signal(signal, on_fatal_signal as extern "C" fn(c_int) as libc::sighandler_t);
        }
    }
}

#[cfg(target_os = "linux")]
fn allow_debugger_attach(process_name: &str) {
    let name = crate::core::cpl::to_cstring(process_name);
    // SAFETY: prctl with these options only reads the provided arguments.
    unsafe {
        libc::prctl(libc::PR_SET_PTRACER, libc::PR_SET_PTRACER_ANY, 0, 0, 0);
        libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0);
    }
}

#[cfg(not(target_os = "linux"))]
fn allow_debugger_attach(_process_name: &str) {}

/// Enables glibc malloc tracing into `recipe.mtrace` in the working directory.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub(crate) fn start_memory_trace() {
    unsafe extern "C" {
        fn mtrace();
    }
    let key = c"MALLOC_TRACE";
    let value = crate::core::cpl::to_cstring(MTRACE_FILE);
    // SAFETY: the worker is single-threaded; mtrace reads MALLOC_TRACE once.
    unsafe {
        libc::setenv(key.as_ptr(), value.as_ptr(), 1);
        mtrace();
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub(crate) fn start_memory_trace() {}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub(crate) fn stop_memory_trace() {
    unsafe extern "C" {
        fn muntrace();
    }
    // SAFETY: muntrace is a no-op when tracing was never started.
    unsafe { muntrace() };
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub(crate) fn stop_memory_trace() {}

extern "C" fn on_fatal_signal(signal: c_int) {
    if let Some(context) = CONTEXT.get() {
        write_record(context, signal);
        if context.stack_dump {
            dump_stack(context);
        }
    }
    // SAFETY: restoring the default disposition and re-raising terminates the worker.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

fn write_record(context: &CrashContext, signal: c_int) {
    let mut line = [0u8; 64];
    let len = format_record(&mut line, signal);
    // SAFETY: open/write/close on a prebuilt path and a stack buffer.
    unsafe {
        let fd = libc::open(
            context.record_path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o644,
        );
        if fd >= 0 {
            libc::write(fd, line.as_ptr().cast(), len);
            libc::close(fd);
        }
    }
}

fn dump_stack(context: &CrashContext) {
    // SAFETY: open/write/close/system/unlink on prebuilt paths and a static script.
    unsafe {
        let fd = libc::open(
            context.commands_path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o644,
        );
        if fd < 0 {
            return;
        }
        libc::write(fd, GDB_SCRIPT.as_ptr().cast(), GDB_SCRIPT.len());
        libc::close(fd);
        libc::system(context.gdb_command.as_ptr());
        libc::unlink(context.commands_path.as_ptr());
    }
}

/// Formats `Received signal: N\n` without allocating.
fn format_record(out: &mut [u8; 64], signal: c_int) -> usize {
    const PREFIX: &[u8] = b"Received signal: ";
    out[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut len = PREFIX.len();
    let mut digits = [0u8; 12];
    let mut n = signal.unsigned_abs();
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        count += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if signal < 0 {
        out[len] = b'-';
        len += 1;
    }
    for i in (0..count).rev() {
        out[len] = digits[i];
        len += 1;
    }
    out[len] = b'\n';
    len + 1
}

/// Moves the crash record to its final name and returns its contents.
pub(crate) fn collect_backtrace(dir: &Path) -> Option<String> {
    let unprocessed = dir.join(UNPROCESSED_BACKTRACE_FILE);
    if !unprocessed.exists() {
        return None;
    }
    let target = dir.join(BACKTRACE_FILE);
    let path = match fs::rename(&unprocessed, &target) {
        Ok(()) => target,
        Err(err) => {
            tracing::debug!(error = %err, "could not rename crash record");
            unprocessed
        }
    };
    fs::read(&path)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
