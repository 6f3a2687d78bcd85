//! C FFI bindings for corral
//!
//! This crate exposes `corral_core::execute` over a fixed-layout C ABI.
//!
//! # Example (C)
//! ```c
//! #include <corral.h>
//!
//! CorralProgram program = { "/bin/echo", "hello world", NULL, NULL };
//! CorralIo io = { 1, NULL, "/tmp/out.txt", NULL, 1 };
//! CorralLimits limits = { 1000, 0, 64 << 20, 0, 0, 0, 0 };
//! CorralGuard guard = { 1, 0, 0, 0 };
//!
//! CorralOutcome outcome = corral_execute(&program, &io, &limits, &guard);
//! if (outcome.kill_reason == CORRAL_KILL_UNSET) {
//!     fprintf(stderr, "%s\n", corral_last_error());
//! }
//! ```

#![allow(clippy::missing_safety_doc)]

use corral_core::{
    Engine, ExecutionOutcome, GuardSpec, IoSpec, KillReason, LaunchError, LimitSpec, ProgramSpec,
    SetupStage,
};
use libc::{c_char, c_int};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::ptr;

/// Bumped on any change to the layout of the records below
pub const CORRAL_ABI_VERSION: u32 = 1;

pub const CORRAL_KILL_UNSET: c_int = KillReason::Unset.code();
pub const CORRAL_KILL_NONE: c_int = KillReason::None.code();
pub const CORRAL_KILL_SECURITY: c_int = KillReason::Security.code();
pub const CORRAL_KILL_REALTIME: c_int = KillReason::RealTime.code();
pub const CORRAL_KILL_PROCTIME: c_int = KillReason::ProcTime.code();
pub const CORRAL_KILL_PROCWSET: c_int = KillReason::ProcWSet.code();

/// Bits of `CorralOutcome::unenforced`
pub const CORRAL_UNENFORCED_PROC_TIME: u32 = 1;
pub const CORRAL_UNENFORCED_PROC_WSET: u32 = 2;

/// What to run and as whom
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CorralProgram {
    /// Executable path, used as given
    pub program_path: *const c_char,
    /// Arguments split on whitespace; NULL for none
    pub program_args: *const c_char,
    /// NULL or empty to inherit
    pub working_dir: *const c_char,
    /// NULL or empty to keep the caller's identity
    pub exec_as_user: *const c_char,
}

/// Standard stream redirection. Paths may be NULL.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CorralIo {
    pub io_redirected: u8,
    pub stdin_path: *const c_char,
    pub stdout_path: *const c_char,
    pub stderr_path: *const c_char,
    pub dup_err_out: u8,
}

/// Resource limits. Zero means unbounded.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CorralLimits {
    /// Milliseconds
    pub limit_real_time: u64,
    /// Milliseconds
    pub limit_proc_time: u64,
    /// Bytes
    pub limit_proc_wset: u64,
    pub rlimit_enabled: u8,
    pub rlimit_core: u64,
    pub rlimit_nproc: u64,
    pub rlimit_nofile: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CorralGuard {
    pub scmp_enabled: u8,
    pub scmp_deny_common: u8,
    pub unshare_common: u8,
    pub unshare_network: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorralUsage {
    /// Wall time in milliseconds
    pub real_time: u64,
    /// CPU time in milliseconds
    pub proc_time: u64,
    /// Peak working set in bytes
    pub proc_wset: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorralOutcome {
    /// -1 unless the program exited normally
    pub exit_code: c_int,
    /// Terminating signal, 0 if none
    pub exit_sign: c_int,
    pub is_killed: u8,
    /// One of the `CORRAL_KILL_*` constants
    pub kill_reason: c_int,
    pub res_usage: CorralUsage,
    /// `CORRAL_UNENFORCED_*` bits
    pub unenforced: u32,
}

impl From<&ExecutionOutcome> for CorralOutcome {
    fn from(outcome: &ExecutionOutcome) -> Self {
        Self {
            exit_code: outcome.exit_code,
            exit_sign: outcome.signal.unwrap_or(0),
            is_killed: u8::from(outcome.is_killed),
            kill_reason: outcome.kill_reason.code(),
            res_usage: CorralUsage {
                real_time: outcome.usage.real_time_ms(),
                proc_time: outcome.usage.proc_time_ms(),
                proc_wset: outcome.usage.peak_wset,
            },
            unenforced: outcome.unenforced.bits(),
        }
    }
}

// Tuning comes from CORRAL_* variables, read on first use
static ENGINE: Lazy<Engine> = Lazy::new(Engine::from_env);

// Thread-local error message
thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some(msg);
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Get the last error message
///
/// Returns NULL if the last `corral_execute` on this thread produced an
/// outcome. The returned string is valid until the next corral call on this
/// thread.
#[unsafe(no_mangle)]
pub extern "C" fn corral_last_error() -> *const c_char {
    thread_local! {
        static ERROR_BUF: RefCell<Option<CString>> = const { RefCell::new(None) };
    }

    LAST_ERROR.with(|e| {
        let err = e.borrow();
        match &*err {
            Some(msg) => ERROR_BUF.with(|buf| {
                let cstr = CString::new(msg.replace('\0', " ")).unwrap_or_default();
                let ptr = cstr.as_ptr();
                *buf.borrow_mut() = Some(cstr);
                ptr
            }),
            None => ptr::null(),
        }
    })
}

/// Run one program to completion
///
/// Never fails as a call: invalid arguments and launch failures come back
/// with `kill_reason == CORRAL_KILL_UNSET`; `corral_last_error()` then
/// describes the problem.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_execute(
    program: *const CorralProgram,
    io: *const CorralIo,
    limits: *const CorralLimits,
    guard: *const CorralGuard,
) -> CorralOutcome {
    clear_last_error();

    // SAFETY: caller guarantees every non-null pointer is valid
    let specs = unsafe { convert(program, io, limits, guard) };
    let outcome = match specs {
        Ok((program, io, limits, guard)) => ENGINE.execute(&program, &io, &limits, &guard),
        Err(message) => {
            ExecutionOutcome::launch_failed(LaunchError::new(SetupStage::Validate, message))
        }
    };

    if let Some(error) = &outcome.launch_error {
        set_last_error(error.to_string());
    }
    CorralOutcome::from(&outcome)
}

unsafe fn convert(
    program: *const CorralProgram,
    io: *const CorralIo,
    limits: *const CorralLimits,
    guard: *const CorralGuard,
) -> Result<(ProgramSpec, IoSpec, LimitSpec, GuardSpec), String> {
    // SAFETY: caller guarantees the pointers are valid or null
    let (program, io, limits, guard) = unsafe {
        (
            program.as_ref().ok_or("program is null")?,
            io.as_ref(),
            limits.as_ref(),
            guard.as_ref(),
        )
    };

    // SAFETY: string fields are valid C strings or null
    let program_spec = unsafe {
        let path = required_str(program.program_path, "program_path")?;
        ProgramSpec::new(path)
            .arg_string(&optional_str(program.program_args, "program_args")?)
            .working_dir(optional_str(program.working_dir, "working_dir")?)
            .exec_as_user(optional_str(program.exec_as_user, "exec_as_user")?)
    };

    let io_spec = match io {
        None => IoSpec::inherit(),
        // SAFETY: as above
        Some(io) => unsafe {
            IoSpec {
                redirected: flag(io.io_redirected, "io_redirected")?,
                stdin_path: PathBuf::from(optional_str(io.stdin_path, "stdin_path")?),
                stdout_path: PathBuf::from(optional_str(io.stdout_path, "stdout_path")?),
                stderr_path: PathBuf::from(optional_str(io.stderr_path, "stderr_path")?),
                dup_err_out: flag(io.dup_err_out, "dup_err_out")?,
            }
        },
    };

    let limits = limits.copied().unwrap_or_default();
    let limit_spec = LimitSpec {
        limit_real_time: limits.limit_real_time,
        limit_proc_time: limits.limit_proc_time,
        limit_proc_wset: limits.limit_proc_wset,
        rlimit_enabled: flag(limits.rlimit_enabled, "rlimit_enabled")?,
        rlimit_core: limits.rlimit_core,
        rlimit_nproc: limits.rlimit_nproc,
        rlimit_nofile: limits.rlimit_nofile,
    };

    let guard = guard.copied().unwrap_or_default();
    let guard_spec = GuardSpec {
        scmp_enabled: flag(guard.scmp_enabled, "scmp_enabled")?,
        scmp_deny_common: flag(guard.scmp_deny_common, "scmp_deny_common")?,
        unshare_common: flag(guard.unshare_common, "unshare_common")?,
        unshare_network: flag(guard.unshare_network, "unshare_network")?,
    };

    Ok((program_spec, io_spec, limit_spec, guard_spec))
}

fn flag(value: u8, field: &str) -> Result<bool, String> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(format!("{field} must be 0 or 1, got {other}")),
    }
}

unsafe fn required_str(ptr: *const c_char, field: &str) -> Result<String, String> {
    if ptr.is_null() {
        return Err(format!("{field} is null"));
    }
    // SAFETY: caller guarantees ptr is a valid C string
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(str::to_owned)
        .map_err(|_| format!("invalid UTF-8 in {field}"))
}

unsafe fn optional_str(ptr: *const c_char, field: &str) -> Result<String, String> {
    if ptr.is_null() {
        Ok(String::new())
    } else {
        // SAFETY: forwarded from the caller
        unsafe { required_str(ptr, field) }
    }
}

/// Get library version
#[unsafe(no_mangle)]
pub extern "C" fn corral_version() -> *const c_char {
    static VERSION: Lazy<CString> =
        Lazy::new(|| CString::new(env!("CARGO_PKG_VERSION")).unwrap_or_default());
    VERSION.as_ptr()
}

/// Layout version of the records in this header
#[unsafe(no_mangle)]
pub extern "C" fn corral_abi_version() -> u32 {
    CORRAL_ABI_VERSION
}
