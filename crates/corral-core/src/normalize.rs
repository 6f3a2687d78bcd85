//! Request validation and defaulting
//!
//! Turns the four caller records into a [`LaunchRequest`]. Nothing here has
//! side effects: files are inspected, never opened or created.

use crate::config::{GuardSpec, IoSpec, LimitSpec, ProgramSpec};
use crate::isolation::identity::Identity;
use crate::{CorralError, Result};
use caps::{CapSet, Capability};
use nix::unistd::{AccessFlags, Gid, Uid, access};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Where the child's stderr goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrTarget {
    /// Engine's own stderr
    Inherit,
    /// A file of its own
    File(PathBuf),
    /// Same destination as stdout
    Stdout,
}

/// Normalized stream redirection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioRequest {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: StderrTarget,
}

impl StdioRequest {
    const INHERIT: Self = Self {
        stdin: None,
        stdout: None,
        stderr: StderrTarget::Inherit,
    };
}

/// A validated request, ready for isolation setup
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: CString,
    pub argv: Vec<CString>,
    pub working_dir: Option<CString>,
    pub identity: Option<Identity>,
    pub stdio: StdioRequest,
    pub limits: LimitSpec,
    pub guard: GuardSpec,
}

/// Validate and default the four input records
pub fn normalize(
    program: &ProgramSpec,
    io: &IoSpec,
    limits: &LimitSpec,
    guard: &GuardSpec,
) -> Result<LaunchRequest> {
    let identity = resolve_identity(&program.exec_as_user)?;
    let working_dir = check_working_dir(&program.working_dir)?;
    let path = resolve_program(&program.program_path, &program.working_dir)?;
    let path = check_program(&path, identity.as_ref())?;
    let argv = build_argv(&path, &program.args)?;
    let stdio = check_io(io)?;
    let guard = check_guard(guard)?;

    Ok(LaunchRequest {
        program: path_to_cstring(&path)?,
        argv,
        working_dir,
        identity,
        stdio,
        limits: limits.clone(),
        guard,
    })
}

fn resolve_identity(user: &str) -> Result<Option<Identity>> {
    if user.is_empty() {
        return Ok(None);
    }

    let identity = Identity::resolve(user)?;
    if identity.requires_switch() && !has_caps(&[Capability::CAP_SETUID, Capability::CAP_SETGID])? {
        return Err(CorralError::Identity(format!(
            "switching to user '{user}' requires CAP_SETUID and CAP_SETGID"
        )));
    }
    Ok(Some(identity))
}

/// Anchor a relative program path at the directory the child will run in.
///
/// The child changes directory before exec, so a relative path must be
/// checked and executed against `working_dir`, or the engine's own
/// directory when none is set.
fn resolve_program(path: &Path, working_dir: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    if working_dir.is_absolute() {
        return Ok(working_dir.join(path));
    }

    let cwd = std::env::current_dir()
        .map_err(|e| CorralError::Config(format!("cannot resolve {}: {e}", path.display())))?;
    Ok(cwd.join(working_dir).join(path))
}

fn check_program(path: &Path, identity: Option<&Identity>) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(CorralError::Config("program path is empty".into()));
    }

    let meta = std::fs::metadata(path)
        .map_err(|e| CorralError::Config(format!("program {}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(CorralError::Config(format!(
            "program {} is not a regular file",
            path.display()
        )));
    }

    let (uid, gids) = match identity {
        Some(id) => (id.uid, id.groups.clone()),
        None => {
            let mut gids = nix::unistd::getgroups().unwrap_or_default();
            gids.push(nix::unistd::getegid());
            (nix::unistd::geteuid(), gids)
        }
    };

    if !permits(&meta, uid, &gids, 0o5) {
        return Err(CorralError::Config(format!(
            "program {} is not readable and executable by uid {uid}",
            path.display()
        )));
    }

    Ok(path.to_path_buf())
}

/// Check `mask` (octal `rwx` bits, e.g. `0o5` for r-x) against the owner,
/// group or other class that applies to `uid`/`gids`.
fn permits(meta: &std::fs::Metadata, uid: Uid, gids: &[Gid], mask: u32) -> bool {
    let mode = meta.permissions().mode();

    if uid.is_root() {
        // root needs at least one execute bit, reads are never denied
        return mask & 0o1 == 0 || mode & 0o111 != 0;
    }

    let class = if meta.uid() == uid.as_raw() {
        (mode >> 6) & 0o7
    } else if gids.iter().any(|g| g.as_raw() == meta.gid()) {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    class & mask == mask
}

fn build_argv(program: &Path, args: &[String]) -> Result<Vec<CString>> {
    let argv0 = program
        .file_name()
        .map_or_else(|| program.as_os_str(), |name| name);

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(
        CString::new(argv0.as_bytes())
            .map_err(|_| CorralError::Config("program name contains NUL".into()))?,
    );
    for arg in args {
        argv.push(
            CString::new(arg.as_bytes())
                .map_err(|_| CorralError::Config(format!("argument {arg:?} contains NUL")))?,
        );
    }
    Ok(argv)
}

fn check_working_dir(dir: &Path) -> Result<Option<CString>> {
    if dir.as_os_str().is_empty() {
        return Ok(None);
    }
    if !dir.is_dir() {
        return Err(CorralError::Config(format!(
            "working directory {} does not exist",
            dir.display()
        )));
    }
    Ok(Some(path_to_cstring(dir)?))
}

fn check_io(io: &IoSpec) -> Result<StdioRequest> {
    if !io.redirected {
        return Ok(StdioRequest::INHERIT);
    }

    let stdin = non_empty(&io.stdin_path);
    let stdout = non_empty(&io.stdout_path);
    let stderr = if io.dup_err_out {
        if non_empty(&io.stderr_path).is_some() {
            tracing::debug!("stderr path ignored, stderr aliases stdout");
        }
        StderrTarget::Stdout
    } else {
        non_empty(&io.stderr_path).map_or(StderrTarget::Inherit, StderrTarget::File)
    };

    if let Some(path) = &stdin {
        check_readable(path)?;
    }
    if let Some(path) = &stdout {
        check_writable(path)?;
    }
    if let StderrTarget::File(path) = &stderr {
        check_writable(path)?;
    }

    Ok(StdioRequest {
        stdin,
        stdout,
        stderr,
    })
}

fn non_empty(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path.to_path_buf())
    }
}

fn check_readable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| CorralError::Stdio(format!("stdin {}: {e}", path.display())))?;
    if meta.is_dir() {
        return Err(CorralError::Stdio(format!(
            "stdin {} is a directory",
            path.display()
        )));
    }
    access(path, AccessFlags::R_OK)
        .map_err(|e| CorralError::Stdio(format!("stdin {} is not readable: {e}", path.display())))
}

fn check_writable(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(CorralError::Stdio(format!(
            "output {} is a directory",
            path.display()
        ))),
        Ok(_) => access(path, AccessFlags::W_OK).map_err(|e| {
            CorralError::Stdio(format!("output {} is not writable: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            if !parent.is_dir() {
                return Err(CorralError::Stdio(format!(
                    "output directory {} does not exist",
                    parent.display()
                )));
            }
            access(parent, AccessFlags::W_OK | AccessFlags::X_OK).map_err(|e| {
                CorralError::Stdio(format!(
                    "cannot create {} in {}: {e}",
                    path.display(),
                    parent.display()
                ))
            })
        }
        Err(e) => Err(CorralError::Stdio(format!("output {}: {e}", path.display()))),
    }
}

fn check_guard(guard: &GuardSpec) -> Result<GuardSpec> {
    let mut guard = guard.clone();

    if guard.scmp_deny_common && !guard.scmp_enabled {
        tracing::debug!("scmp_deny_common has no effect without scmp_enabled");
        guard.scmp_deny_common = false;
    }

    if (guard.unshare_common || guard.unshare_network) && !has_caps(&[Capability::CAP_SYS_ADMIN])? {
        return Err(CorralError::Namespace(
            "namespace isolation requires CAP_SYS_ADMIN".into(),
        ));
    }

    Ok(guard)
}

fn has_caps(wanted: &[Capability]) -> Result<bool> {
    for cap in wanted {
        let held = caps::has_cap(None, CapSet::Effective, *cap)
            .map_err(|e| CorralError::Config(format!("cannot query capabilities: {e}")))?;
        if !held {
            return Ok(false);
        }
    }
    Ok(true)
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CorralError::Config(format!("path {} contains NUL", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn run(program: &ProgramSpec, io: &IoSpec) -> Result<LaunchRequest> {
        normalize(program, io, &LimitSpec::default(), &GuardSpec::default())
    }

    #[test]
    fn argv0_is_file_name() {
        let request = run(&ProgramSpec::new("/bin/sh").args(["-c", "true"]), &IoSpec::inherit())
            .unwrap();
        let argv: Vec<_> = request.argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(argv, ["sh", "-c", "true"]);
        assert_eq!(request.program.to_str().unwrap(), "/bin/sh");
        assert!(request.working_dir.is_none());
        assert!(request.identity.is_none());
    }

    #[test]
    fn empty_program_path_is_rejected() {
        let err = run(&ProgramSpec::default(), &IoSpec::inherit()).unwrap_err();
        assert!(matches!(err, CorralError::Config(_)));
    }

    #[test]
    fn missing_program_is_rejected() {
        let err = run(&ProgramSpec::new("/nonexistent/corral-test"), &IoSpec::inherit())
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/corral-test"));
    }

    #[test]
    fn directory_is_not_a_program() {
        let err = run(&ProgramSpec::new("/"), &IoSpec::inherit()).unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn non_executable_file_is_rejected_for_unprivileged_callers() {
        if Uid::effective().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "not a program").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = run(&ProgramSpec::new(&path), &IoSpec::inherit()).unwrap_err();
        assert!(err.to_string().contains("not readable and executable"));
    }

    #[test]
    fn relative_program_resolves_against_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\ntrue\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let spec = ProgramSpec::new("./run.sh").working_dir(dir.path());
        let request = run(&spec, &IoSpec::inherit()).unwrap();
        assert_eq!(request.program.as_bytes(), script.as_os_str().as_bytes());
        assert!(script.is_absolute());
        assert_eq!(request.argv[0].to_str().unwrap(), "run.sh");
    }

    #[test]
    fn relative_program_outside_working_dir_is_rejected() {
        // present in the engine's directory but not in the child's
        let cwd = std::env::current_dir().unwrap();
        assert!(cwd.join("Cargo.toml").is_file());
        let dir = tempfile::tempdir().unwrap();

        let spec = ProgramSpec::new("Cargo.toml").working_dir(dir.path());
        let err = run(&spec, &IoSpec::inherit()).unwrap_err();
        assert!(matches!(err, CorralError::Config(_)));
        assert!(err.to_string().contains(&*dir.path().to_string_lossy()));
    }

    #[test]
    fn relative_program_without_working_dir_uses_engine_dir() {
        // resolved to an absolute path first, then refused for lacking x bits
        let err = run(&ProgramSpec::new("Cargo.toml"), &IoSpec::inherit()).unwrap_err();
        let expected = std::env::current_dir().unwrap().join("Cargo.toml");
        assert!(err.to_string().contains(&*expected.to_string_lossy()));
    }

    #[test]
    fn permission_check_honours_supplementary_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o750)).unwrap();
        let meta = fs::metadata(&path).unwrap();
        let owner_group = Gid::from_raw(meta.gid());
        let stranger = Uid::from_raw(65534);
        assert_ne!(meta.uid(), stranger.as_raw());

        let primary = Gid::from_raw(meta.gid().wrapping_add(4242));
        assert!(permits(&meta, stranger, &[primary, owner_group], 0o5));
        assert!(!permits(&meta, stranger, &[primary], 0o5));
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let err = run(&ProgramSpec::new("/bin/echo").arg("a\0b"), &IoSpec::inherit())
            .unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn missing_working_dir_is_rejected() {
        let spec = ProgramSpec::new("/bin/true").working_dir("/nonexistent/corral-cwd");
        let err = run(&spec, &IoSpec::inherit()).unwrap_err();
        assert!(err.to_string().contains("working directory"));
    }

    #[test]
    fn unknown_user_is_rejected() {
        let spec = ProgramSpec::new("/bin/true").exec_as_user("corral-no-such-user");
        let err = run(&spec, &IoSpec::inherit()).unwrap_err();
        assert!(matches!(err, CorralError::Identity(_)));
    }

    #[test]
    fn empty_paths_stay_inherited() {
        let io = IoSpec {
            redirected: true,
            ..IoSpec::default()
        };
        let request = run(&ProgramSpec::new("/bin/true"), &io).unwrap();
        assert_eq!(request.stdio, StdioRequest::INHERIT);
    }

    #[test]
    fn dup_err_out_ignores_stderr_path() {
        let dir = tempfile::tempdir().unwrap();
        let io = IoSpec::inherit()
            .stdout(dir.path().join("out"))
            .stderr(dir.path().join("err"))
            .dup_err_out(true);
        let request = run(&ProgramSpec::new("/bin/true"), &io).unwrap();
        assert_eq!(request.stdio.stderr, StderrTarget::Stdout);
        assert_eq!(request.stdio.stdout, Some(dir.path().join("out")));
        assert!(!dir.path().join("out").exists(), "normalizing must not create files");
    }

    #[test]
    fn missing_stdin_is_rejected() {
        let io = IoSpec::inherit().stdin("/nonexistent/corral-stdin");
        let err = run(&ProgramSpec::new("/bin/cat"), &io).unwrap_err();
        assert!(matches!(err, CorralError::Stdio(_)));
    }

    #[test]
    fn output_in_missing_directory_is_rejected() {
        let io = IoSpec::inherit().stdout("/nonexistent/dir/out.txt");
        let err = run(&ProgramSpec::new("/bin/true"), &io).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn deny_common_needs_seccomp_enabled() {
        let guard = GuardSpec {
            scmp_deny_common: true,
            ..GuardSpec::default()
        };
        let request = normalize(
            &ProgramSpec::new("/bin/true"),
            &IoSpec::inherit(),
            &LimitSpec::default(),
            &guard,
        )
        .unwrap();
        assert!(!request.guard.scmp_deny_common);
    }
}
