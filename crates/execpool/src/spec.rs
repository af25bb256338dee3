//! Immutable template describing how to start one worker process.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::error::{Error, Result, SpawnError};

/// How to spawn a worker: program, arguments, environment, working
/// directory and extra inherited files.
///
/// A pool owns its spec for its whole lifetime. Every spawn builds a fresh
/// [`Command`] from copies of these lists, so no two workers share argument
/// or environment storage.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    env_clear: bool,
    current_dir: Option<PathBuf>,
    extra_files: Vec<Arc<File>>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            env_clear: false,
            current_dir: None,
            extra_files: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Add an environment assignment for the worker.
    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    /// Start workers with only the explicitly assigned environment.
    #[must_use]
    pub const fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Pass an open file to every worker. Files are inherited in order as
    /// descriptors 3, 4, ... (unix only).
    #[must_use]
    pub fn extra_file(mut self, file: File) -> Self {
        self.extra_files.push(Arc::new(file));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn extra_file_count(&self) -> usize {
        self.extra_files.len()
    }

    /// Resolve the program on `PATH`, failing if it is not executable.
    pub fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.program).map_err(|source| Error::Lookup {
            program: self.program.clone(),
            source,
        })
    }

    /// Build a command for one new worker with piped stdin/stdout.
    pub fn command(&self) -> std::result::Result<Command, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if self.env_clear {
            cmd.env_clear();
        }
        cmd.envs(self.env.iter().cloned());

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        if !self.extra_files.is_empty() {
            inherit_files(&mut cmd, &self.extra_files)?;
        }

        Ok(cmd)
    }
}

#[cfg(unix)]
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn inherit_files(cmd: &mut Command, files: &[Arc<File>]) -> std::result::Result<(), SpawnError> {
    use std::os::fd::{AsRawFd, RawFd};

    const FIRST_EXTRA_FD: RawFd = 3;

    let sources: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
    let floor = FIRST_EXTRA_FD + sources.len() as RawFd;
    // Preallocated so the child never allocates between fork and exec.
    let mut staged: Vec<RawFd> = vec![-1; sources.len()];

    // SAFETY: the closure runs in the forked child before exec and only calls
    // fcntl(2) and dup2(2), which are async-signal-safe. It does not allocate.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(move || {
            // Lift every source above the target range first so that mapping
            // fd N to 3 + i can never clobber a source that is still needed.
            for (slot, &fd) in staged.iter_mut().zip(&sources) {
                let dup = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor);
                if dup < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                *slot = dup;
            }
            for (i, &fd) in staged.iter().enumerate() {
                // dup2 onto a different descriptor clears FD_CLOEXEC.
                if libc::dup2(fd, FIRST_EXTRA_FD + i as RawFd) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    Ok(())
}

#[cfg(not(unix))]
fn inherit_files(_cmd: &mut Command, _files: &[Arc<File>]) -> std::result::Result<(), SpawnError> {
    Err(SpawnError::ExtraFilesUnsupported)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_fields() {
        let spec = ProcessSpec::new("grep")
            .arg("-i")
            .args(["none", "--color=never"])
            .env("LC_ALL", "C")
            .envs([("A", "1")])
            .current_dir("/tmp");

        assert_eq!(spec.program(), Path::new("grep"));
        assert_eq!(spec.get_args(), ["-i", "none", "--color=never"]);
        assert_eq!(spec.get_envs().len(), 2);
        assert_eq!(spec.get_current_dir(), Some(Path::new("/tmp")));
        assert_eq!(spec.extra_file_count(), 0);
    }

    #[test]
    fn clones_do_not_share_lists() {
        let spec = ProcessSpec::new("grep").arg("none");
        let extended = spec.clone().arg("--count");
        assert_eq!(spec.get_args().len(), 1);
        assert_eq!(extended.get_args().len(), 2);
    }

    #[test]
    fn resolve_finds_programs_on_path() {
        let path = ProcessSpec::new("sh").resolve().unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn resolve_rejects_missing_program() {
        let err = ProcessSpec::new("-this-command-does-not-exist-")
            .resolve()
            .unwrap_err();
        assert!(matches!(err, Error::Lookup { .. }));
        assert!(err.to_string().contains("-this-command-does-not-exist-"));
    }
}
