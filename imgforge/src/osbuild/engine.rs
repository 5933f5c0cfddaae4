//! Running the external build engine on a manifest.
//!
//! The manifest goes in on stdin. Progress comes back as a JSON stream on a
//! dedicated pipe that the child sees as fd 3, and the final result as JSON
//! on stdout.

use std::env;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use semver::Version;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::monitor::{BuildResult, Status, StatusScanner};

/// Oldest engine release that understands every stage we emit.
pub const MIN_ENGINE_VERSION: u64 = 129;

/// Overrides the engine binary.
pub const ENGINE_ENV: &str = "IMGFORGE_ENGINE";
pub const DEFAULT_ENGINE: &str = "osbuild";

/// Descriptor the engine writes its monitor stream to.
pub const MONITOR_FD: i32 = 3;
pub const MONITOR_NAME: &str = "JSONSeqMonitor";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse engine version from {0:?}")]
    Version(String),
    #[error("engine version {found} is older than the required {required}")]
    TooOld { found: Version, required: Version },
    #[error("engine failed ({status}):\n{stderr}")]
    Failed { status: String, stderr: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where the engine keeps its state and what it should hand back.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub store: PathBuf,
    pub output_directory: PathBuf,
    pub exports: Vec<String>,
    pub checkpoints: Vec<String>,
    pub cache_max_size: Option<u64>,
}

/// The engine binary to run.
pub fn engine_program() -> String {
    env::var(ENGINE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_ENGINE.to_string())
}

/// Command line for a build with the manifest on stdin.
pub fn build_args(options: &BuildOptions) -> Vec<String> {
    let mut args = vec![
        "--store".to_string(),
        options.store.display().to_string(),
        "--output-directory".to_string(),
        options.output_directory.display().to_string(),
    ];
    if let Some(size) = options.cache_max_size {
        args.push(format!("--cache-max-size={size}"));
    }
    args.push("-".to_string());
    for export in &options.exports {
        args.push("--export".to_string());
        args.push(export.clone());
    }
    for checkpoint in &options.checkpoints {
        args.push("--checkpoint".to_string());
        args.push(checkpoint.clone());
    }
    args.push(format!("--monitor={MONITOR_NAME}"));
    args.push(format!("--monitor-fd={MONITOR_FD}"));
    args.push("--json".to_string());
    args
}

/// Parse `osbuild 129` (or `osbuild 129.1`) into a semantic version.
pub fn parse_version(output: &str) -> Result<Version, EngineError> {
    let raw = output
        .split_whitespace()
        .last()
        .ok_or_else(|| EngineError::Version(output.to_string()))?;
    let normalized = match raw.matches('.').count() {
        0 => format!("{raw}.0.0"),
        1 => format!("{raw}.0"),
        _ => raw.to_string(),
    };
    Version::parse(&normalized).map_err(|_| EngineError::Version(output.to_string()))
}

/// Refuse engines older than [`MIN_ENGINE_VERSION`].
pub fn check_version(found: &Version) -> Result<(), EngineError> {
    let required = Version::new(MIN_ENGINE_VERSION, 0, 0);
    if *found < required {
        return Err(EngineError::TooOld {
            found: found.clone(),
            required,
        });
    }
    Ok(())
}

/// Ask `program` for its version and check it.
pub fn engine_version(program: &str) -> Result<Version, EngineError> {
    let output = Command::new(program)
        .arg("--version")
        .output()
        .map_err(|source| EngineError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(EngineError::Failed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    let version = parse_version(String::from_utf8_lossy(&output.stdout).trim())?;
    check_version(&version)?;
    debug!(%version, program, "engine version ok");
    Ok(version)
}

fn monitor_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe2 writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Build `manifest` with the engine, feeding every progress record to
/// `on_status`. Returns the engine's JSON result when it printed one.
pub fn run_build(
    program: &str,
    manifest: &[u8],
    options: &BuildOptions,
    mut on_status: impl FnMut(&Status),
) -> Result<Option<BuildResult>, EngineError> {
    engine_version(program)?;
    let (read_end, write_end) = monitor_pipe()?;
    let write_raw = write_end.as_raw_fd();

    let mut cmd = Command::new(program);
    cmd.args(build_args(options))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // SAFETY: only async-signal-safe libc calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if write_raw == MONITOR_FD {
                if libc::fcntl(write_raw, libc::F_SETFD, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(write_raw, MONITOR_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    info!(program, args = ?build_args(options), "starting build engine");
    let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
        program: program.to_string(),
        source,
    })?;
    drop(write_end);

    let pid = Pid::from_raw(child.id() as i32);
    if let Err(err) = ctrlc::set_handler(move || {
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            eprintln!("failed to stop build engine: {err}");
        }
    }) {
        warn!(%err, "cannot install interrupt handler");
    }

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("engine stdin not captured"))?;
    let manifest = manifest.to_vec();
    let writer = thread::spawn(move || stdin.write_all(&manifest));

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("engine stdout not captured"))?;
    let stdout_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).map(|_| buf)
    });
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("engine stderr not captured"))?;
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        stderr.read_to_string(&mut buf).map(|_| buf)
    });

    let mut scanner = StatusScanner::new(BufReader::new(File::from(read_end)));
    while let Some(status) = scanner.next_status()? {
        on_status(&status);
    }

    let exit = child.wait()?;
    let join_err = |what: &str| io::Error::other(format!("{what} thread panicked"));
    let written = writer.join().map_err(|_| join_err("stdin writer"))?;
    let stdout = stdout_reader.join().map_err(|_| join_err("stdout reader"))??;
    let stderr = stderr_reader.join().map_err(|_| join_err("stderr reader"))??;

    if !exit.success() {
        return Err(EngineError::Failed {
            status: exit.to_string(),
            stderr,
        });
    }
    written?;
    let result = match serde_json::from_slice::<BuildResult>(&stdout) {
        Ok(result) => Some(result),
        Err(_) => scanner.result().cloned(),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn args_follow_engine_conventions() {
        let options = BuildOptions {
            store: "/var/cache/store".into(),
            output_directory: "out".into(),
            exports: vec!["qcow2".into()],
            checkpoints: vec!["build".into()],
            cache_max_size: Some(20 * 1024 * 1024 * 1024),
        };
        let args = build_args(&options);
        assert_eq!(
            args,
            [
                "--store",
                "/var/cache/store",
                "--output-directory",
                "out",
                "--cache-max-size=21474836480",
                "-",
                "--export",
                "qcow2",
                "--checkpoint",
                "build",
                "--monitor=JSONSeqMonitor",
                "--monitor-fd=3",
                "--json"
            ]
        );
    }

    #[test]
    fn version_parsing_and_minimum() {
        assert_eq!(parse_version("osbuild 129").unwrap(), Version::new(129, 0, 0));
        assert_eq!(parse_version("osbuild 140.2").unwrap(), Version::new(140, 2, 0));
        assert!(parse_version("").is_err());
        assert!(parse_version("osbuild banana").is_err());
        assert!(check_version(&Version::new(129, 0, 0)).is_ok());
        let err = check_version(&Version::new(128, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("older than the required 129.0.0"));
    }

    #[test]
    #[serial]
    fn engine_env_overrides_default() {
        // SAFETY: serialized with the other environment tests.
        unsafe { env::set_var(ENGINE_ENV, "/opt/osbuild/bin/osbuild") };
        assert_eq!(engine_program(), "/opt/osbuild/bin/osbuild");
        unsafe { env::remove_var(ENGINE_ENV) };
        assert_eq!(engine_program(), DEFAULT_ENGINE);
    }

    #[test]
    fn missing_engine_is_a_spawn_error() {
        let err = engine_version("/nonexistent/imgforge-engine").unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
