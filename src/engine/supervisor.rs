//! Lifecycle management for the external aria2 process.
//!
//! The supervisor owns exactly one engine process at a time. On construction it
//! picks an idle loopback port, generates a random RPC secret, builds the
//! argument list and reserves a pair of numbered log files; `start` then spawns
//! the process with stdout and stderr redirected into those files.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, instrument, warn};

use super::EngineError;

/// Port aria2 listens on by convention; tried before any random port.
pub const DEFAULT_RPC_PORT: u16 = 6800;

/// Random port candidates are drawn from this range.
const RANDOM_PORT_MIN: u16 = 1025;
const RANDOM_PORT_MAX: u16 = 65535;

/// Bounded number of port candidates before giving up.
pub const MAX_PORT_ATTEMPTS: usize = 64;

/// Length of the generated RPC secret.
pub const SECRET_LEN: usize = 64;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Builds a `Command` that does not flash a console window on Windows.
fn std_command(program: impl AsRef<OsStr>) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Returns whether `port` is free on the loopback interface.
///
/// Port 0 is never considered idle. Ports at or below 1024 and above 65535
/// are a configuration error. Otherwise the port is idle iff a 1 second
/// connect to `127.0.0.1:port` fails.
///
/// # Errors
///
/// Returns [`EngineError::ReservedPort`] for out-of-range ports.
pub fn probe_port(port: u32) -> Result<bool, EngineError> {
    if port == 0 {
        return Ok(false);
    }
    let port = match u16::try_from(port) {
        Ok(port) if port > 1024 => port,
        _ => return Err(EngineError::ReservedPort(port)),
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    Ok(TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_err())
}

/// Generates a random alphanumeric RPC secret.
#[must_use]
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Engine launch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Executable to launch (`aria2c` by default, resolved through `PATH`).
    pub program: PathBuf,
    /// Default download directory handed to the engine.
    pub download_dir: PathBuf,
    /// Engine-side concurrent transfer cap.
    pub max_concurrent_downloads: usize,
    /// Directory holding the numbered stdout/stderr logs.
    pub log_dir: PathBuf,
    /// First port candidate.
    pub preferred_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("aria2c"),
            download_dir: PathBuf::from("data/download"),
            max_concurrent_downloads: 20,
            log_dir: PathBuf::from("data"),
            preferred_port: DEFAULT_RPC_PORT,
        }
    }
}

/// Builds the engine argument list.
#[must_use]
pub fn build_args(config: &EngineConfig, port: u16, secret: &str) -> Vec<String> {
    vec![
        "--disk-cache=32M".to_string(),
        format!("--dir={}", config.download_dir.display()),
        format!(
            "--max-concurrent-downloads={}",
            config.max_concurrent_downloads
        ),
        "--file-allocation=prealloc".to_string(),
        "--continue=false".to_string(),
        "--split=1".to_string(),
        "--timeout=10".to_string(),
        "--max-tries=5".to_string(),
        "--retry-wait=0".to_string(),
        "--enable-rpc=true".to_string(),
        "--rpc-allow-origin-all=true".to_string(),
        "--rpc-listen-all=false".to_string(),
        format!("--rpc-listen-port={port}"),
        format!("--rpc-secret={secret}"),
    ]
}

/// Picks `<dir>/aria2c-server.<n>.{stdout,stderr}.log` with the lowest `n`
/// for which neither file exists.
#[must_use]
pub fn next_log_paths(log_dir: &Path) -> (PathBuf, PathBuf) {
    let mut index = 0u32;
    loop {
        let stdout = log_dir.join(format!("aria2c-server.{index}.stdout.log"));
        let stderr = log_dir.join(format!("aria2c-server.{index}.stderr.log"));
        if !stdout.exists() && !stderr.exists() {
            return (stdout, stderr);
        }
        index += 1;
    }
}

fn choose_port(preferred: u16) -> Result<u16, EngineError> {
    let mut rng = rand::thread_rng();
    let mut candidate = preferred;
    for _ in 0..MAX_PORT_ATTEMPTS {
        if probe_port(u32::from(candidate))? {
            return Ok(candidate);
        }
        debug!(port = candidate, "port busy, trying another");
        candidate = rng.gen_range(RANDOM_PORT_MIN..=RANDOM_PORT_MAX);
    }
    Err(EngineError::NoIdlePort {
        attempts: MAX_PORT_ATTEMPTS,
    })
}

#[derive(Debug)]
struct LogSinks {
    _stdout: File,
    _stderr: File,
}

/// Owner of the engine process.
///
/// Dropping the supervisor stops the process.
#[derive(Debug)]
pub struct EngineSupervisor {
    config: EngineConfig,
    port: u16,
    secret: String,
    args: Vec<String>,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
    child: Option<Child>,
    sinks: Option<LogSinks>,
}

impl EngineSupervisor {
    /// Prepares a supervisor: picks a port, a secret and log paths.
    ///
    /// Nothing is spawned until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoIdlePort`] when every candidate is busy,
    /// [`EngineError::ReservedPort`] for a reserved preferred port, and
    /// [`EngineError::Log`] if the log directory cannot be created.
    #[instrument(skip(config), fields(program = %config.program.display()))]
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let port = choose_port(config.preferred_port)?;
        let secret = generate_secret();
        let args = build_args(&config, port, &secret);

        fs::create_dir_all(&config.log_dir).map_err(|source| EngineError::Log {
            path: config.log_dir.clone(),
            source,
        })?;
        let (stdout_log, stderr_log) = next_log_paths(&config.log_dir);

        info!(port, "download engine prepared");
        debug!(stdout = %stdout_log.display(), stderr = %stderr_log.display(), "engine log files");

        Ok(Self {
            config,
            port,
            secret,
            args,
            stdout_log,
            stderr_log,
            child: None,
            sinks: None,
        })
    }

    /// RPC listen port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// RPC secret (without the `token:` prefix).
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Base URL of the RPC endpoint, without the `/jsonrpc` path.
    #[must_use]
    pub fn rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Arguments passed to the engine.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Program and arguments joined by spaces, for logging.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.config.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// The `(stdout, stderr)` log paths.
    #[must_use]
    pub fn log_paths(&self) -> (&Path, &Path) {
        (&self.stdout_log, &self.stderr_log)
    }

    /// Process id of the running child, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Spawns the engine, stopping a previous instance first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Log`] if the log files cannot be recreated and
    /// [`EngineError::Spawn`] if the executable cannot be launched.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.restart()
    }

    /// Stops any running instance, truncates the logs and spawns a new process.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    #[instrument(skip(self), fields(port = self.port))]
    pub fn restart(&mut self) -> Result<(), EngineError> {
        self.stop();

        for path in [&self.stdout_log, &self.stderr_log] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(EngineError::Log {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }

        let stdout = self.open_log(&self.stdout_log)?;
        let stderr = self.open_log(&self.stderr_log)?;
        let stdout_handle = stdout.try_clone().map_err(|source| EngineError::Log {
            path: self.stdout_log.clone(),
            source,
        })?;
        let stderr_handle = stderr.try_clone().map_err(|source| EngineError::Log {
            path: self.stderr_log.clone(),
            source,
        })?;

        let child = std_command(&self.config.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_handle))
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.config.program.display().to_string(),
                source,
            })?;

        info!(pid = child.id(), "download engine started");
        self.child = Some(child);
        self.sinks = Some(LogSinks {
            _stdout: stdout,
            _stderr: stderr,
        });
        Ok(())
    }

    fn open_log(&self, path: &Path) -> Result<File, EngineError> {
        File::create(path).map_err(|source| EngineError::Log {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Kills the process if it is still running, reaps it and closes the log sinks.
    ///
    /// Calling `stop` without a running process is a no-op.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => debug!(%status, "engine already exited"),
            Ok(None) | Err(_) => {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "failed to kill engine");
                }
            }
        }
        if let Err(e) = child.wait() {
            warn!(error = %e, "failed to reap engine");
        }

        self.sinks = None;
        debug!("download engine stopped");
    }

    /// Returns true while the child exists and has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Respawns the engine if it is not running.
    ///
    /// Returns `true` when a (re)start happened.
    ///
    /// # Errors
    ///
    /// Propagates spawn failures from [`restart`](Self::restart).
    pub fn ensure_running(&mut self) -> Result<bool, EngineError> {
        if self.is_running() {
            return Ok(false);
        }

        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => warn!(%status, "download engine exited, restarting"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "download engine state unknown, restarting"),
            }
        }
        self.restart()?;
        Ok(true)
    }
}

impl Drop for EngineSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_probe_port_zero_is_not_idle() {
        assert!(!probe_port(0).unwrap());
    }

    #[test]
    fn test_probe_port_rejects_reserved_and_out_of_range() {
        assert!(matches!(probe_port(80), Err(EngineError::ReservedPort(80))));
        assert!(matches!(
            probe_port(1024),
            Err(EngineError::ReservedPort(1024))
        ));
        assert!(matches!(
            probe_port(65536),
            Err(EngineError::ReservedPort(65536))
        ));
    }

    #[test]
    fn test_probe_port_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!probe_port(u32::from(port)).unwrap());

        drop(listener);
        assert!(probe_port(u32::from(port)).unwrap());
    }

    #[test]
    fn test_generate_secret_is_alphanumeric() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_build_args_contains_rpc_settings() {
        let config = EngineConfig {
            download_dir: PathBuf::from("/srv/mirror"),
            max_concurrent_downloads: 7,
            ..EngineConfig::default()
        };
        let args = build_args(&config, 6801, "s3cret");

        assert_eq!(args.len(), 14);
        assert_eq!(args[0], "--disk-cache=32M");
        assert!(args.contains(&"--dir=/srv/mirror".to_string()));
        assert!(args.contains(&"--max-concurrent-downloads=7".to_string()));
        assert!(args.contains(&"--continue=false".to_string()));
        assert!(args.contains(&"--rpc-listen-all=false".to_string()));
        assert!(args.contains(&"--rpc-listen-port=6801".to_string()));
        assert_eq!(args[13], "--rpc-secret=s3cret");
    }

    #[test]
    fn test_next_log_paths_skips_existing_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (out0, err0) = next_log_paths(dir.path());
        assert!(out0.ends_with("aria2c-server.0.stdout.log"));
        assert!(err0.ends_with("aria2c-server.0.stderr.log"));

        File::create(&err0).unwrap();
        let (out1, _) = next_log_paths(dir.path());
        assert!(out1.ends_with("aria2c-server.1.stdout.log"));
    }

    #[test]
    fn test_new_avoids_busy_preferred_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();

        let supervisor = EngineSupervisor::new(EngineConfig {
            log_dir: dir.path().to_path_buf(),
            preferred_port: busy,
            ..EngineConfig::default()
        })
        .unwrap();

        assert_ne!(supervisor.port(), busy);
        assert!(supervisor.port() >= RANDOM_PORT_MIN);
        assert_eq!(supervisor.secret().len(), SECRET_LEN);
        assert_eq!(
            supervisor.rpc_url(),
            format!("http://127.0.0.1:{}", supervisor.port())
        );
    }

    #[test]
    fn test_command_line_joins_program_and_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = EngineSupervisor::new(EngineConfig {
            log_dir: dir.path().to_path_buf(),
            preferred_port: 0,
            ..EngineConfig::default()
        })
        .unwrap();

        let line = supervisor.command_line();
        assert!(line.starts_with("aria2c --disk-cache=32M "));
        assert!(line.ends_with(&format!("--rpc-secret={}", supervisor.secret())));
        assert!(!supervisor.is_running());
        supervisor.stop();
        supervisor.stop();
    }

    #[test]
    fn test_start_with_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = EngineSupervisor::new(EngineConfig {
            program: dir.path().join("no-such-engine"),
            log_dir: dir.path().to_path_buf(),
            preferred_port: 0,
            ..EngineConfig::default()
        })
        .unwrap();

        let err = supervisor.start().unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
        assert!(!supervisor.is_running());
    }

    #[cfg(unix)]
    fn fake_engine(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-aria2c");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_start_stop_lifecycle_with_fake_engine() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_engine(dir.path(), "echo \"$@\"\nexec sleep 30");
        let mut supervisor = EngineSupervisor::new(EngineConfig {
            program,
            log_dir: dir.path().to_path_buf(),
            preferred_port: 0,
            ..EngineConfig::default()
        })
        .unwrap();

        supervisor.start().unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.pid().is_some());

        supervisor.stop();
        assert!(!supervisor.is_running());
        supervisor.stop();

        let (stdout, stderr) = supervisor.log_paths();
        assert!(stdout.exists());
        assert!(stderr.exists());
        let logged = fs::read_to_string(stdout).unwrap();
        assert!(logged.contains("--enable-rpc=true"));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_running_respawns_exited_engine() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_engine(dir.path(), "exit 3");
        let mut supervisor = EngineSupervisor::new(EngineConfig {
            program,
            log_dir: dir.path().to_path_buf(),
            preferred_port: 0,
            ..EngineConfig::default()
        })
        .unwrap();

        supervisor.start().unwrap();
        let mut exited = false;
        for _ in 0..100 {
            if !supervisor.is_running() {
                exited = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(exited);

        assert!(supervisor.ensure_running().unwrap());
    }
}
