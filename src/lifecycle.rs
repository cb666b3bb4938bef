//! Per-core server process lifecycle management
//!
//! One `ServerLifecycleManager` exists per enabled core. It owns the mapping
//! from tunnel id to live server process, the per-tunnel rendered config
//! files under its config directory, and the per-tunnel log artifacts.
//!
//! Start enforces stop-before-start on the same tunnel id, so at most one
//! live process exists per (core, tunnel id). Liveness is always polled from
//! the OS; dead records are reaped lazily by `list_active` and nothing else.

use crate::core::{Core, ServerParams};
use crate::error::LifecycleError;
use crate::probe::{self, ProbeOutcome};
use crate::process::ProcessHandle;
use crate::render::{self, RenderedConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Characters of log tail attached to an early-exit error
const LOG_TAIL_CHARS: usize = 500;

/// Timing knobs for start/stop supervision.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Pause after spawn before the liveness re-check
    pub startup_settle: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub shutdown_grace: Duration,
    /// Connect timeout for the post-start reachability probe
    pub probe_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            startup_settle: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Where a core's server binary is found: an absolute primary path tried
/// first, then a bare name resolved through PATH.
#[derive(Debug, Clone)]
pub struct CoreBinary {
    pub primary: PathBuf,
    pub fallback: String,
}

impl CoreBinary {
    pub fn for_core(core: Core, bin_dir: &Path) -> Self {
        Self {
            primary: bin_dir.join(core.binary_name()),
            fallback: core.binary_name().to_string(),
        }
    }
}

/// One live server process for one tunnel.
struct ServerRecord {
    bind_addr: String,
    handle: ProcessHandle,
    started_at: Instant,
}

pub struct ServerLifecycleManager {
    core: Core,
    config_dir: PathBuf,
    binary: CoreBinary,
    settings: LifecycleSettings,
    /// Live server processes keyed by tunnel id
    servers: DashMap<String, Mutex<ServerRecord>>,
    /// Rendered config files tracked per tunnel id, kept separate from the
    /// record so stop can clear a stale file after the record is gone
    config_paths: DashMap<String, PathBuf>,
}

impl ServerLifecycleManager {
    /// Create a manager for `core` with its config directory under
    /// `data_dir`. The directory is created once here and lives as long as
    /// the process.
    pub fn new(
        core: Core,
        data_dir: &Path,
        binary: CoreBinary,
        settings: LifecycleSettings,
    ) -> anyhow::Result<Self> {
        let config_dir = data_dir.join(core.as_str());
        std::fs::create_dir_all(&config_dir)?;
        Ok(Self {
            core,
            config_dir,
            binary,
            settings,
            servers: DashMap::new(),
            config_paths: DashMap::new(),
        })
    }

    pub fn core(&self) -> Core {
        self.core
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Start the server process for `tunnel_id`. If one already exists it is
    /// stopped first; start is never additive.
    pub async fn start(
        &self,
        tunnel_id: &str,
        params: &ServerParams,
    ) -> Result<(), LifecycleError> {
        if params.core() != self.core {
            return Err(LifecycleError::Config {
                tunnel_id: tunnel_id.to_string(),
                reason: format!(
                    "{} params passed to the {} manager",
                    params.core(),
                    self.core
                ),
            });
        }

        if self.servers.contains_key(tunnel_id) {
            warn!(
                core = %self.core,
                tunnel_id,
                "server already exists, stopping it first"
            );
            self.stop(tunnel_id).await;
        }

        let rendered = render::render(tunnel_id, params)?;

        let config_path = self
            .config_dir
            .join(format!("{}.{}", tunnel_id, self.core.config_extension()));
        std::fs::write(&config_path, &rendered.text).map_err(|e| LifecycleError::Io {
            tunnel_id: tunnel_id.to_string(),
            source: e,
        })?;
        self.config_paths
            .insert(tunnel_id.to_string(), config_path.clone());

        let log_path = self
            .config_dir
            .join(format!("{}_{}.log", self.core, tunnel_id));
        let args = render::launch_args(self.core, &config_path);

        let handle = match self.spawn_server(
            &self.binary.primary,
            &args,
            &log_path,
            &config_path,
            &rendered,
            tunnel_id,
            false,
        ) {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    core = %self.core,
                    tunnel_id,
                    binary = %self.binary.primary.display(),
                    "primary binary not found, falling back to PATH lookup"
                );
                let fallback = Path::new(&self.binary.fallback).to_path_buf();
                match self.spawn_server(
                    &fallback,
                    &args,
                    &log_path,
                    &config_path,
                    &rendered,
                    tunnel_id,
                    true,
                ) {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.discard_config(tunnel_id);
                        return Err(LifecycleError::Spawn {
                            tunnel_id: tunnel_id.to_string(),
                            binary: self.binary.fallback.clone(),
                            source: e,
                        });
                    }
                }
            }
            Err(e) => {
                self.discard_config(tunnel_id);
                return Err(LifecycleError::Spawn {
                    tunnel_id: tunnel_id.to_string(),
                    binary: self.binary.primary.display().to_string(),
                    source: e,
                });
            }
        };

        let pid = handle.pid();
        self.servers.insert(
            tunnel_id.to_string(),
            Mutex::new(ServerRecord {
                bind_addr: rendered.bind_addr.clone(),
                handle,
                started_at: Instant::now(),
            }),
        );

        // Give the process a moment, then re-check: an immediate exit means a
        // bad config, a missing dependency, or a port clash
        tokio::time::sleep(self.settings.startup_settle).await;

        let early_exit = self
            .servers
            .get(tunnel_id)
            .and_then(|entry| entry.lock().handle.poll());
        if let Some(status) = early_exit {
            self.servers.remove(tunnel_id);
            self.discard_config(tunnel_id);
            let exit_code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| format!("{status}"));
            let err = LifecycleError::EarlyExit {
                core: self.core.as_str(),
                exit_code,
                log_tail: read_log_tail(&log_path, LOG_TAIL_CHARS),
            };
            error!(core = %self.core, tunnel_id, error = %err, "server exited during startup");
            return Err(err);
        }

        match probe::probe(&rendered.bind_addr, self.settings.probe_timeout).await {
            ProbeOutcome::Reachable => {
                debug!(
                    core = %self.core,
                    tunnel_id,
                    bind_addr = %rendered.bind_addr,
                    "server port accepting connections"
                );
            }
            ProbeOutcome::Unreachable => {
                warn!(
                    core = %self.core,
                    tunnel_id,
                    bind_addr = %rendered.bind_addr,
                    ?pid,
                    "server port not accepting connections yet, process is still running"
                );
            }
            ProbeOutcome::ProbeError => {
                warn!(
                    core = %self.core,
                    tunnel_id,
                    bind_addr = %rendered.bind_addr,
                    "could not verify server port"
                );
            }
        }

        info!(
            core = %self.core,
            tunnel_id,
            bind_addr = %rendered.bind_addr,
            ?pid,
            "server started"
        );
        Ok(())
    }

    fn spawn_server(
        &self,
        binary: &Path,
        args: &[String],
        log_path: &Path,
        config_path: &Path,
        rendered: &RenderedConfig,
        tunnel_id: &str,
        abbreviated: bool,
    ) -> std::io::Result<ProcessHandle> {
        let mut log = std::fs::File::create(log_path)?;
        if abbreviated {
            writeln!(
                log,
                "starting {} server (PATH binary) for tunnel {}",
                self.core, tunnel_id
            )?;
        } else {
            writeln!(log, "starting {} server for tunnel {}", self.core, tunnel_id)?;
            writeln!(log, "command: {} {}", binary.display(), args.join(" "))?;
            writeln!(log, "bind_addr: {}", rendered.bind_addr)?;
            writeln!(log, "config file: {}", config_path.display())?;
            writeln!(log, "config:\n{}", rendered.text)?;
        }
        log.flush()?;
        ProcessHandle::spawn(binary, args, &self.config_dir, log)
    }

    /// Stop the server for `tunnel_id`. Never fails; errors on this path are
    /// logged and absorbed. A stale rendered config tracked under the id is
    /// cleared even when no record exists.
    pub async fn stop(&self, tunnel_id: &str) {
        if let Some((_, record)) = self.servers.remove(tunnel_id) {
            let mut record = record.into_inner();
            record.handle.shutdown(self.settings.shutdown_grace).await;
            info!(
                core = %self.core,
                tunnel_id,
                uptime_secs = record.started_at.elapsed().as_secs(),
                "server stopped"
            );
            // record drop closes the log handle
        }
        self.discard_config(tunnel_id);
    }

    fn discard_config(&self, tunnel_id: &str) {
        if let Some((_, path)) = self.config_paths.remove(tunnel_id) {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(
                        core = %self.core,
                        tunnel_id,
                        path = %path.display(),
                        error = %e,
                        "failed to delete config file"
                    );
                }
            }
        }
    }

    /// Whether `tunnel_id` has a live server process right now. Always a
    /// fresh OS poll, never a cached flag.
    pub fn is_running(&self, tunnel_id: &str) -> bool {
        self.servers
            .get(tunnel_id)
            .map(|entry| entry.lock().handle.is_alive())
            .unwrap_or(false)
    }

    /// Tunnel ids with live server processes. Records whose process has
    /// exited are pruned here; this lazy reap is the only garbage collection
    /// for dead servers.
    pub fn list_active(&self) -> Vec<String> {
        let mut active = Vec::new();
        let mut dead = Vec::new();
        for entry in self.servers.iter() {
            if entry.value().lock().handle.is_alive() {
                active.push(entry.key().clone());
            } else {
                dead.push(entry.key().clone());
            }
        }
        for tunnel_id in dead {
            debug!(core = %self.core, tunnel_id = %tunnel_id, "pruning dead server record");
            self.servers.remove(&tunnel_id);
            self.config_paths.remove(&tunnel_id);
        }
        active
    }

    /// Stop every tracked tunnel; used at process shutdown.
    pub async fn cleanup_all(&self) {
        let tunnel_ids: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for tunnel_id in tunnel_ids {
            self.stop(&tunnel_id).await;
        }
    }

    pub fn bind_addr(&self, tunnel_id: &str) -> Option<String> {
        self.servers
            .get(tunnel_id)
            .map(|entry| entry.lock().bind_addr.clone())
    }
}

fn read_log_tail(path: &Path, max_chars: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let mut start = contents.len().saturating_sub(max_chars);
            while !contents.is_char_boundary(start) {
                start += 1;
            }
            contents[start..].to_string()
        }
        Err(e) => format!("could not read log: {e}"),
    }
}
