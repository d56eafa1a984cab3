// nllb_engine/manager.rs — NLLB server subprocess lifecycle
//
// Owns the long-lived inference server: spawns the interpreter with
// `--port P`, watches stdout for the MODEL_READY marker, keeps the port
// registry current, restarts on unexpected exit, and tears the process down
// with a grace period on stop. Only the manager touches the process handle;
// clients reach the server exclusively through its current port.

use crate::atoms::constants::{
    NLLB_READY_MARKER, NLLB_RESTART_DELAY_SECS, NLLB_STARTUP_TIMEOUT_SECS, NLLB_STOP_GRACE_SECS,
};
use crate::atoms::error::{CoreError, CoreResult};
use crate::engine::config::TranslationConfig;
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::nllb_engine::registry::PortRegistry;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubprocessOptions {
    pub interpreter: String,
    pub script_path: PathBuf,
    /// Used when the registry has no entry for the language pair.
    pub preferred_port: u16,
    pub registry_path: PathBuf,
    pub language_pair: String,
    /// Connect only; never spawn or kill anything.
    pub use_external_server: bool,
    pub startup_timeout: Duration,
}

impl SubprocessOptions {
    pub fn from_config(config: &TranslationConfig, language_pair: impl Into<String>) -> Self {
        SubprocessOptions {
            interpreter: config.nllb200.interpreter.clone(),
            script_path: config.nllb200.server_script_path.clone(),
            preferred_port: config.nllb200.server_port,
            registry_path: config.nllb200.port_registry_path.clone(),
            language_pair: language_pair.into(),
            use_external_server: config.use_external_server,
            startup_timeout: Duration::from_secs(NLLB_STARTUP_TIMEOUT_SECS),
        }
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

pub struct SubprocessManager {
    options: SubprocessOptions,
    port: Arc<AtomicU16>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    ready_tx: watch::Sender<bool>,
    events: Arc<EventBus>,
    stop_token: CancellationToken,
}

impl SubprocessManager {
    pub fn new(options: SubprocessOptions, events: Arc<EventBus>) -> Self {
        // Port discovery: a registry entry for our language pair wins over
        // the compile-time default.
        let registry = PortRegistry::load(&options.registry_path);
        let port = registry
            .port_for_pair(&options.language_pair)
            .unwrap_or(options.preferred_port);
        let (ready_tx, _) = watch::channel(false);

        SubprocessManager {
            port: Arc::new(AtomicU16::new(port)),
            options,
            child: tokio::sync::Mutex::new(None),
            ready_tx,
            events,
            stop_token: CancellationToken::new(),
        }
    }

    pub fn current_port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Shared port cell for the connection pool; updated on restarts.
    pub fn port_handle(&self) -> Arc<AtomicU16> {
        Arc::clone(&self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        self.options.startup_timeout
    }

    /// Launch the server (or, in external mode, just mark it reachable) and
    /// start the exit monitor.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.options.use_external_server {
            info!(
                "[nllb] external server mode, expecting a server on port {}",
                self.current_port()
            );
            let _ = self.ready_tx.send(true);
            return Ok(());
        }

        kill_stale_servers(&self.options.script_path);
        self.spawn_child().await?;

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.monitor().await });
        Ok(())
    }

    async fn spawn_child(&self) -> CoreResult<()> {
        let port = self.current_port();
        info!(
            "[nllb] spawning {} {} --port {}",
            self.options.interpreter,
            self.options.script_path.display(),
            port
        );

        let mut child = tokio::process::Command::new(&self.options.interpreter)
            .arg(&self.options.script_path)
            .arg("--port")
            .arg(port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CoreError::internal(format!(
                    "failed to spawn {} {}: {}",
                    self.options.interpreter,
                    self.options.script_path.display(),
                    e
                ))
            })?;

        // ── Stdout watcher: MODEL_READY marker ─────────────────────────
        if let Some(stdout) = child.stdout.take() {
            let ready_tx = self.ready_tx.clone();
            let events = Arc::clone(&self.events);
            let language_pair = self.options.language_pair.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains(NLLB_READY_MARKER) {
                        info!("[nllb] model ready on port {}", port);
                        let _ = ready_tx.send(true);
                        events.emit(EngineEvent::ServerReady {
                            port,
                            language_pair: language_pair.clone(),
                        });
                    } else {
                        debug!("[nllb:stdout] {}", line);
                    }
                }
            });
        }

        // ── Stderr drain ───────────────────────────────────────────────
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        debug!("[nllb:stderr] {}", trimmed);
                    }
                }
            });
        }

        // Publish the chosen port for other processes.
        let mut registry = PortRegistry::load(&self.options.registry_path);
        registry.record(port, &self.options.language_pair, child.id());
        if let Err(e) = registry.store(&self.options.registry_path) {
            warn!("[nllb] cannot persist port registry: {}", e);
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Poll for unexpected exits; respawn after a short delay unless the
    /// manager is stopping.
    async fn monitor(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop_token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            let exit_status = {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            *guard = None;
                            Some(status)
                        }
                        Ok(None) => None,
                        Err(e) => {
                            warn!("[nllb] try_wait failed: {}", e);
                            None
                        }
                    },
                    None => None,
                }
            };

            if let Some(status) = exit_status {
                warn!("[nllb] server exited with {:?}", status.code());
                let _ = self.ready_tx.send(false);
                self.events.emit(EngineEvent::ServerExited { exit_code: status.code() });

                if self.stop_token.is_cancelled() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(NLLB_RESTART_DELAY_SECS)).await;
                if let Err(e) = self.spawn_child().await {
                    error!("[nllb] restart failed: {}", e);
                }
            }
        }
    }

    /// Resolve once the model has loaded. Translate requests block on this
    /// until the marker is seen or the startup timeout elapses.
    pub async fn wait_ready(&self, deadline: Duration) -> CoreResult<()> {
        let mut rx = self.ready_tx.subscribe();
        let result = match tokio::time::timeout(deadline, rx.wait_for(|ready| *ready)).await {
            Err(_) => Err(CoreError::timeout(deadline)),
            Ok(Err(_)) => Err(CoreError::internal("subprocess manager dropped")),
            Ok(Ok(_)) => Ok(()),
        };
        result
    }

    /// Terminate, wait up to the grace period, kill if needed.
    pub async fn stop(&self) {
        self.stop_token.cancel();
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Some(pid) = child.id() {
                terminate(pid);
            }
            let grace = Duration::from_secs(NLLB_STOP_GRACE_SECS);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!("[nllb] server ignored terminate, killing");
                let _ = child.kill().await;
            }
        }
        *guard = None;
        let _ = self.ready_tx.send(false);

        if !self.options.use_external_server {
            let mut registry = PortRegistry::load(&self.options.registry_path);
            registry.remove(self.current_port());
            let _ = registry.store(&self.options.registry_path);
        }
        info!("[nllb] stopped");
    }
}

// ── Process helpers ────────────────────────────────────────────────────────

/// Best-effort kill of any prior server matching the script name — a crashed
/// host can leave one holding the port.
fn kill_stale_servers(script_path: &Path) {
    let Some(name) = script_path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("pkill")
            .args(["-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("wmic")
            .args([
                "process",
                "where",
                &format!("CommandLine like '%{}%'", name),
                "delete",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

/// Polite terminate; the caller escalates to a hard kill after the grace
/// period.
fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status();
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .status();
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path, script: &Path) -> SubprocessOptions {
        SubprocessOptions {
            interpreter: "sh".into(),
            script_path: script.to_path_buf(),
            preferred_port: 5999,
            registry_path: dir.join("ports.json"),
            language_pair: "ja-en".into(),
            use_external_server: false,
            startup_timeout: Duration::from_secs(5),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ready_marker_resolves_wait() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_server.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'MODEL_READY: loaded'\nsleep 30\n").unwrap();

        let manager = Arc::new(SubprocessManager::new(
            options(dir.path(), &script),
            Arc::new(EventBus::new()),
        ));
        manager.start().await.unwrap();
        manager.wait_ready(Duration::from_secs(5)).await.unwrap();

        // The chosen port was published to the registry.
        let registry = PortRegistry::load(&dir.path().join("ports.json"));
        assert_eq!(registry.port_for_pair("ja-en"), Some(5999));

        manager.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_ready_times_out_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("silent_server.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();

        let manager = Arc::new(SubprocessManager::new(
            options(dir.path(), &script),
            Arc::new(EventBus::new()),
        ));
        manager.start().await.unwrap();
        let err = manager.wait_ready(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_external_mode_is_ready_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), &dir.path().join("missing.sh"));
        opts.use_external_server = true;

        let manager = Arc::new(SubprocessManager::new(opts, Arc::new(EventBus::new())));
        manager.start().await.unwrap();
        manager.wait_ready(Duration::from_millis(100)).await.unwrap();
        assert!(manager.child.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_registry_port_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("ports.json");
        let mut registry = PortRegistry::default();
        registry.record(6100, "ja-en", None);
        registry.store(&registry_path).unwrap();

        let mut opts = options(dir.path(), &dir.path().join("srv.sh"));
        opts.registry_path = registry_path;
        let manager = Arc::new(SubprocessManager::new(opts, Arc::new(EventBus::new())));
        assert_eq!(manager.current_port(), 6100);
    }
}
