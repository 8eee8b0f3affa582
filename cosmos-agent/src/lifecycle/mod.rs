//! The component lifecycle engine.
//!
//! Materializes component content on disk, launches & supervises processes,
//! and tears components down again. Program content is downloaded with a
//! streaming SHA-256 check and never touches its destination unless the hash
//! matches; archive extraction refuses any entry that would escape the
//! destination directory.

#[cfg(test)]
mod mod_test;

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::database::Database;
use crate::models::Component;
use crate::utils;

/// How long a stopping process is given before it is killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// How often a stopping process is polled for exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// The pause between stop & start during a restart.
const RESTART_DELAY: Duration = Duration::from_secs(1);
/// How often unmanaged script output is drained upstream.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);
/// The maximum bytes shipped per progress chunk.
const LOG_CHUNK_SIZE: usize = 4096;

/// A capability for streaming deployment progress upstream.
///
/// The lifecycle engine never talks to the control stream directly; the
/// session side implements this trait, which keeps the dependency one-way.
#[async_trait::async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Report a coarse progress update for a component operation.
    async fn report_progress(&self, component_name: &str, status: &str, message: &str);
    /// Ship a chunk of captured component output.
    async fn report_log_chunk(&self, component_name: &str, chunk: &str, offset: i64);
}

/// The component lifecycle engine for this host.
pub struct Lifecycle {
    /// The agent's local store.
    db: Database,
    /// Root of the agent's managed directories.
    data_dir: PathBuf,
    /// HTTP client used for content downloads.
    http: reqwest::Client,
    /// The progress reporter, wired in after session construction.
    reporter: RwLock<Option<Arc<dyn ProgressReporter>>>,
}

impl Lifecycle {
    /// Create a new instance.
    pub fn new(db: Database, data_dir: &str) -> Self {
        Self {
            db,
            data_dir: PathBuf::from(data_dir),
            http: reqwest::Client::new(),
            reporter: RwLock::new(None),
        }
    }

    /// Wire in the progress reporter capability.
    pub fn set_progress_reporter(&self, reporter: Arc<dyn ProgressReporter>) {
        *self.reporter.write().expect("reporter lock poisoned") = Some(reporter);
    }

    fn reporter(&self) -> Option<Arc<dyn ProgressReporter>> {
        self.reporter.read().expect("reporter lock poisoned").clone()
    }

    /// Deploy a program component: download, verify, extract & start.
    pub async fn deploy_program(&self, mut component: Component) -> Result<()> {
        tracing::info!(component = %component.name, "deploying program");
        let url = match component.content_url.clone().filter(|url| !url.is_empty()) {
            Some(url) => url,
            None => bail!("content_url is required for programs"),
        };

        let existing = self.db.get_component(&component.name).await?;
        if let Some(existing) = &existing {
            if existing.hash == component.hash {
                tracing::info!(component = %component.name, "component already deployed with same hash");
                return Ok(());
            }
        }

        let tmp = self.download(&url, &component.hash).await.context("download failed")?;

        let extract_dir = self.data_dir.join("programs").join(&component.name);
        tokio::fs::create_dir_all(&extract_dir)
            .await
            .context("failed to create extract directory")?;

        let encoding = component.content_url_encoding.clone().unwrap_or_default();
        let (dest, name) = (extract_dir.clone(), component.name.clone());
        let executable = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            extract_archive(tmp.path(), &dest, &encoding, &name).context("extraction failed")?;
            find_executable(&dest, &name).context("finding executable failed")
        })
        .await
        .map_err(|err| anyhow!("error joining extraction task: {}", err))??;
        component.executable = executable.to_string_lossy().to_string();

        if existing.is_some() {
            if let Err(err) = self.stop_component(&component.name).await {
                tracing::warn!(error = ?err, component = %component.name, "failed to stop old version");
            }
        }

        let name = component.name.clone();
        self.db.upsert_component(component).await.context("failed to save component")?;
        self.start_component(&name).await.context("failed to start component")?;

        tracing::info!(component = %name, "program deployed successfully");
        Ok(())
    }

    /// Deploy a script component: write it to disk, then supervise or run it
    /// once depending on the managed flag.
    pub async fn deploy_script(&self, mut component: Component) -> Result<()> {
        tracing::info!(component = %component.name, managed = component.managed, "deploying script");
        let content = match component.content.clone().filter(|content| !content.is_empty()) {
            Some(content) => content,
            None => bail!("content is required for scripts"),
        };

        let script_dir = self.data_dir.join("scripts");
        tokio::fs::create_dir_all(&script_dir).await.context("failed to create script directory")?;
        let script_path = script_dir.join(format!("{}.sh", component.name));
        tokio::fs::write(&script_path, content.as_bytes()).await.context("failed to write script")?;
        tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .await
            .context("failed to set script permissions")?;
        component.executable = script_path.to_string_lossy().to_string();

        let managed = component.managed;
        let name = component.name.clone();
        self.db.upsert_component(component.clone()).await.context("failed to save component")?;

        if managed {
            self.start_component(&name).await.context("failed to start script")?;
        } else {
            self.execute_unmanaged(&component).await.context("failed to execute unmanaged script")?;
        }

        tracing::info!(component = %name, "script deployed successfully");
        Ok(())
    }

    /// Execute an unmanaged script once, draining its output upstream while
    /// it runs.
    async fn execute_unmanaged(&self, component: &Component) -> Result<()> {
        let env = component.env_map()?;
        let args = component.args_vec()?;
        let log_path = self.log_path(&component.name);
        let log_file = self.open_log_file(&component.name)?;

        tracing::info!(component = %component.name, "executing unmanaged script");
        let mut child = spawn_process(&PathBuf::from(&component.executable), &args, &env, &self.data_dir, log_file)?;

        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.tick().await;
        let mut offset: i64 = 0;

        loop {
            tokio::select! {
                outcome = child.wait() => {
                    let (chunk, _) = read_log_tail(&log_path, offset);
                    if !chunk.is_empty() {
                        if let Some(reporter) = self.reporter() {
                            reporter.report_log_chunk(&component.name, &chunk, offset).await;
                        }
                    }
                    let exit = outcome.context("error waiting for script")?;
                    if !exit.success() {
                        bail!("script execution failed: {}", exit);
                    }
                    tracing::info!(component = %component.name, "unmanaged script executed successfully");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let (chunk, new_offset) = read_log_tail(&log_path, offset);
                    if !chunk.is_empty() {
                        if let Some(reporter) = self.reporter() {
                            reporter.report_log_chunk(&component.name, &chunk, offset).await;
                            reporter.report_progress(&component.name, "running", &format!("Output: {}", chunk)).await;
                        }
                        offset = new_offset;
                    }
                }
            }
        }
    }

    /// Start a component's process, a no-op when it is already alive.
    pub async fn start_component(&self, name: &str) -> Result<()> {
        let component = self.db.get_component(name).await?.ok_or_else(|| anyhow!("component not found: {}", name))?;
        let mut status = self.db.get_component_status(name).await?;
        if status.status == "running" && is_process_alive(status.pid) {
            tracing::info!(component = %name, "component already running");
            return Ok(());
        }

        let env = component.env_map().context("failed to get environment")?;
        let args = component.args_vec().context("failed to get args")?;
        let log_file = self.open_log_file(name)?;

        let executable = PathBuf::from(&component.executable);
        let workdir = executable.parent().map(Path::to_path_buf).unwrap_or_else(|| self.data_dir.clone());
        let child = match spawn_process(&executable, &args, &env, &workdir, log_file) {
            Ok(child) => child,
            Err(err) => {
                status.status = "failed".to_string();
                status.message = format!("Failed to start process: {}", err);
                status.last_checked_at = utils::now();
                self.db.upsert_component_status(status).await?;
                return Err(err);
            }
        };

        let pid = child.id().map(|pid| pid as i32).unwrap_or_default();
        let now = utils::now();
        status.status = "running".to_string();
        status.pid = pid;
        status.last_started_at = Some(now);
        status.last_checked_at = now;
        status.message = "Process started successfully".to_string();
        self.db.upsert_component_status(status).await.context("failed to update status")?;

        let (db, monitored) = (self.db.clone(), name.to_string());
        tokio::spawn(monitor_process(db, monitored, child));

        tracing::info!(component = %name, pid, "component started");
        Ok(())
    }

    /// Stop a component's process, escalating to a kill after the grace
    /// period.
    pub async fn stop_component(&self, name: &str) -> Result<()> {
        let mut status = self.db.get_component_status(name).await?;
        if status.status != "running" {
            return Ok(());
        }
        if !is_process_alive(status.pid) {
            status.status = "stopped".to_string();
            self.db.upsert_component_status(status).await?;
            return Ok(());
        }

        let pid = Pid::from_raw(status.pid);
        kill(pid, Signal::SIGTERM).context("failed to send SIGTERM")?;

        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        loop {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
            if !is_process_alive(status.pid) {
                status.status = "stopped".to_string();
                status.message = "Stopped gracefully".to_string();
                self.db.upsert_component_status(status).await?;
                tracing::info!(component = %name, "component stopped");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(component = %name, "process did not stop gracefully, sending SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
                status.status = "stopped".to_string();
                status.message = "Forcefully killed after timeout".to_string();
                self.db.upsert_component_status(status).await?;
                return Ok(());
            }
        }
    }

    /// Restart a component, bumping its restart counter.
    pub async fn restart_component(&self, name: &str) -> Result<()> {
        tracing::info!(component = %name, "restarting component");

        let mut status = self.db.get_component_status(name).await?;
        status.restart_count += 1;
        self.db.upsert_component_status(status).await?;

        if let Err(err) = self.stop_component(name).await {
            tracing::warn!(error = ?err, component = %name, "failed to stop component, continuing with start");
        }
        tokio::time::sleep(RESTART_DELAY).await;
        self.start_component(name).await
    }

    /// Stop a component, delete its materialized content & drop it from the
    /// store.
    pub async fn remove_component(&self, name: &str) -> Result<()> {
        tracing::info!(component = %name, "removing component");

        if let Err(err) = self.stop_component(name).await {
            tracing::warn!(error = ?err, component = %name, "failed to stop component");
        }

        if let Some(component) = self.db.get_component(name).await? {
            let executable = PathBuf::from(&component.executable);
            // Only paths inside the managed data dir are ever deleted.
            if executable.starts_with(self.data_dir.join("programs")) {
                let program_dir = self.data_dir.join("programs").join(name);
                if let Err(err) = tokio::fs::remove_dir_all(&program_dir).await {
                    tracing::warn!(error = ?err, component = %name, "failed to remove program directory");
                }
            } else if executable.starts_with(self.data_dir.join("scripts")) {
                if let Err(err) = tokio::fs::remove_file(&executable).await {
                    tracing::warn!(error = ?err, component = %name, "failed to remove script");
                }
            }
        }

        self.db.delete_component(name).await.context("failed to delete component from database")?;
        tracing::info!(component = %name, "component removed");
        Ok(())
    }

    /// Download the given URL to a temp file, verifying its SHA-256 as the
    /// bytes stream in. The temp file never survives a mismatch.
    async fn download(&self, url: &str, expected_hash: &str) -> Result<NamedTempFile> {
        tracing::info!(%url, "downloading file");
        let mut tmp = tempfile::Builder::new()
            .prefix("cosmos-download-")
            .tempfile()
            .context("failed to create temp file")?;

        let mut response = self.http.get(url).send().await.context("failed to download")?;
        if !response.status().is_success() {
            bail!("download failed with status: {}", response.status());
        }

        let mut hasher = Sha256::new();
        while let Some(chunk) = response.chunk().await.context("failed to read download stream")? {
            hasher.update(&chunk);
            tmp.as_file_mut().write_all(&chunk).context("failed to save file")?;
        }

        let actual = hex::encode(hasher.finalize());
        if actual != expected_hash {
            bail!("hash mismatch: expected {}, got {}", expected_hash, actual);
        }

        tracing::info!(hash = %actual, "file downloaded and verified");
        Ok(tmp)
    }

    /// The component's merged stdout+stderr log path.
    fn log_path(&self, name: &str) -> PathBuf {
        self.data_dir.join("logs").join(format!("{}.log", name))
    }

    /// Open the component's log file for appending, creating the logs dir as
    /// needed.
    fn open_log_file(&self, name: &str) -> Result<std::fs::File> {
        let log_dir = self.data_dir.join("logs");
        std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(name))
            .context("failed to open log file")
    }
}

/// A probe that never affects the target: signal 0 errors iff the process no
/// longer exists (or is not ours).
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Spawn a component process with merged output appended to its log file.
fn spawn_process(
    executable: &Path, args: &[String], env: &HashMap<String, String>, workdir: &Path, log_file: std::fs::File,
) -> Result<tokio::process::Child> {
    let stderr = log_file.try_clone().context("failed to clone log file handle")?;
    tokio::process::Command::new(executable)
        .args(args)
        .envs(env)
        .current_dir(workdir)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(stderr))
        .spawn()
        .context("failed to start process")
}

/// Watch a spawned child & record its exit in the store.
async fn monitor_process(db: Database, name: String, mut child: tokio::process::Child) {
    let outcome = child.wait().await;

    let mut status = match db.get_component_status(&name).await {
        Ok(status) => status,
        Err(err) => {
            tracing::warn!(error = ?err, component = %name, "failed to load status after process exit");
            return;
        }
    };
    status.status = "stopped".to_string();
    status.last_checked_at = utils::now();
    status.message = match &outcome {
        Ok(exit) if exit.success() => {
            tracing::info!(component = %name, "component process exited");
            "Process exited normally".to_string()
        }
        Ok(exit) => {
            tracing::warn!(component = %name, %exit, "component process exited with error");
            format!("Process exited with error: {}", exit)
        }
        Err(err) => {
            tracing::warn!(component = %name, error = ?err, "error waiting on component process");
            format!("Process exited with error: {}", err)
        }
    };
    if let Err(err) = db.upsert_component_status(status).await {
        tracing::warn!(error = ?err, component = %name, "failed to record process exit");
    }
}

/// Read new content from a log file starting at the given offset, bounded to
/// one chunk.
fn read_log_tail(path: &Path, offset: i64) -> (String, i64) {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return (String::new(), offset),
    };
    if file.seek(SeekFrom::Start(offset as u64)).is_err() {
        return (String::new(), offset);
    }

    let mut buf = vec![0u8; LOG_CHUNK_SIZE];
    let read = match file.read(&mut buf) {
        Ok(read) => read,
        Err(_) => return (String::new(), offset),
    };
    if read == 0 {
        return (String::new(), offset);
    }
    (String::from_utf8_lossy(&buf[..read]).to_string(), offset + read as i64)
}

/// Materialize downloaded content into the destination directory according
/// to its encoding.
fn extract_archive(src: &Path, dest: &Path, encoding: &str, component_name: &str) -> Result<()> {
    tracing::info!(src = %src.display(), dest = %dest.display(), %encoding, "extracting archive");
    match encoding {
        "tar.gz" | "tgz" => extract_tar_gz(src, dest),
        "zip" => extract_zip(src, dest),
        "plain" | "" => {
            let target = dest.join(component_name);
            std::fs::copy(src, &target).context("failed to place file")?;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).context("failed to set file permissions")?;
            Ok(())
        }
        other => bail!("unsupported encoding: {}", other),
    }
}

/// Join an archive entry path onto the destination, refusing anything that
/// would escape it.
fn safe_join(dest: &Path, entry: &Path) -> Result<PathBuf> {
    let escapes = entry.is_absolute() || entry.components().any(|component| matches!(component, PathComponent::ParentDir));
    if escapes {
        bail!("illegal file path: {}", entry.display());
    }
    Ok(dest.join(entry))
}

fn extract_tar_gz(src: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(src)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let target = safe_join(dest, &path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

fn extract_zip(src: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(src)?;
    let mut archive = zip::ZipArchive::new(file)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let path = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => bail!("illegal file path: {}", entry.name()),
        };
        let target = dest.join(path);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        if let Some(mode) = entry.unix_mode() {
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Locate the executable within an extracted tree.
///
/// An executable entry whose basename equals the component name wins;
/// otherwise the first executable found.
fn find_executable(dir: &Path, component_name: &str) -> Result<PathBuf> {
    let mut fallback = None;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                stack.push(path);
                continue;
            }
            if metadata.permissions().mode() & 0o111 != 0 {
                if path.file_name() == Some(std::ffi::OsStr::new(component_name)) {
                    return Ok(path);
                }
                if fallback.is_none() {
                    fallback = Some(path);
                }
            }
        }
    }
    fallback.ok_or_else(|| anyhow!("no executable found in {}", dir.display()))
}
