//! Compress / extract the data directory through an external `tar` process.
//!
//! The worker never blocks on the child outright: each wait is raced against
//! the job's cancellation token and a poll ticker, so cancellation is noticed
//! within one poll interval and progress can be reported on every tick.
//! A cancelled child gets SIGTERM, then SIGKILL once the grace period runs out.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io::{self, ErrorKind};
use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::JobError;

/// How much captured output to keep in an error message.
const OUTPUT_TAIL_CHARS: usize = 512;

pub struct ArchiveEngine {
    /// Program followed by any leading arguments, e.g. `["tar"]`.
    command: Vec<String>,
    poll_interval: Duration,
    terminate_grace: Duration,
}

/// Reported on every poll tick while the archiver runs.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub elapsed: Duration,
    /// Size of the archive being written; 0 while extracting.
    pub bytes_written: u64,
}

enum Wake {
    Cancelled,
    Exited(io::Result<ExitStatus>),
    Tick,
}

impl ArchiveEngine {
    pub fn new(command: Vec<String>, poll_interval: Duration, terminate_grace: Duration) -> Self {
        Self {
            command,
            poll_interval,
            terminate_grace,
        }
    }

    /// Pack `source_dir` into `destination` as a gzip'd tarball containing
    /// only the directory's own name (no absolute host paths). Returns the
    /// archive size. Any failure or cancellation removes the partial file.
    pub async fn create<F>(
        &self,
        source_dir: &Path,
        destination: &Path,
        token: &CancellationToken,
        on_tick: F,
    ) -> Result<u64, JobError>
    where
        F: FnMut(Progress),
    {
        let (parent, dir_name) = split_dir(source_dir)?;

        let args: Vec<OsString> = vec![
            "-czf".into(),
            destination.as_os_str().to_owned(),
            "-C".into(),
            parent.as_os_str().to_owned(),
            dir_name,
        ];

        info!(source = %source_dir.display(), destination = %destination.display(), "Creating archive");

        if let Err(e) = self.run(args, Some(destination), token, on_tick).await {
            discard_partial(destination).await;
            return Err(e);
        }

        let size = tokio::fs::metadata(destination)
            .await
            .map_err(|e| {
                JobError::Archive(format!(
                    "Archive missing after compression: {}: {}",
                    destination.display(),
                    e
                ))
            })?
            .len();

        info!(destination = %destination.display(), size, "Archive created");
        Ok(size)
    }

    /// Unpack `archive` under `target_parent`.
    pub async fn extract<F>(
        &self,
        archive: &Path,
        target_parent: &Path,
        token: &CancellationToken,
        on_tick: F,
    ) -> Result<(), JobError>
    where
        F: FnMut(Progress),
    {
        let args: Vec<OsString> = vec![
            "-xzf".into(),
            archive.as_os_str().to_owned(),
            "-C".into(),
            target_parent.as_os_str().to_owned(),
        ];

        info!(archive = %archive.display(), target = %target_parent.display(), "Extracting archive");
        self.run(args, None, token, on_tick).await?;
        info!(archive = %archive.display(), "Archive extracted");
        Ok(())
    }

    /// Distinct top-level names in `archive` (`-tzf`), e.g. `["chaindata"]`.
    /// Entries that would land outside the extraction directory are skipped.
    pub async fn top_level_entries(
        &self,
        archive: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<String>, JobError> {
        let args: Vec<OsString> = vec!["-tzf".into(), archive.as_os_str().to_owned()];
        let listing = self.run(args, None, token, |_| {}).await?;

        let mut entries = BTreeSet::new();
        for line in String::from_utf8_lossy(&listing).lines() {
            let first = Path::new(line.trim())
                .components()
                .find(|c| !matches!(c, Component::CurDir));
            if let Some(Component::Normal(name)) = first {
                entries.insert(name.to_string_lossy().to_string());
            }
        }
        Ok(entries.into_iter().collect())
    }

    async fn run<F>(
        &self,
        args: Vec<OsString>,
        output_file: Option<&Path>,
        token: &CancellationToken,
        mut on_tick: F,
    ) -> Result<Vec<u8>, JobError>
    where
        F: FnMut(Progress),
    {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| JobError::Archive("Archive command is empty".into()))?;

        let mut child = Command::new(program)
            .args(leading)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::Archive(format!("Failed to spawn {}: {}", program, e)))?;

        debug!(program = %program, pid = ?child.id(), "Archive process started");

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        let status = loop {
            let wake = tokio::select! {
                biased;
                _ = token.cancelled() => Wake::Cancelled,
                status = child.wait() => Wake::Exited(status),
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => {
                    self.terminate(&mut child).await;
                    stdout.abort();
                    stderr.abort();
                    return Err(JobError::Cancelled);
                }
                Wake::Exited(status) => {
                    break status.map_err(|e| {
                        JobError::Archive(format!("Failed to wait for {}: {}", program, e))
                    })?;
                }
                Wake::Tick => {
                    let bytes_written = match output_file {
                        Some(path) => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
                        None => 0,
                    };
                    on_tick(Progress {
                        elapsed: started.elapsed(),
                        bytes_written,
                    });
                }
            }
        };

        if status.success() {
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Archive process finished");
            stderr.abort();
            return Ok(stdout.await.unwrap_or_default());
        }

        let mut output = stderr.await.unwrap_or_default();
        output.extend(stdout.await.unwrap_or_default());
        let tail = output_tail(&output);

        Err(JobError::Archive(if tail.is_empty() {
            format!("{} exited with {}", program, status)
        } else {
            format!("{} exited with {}: {}", program, status, tail)
        }))
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            info!(pid, "Terminating archive process");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }

        match timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Archive process exited after SIGTERM"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for terminated archive process"),
            Err(_) => {
                warn!(
                    grace_secs = self.terminate_grace.as_secs(),
                    "Archive process ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill archive process");
                }
            }
        }
    }
}

fn split_dir(dir: &Path) -> Result<(&Path, OsString), JobError> {
    match (dir.parent(), dir.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name.to_owned())),
        _ => Err(JobError::Archive(format!(
            "Cannot archive directory without a parent: {}",
            dir.display()
        ))),
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "Removed partial archive"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial archive"),
    }
}

fn output_tail(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let text = text.trim();
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn engine(command: Vec<String>) -> ArchiveEngine {
        ArchiveEngine::new(
            command,
            Duration::from_millis(50),
            Duration::from_millis(500),
        )
    }

    fn script(dir: &Path, body: &str) -> Vec<String> {
        let path = dir.join("fake-tar.sh");
        fs::write(&path, body).unwrap();
        vec!["sh".into(), path.to_string_lossy().to_string()]
    }

    #[test]
    fn output_tail_keeps_the_end() {
        let long = "x".repeat(600) + "the end";
        let tail = output_tail(long.as_bytes());
        assert_eq!(tail.chars().count(), OUTPUT_TAIL_CHARS);
        assert!(tail.ends_with("the end"));
        assert_eq!(output_tail(b"  short\n"), "short");
    }

    #[tokio::test]
    async fn create_then_extract_with_tar() {
        let temp = tempdir().unwrap();
        let data = temp.path().join("node").join("chain");
        fs::create_dir_all(data.join("db")).unwrap();
        fs::write(data.join("db/state"), b"state bytes").unwrap();
        let dest = temp.path().join("backup.tar.gz");

        let engine = engine(vec!["tar".into()]);
        let token = CancellationToken::new();
        let size = engine.create(&data, &dest, &token, |_| {}).await.unwrap();
        assert_eq!(size, fs::metadata(&dest).unwrap().len());

        let restore_root = temp.path().join("restored");
        fs::create_dir(&restore_root).unwrap();
        engine
            .extract(&dest, &restore_root, &token, |_| {})
            .await
            .unwrap();

        // Only the relative directory name is stored.
        assert_eq!(
            fs::read(restore_root.join("chain/db/state")).unwrap(),
            b"state bytes"
        );
    }

    #[tokio::test]
    async fn failed_create_removes_partial_and_reports_output() {
        let temp = tempdir().unwrap();
        let data = temp.path().join("chain");
        fs::create_dir(&data).unwrap();
        let dest = temp.path().join("out.tar.gz");

        let command = script(
            temp.path(),
            "echo partial > \"$2\"\necho 'tar: disk full' >&2\nexit 2\n",
        );
        let err = engine(command)
            .create(&data, &dest, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        match err {
            JobError::Archive(msg) => assert!(msg.contains("disk full"), "{msg}"),
            other => panic!("expected Archive error, got {other:?}"),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancellation_terminates_child_and_removes_partial() {
        let temp = tempdir().unwrap();
        let data = temp.path().join("chain");
        fs::create_dir(&data).unwrap();
        let dest = temp.path().join("out.tar.gz");

        let command = script(temp.path(), "echo partial > \"$2\"\nexec sleep 30\n");
        let engine = engine(command);
        let token = CancellationToken::new();

        let ticks = Arc::new(AtomicUsize::new(0));
        let canceller = {
            let token = token.clone();
            let dest = dest.clone();
            tokio::spawn(async move {
                while !dest.exists() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                token.cancel();
            })
        };

        let started = Instant::now();
        let counter = ticks.clone();
        let err = engine
            .create(&data, &dest, &token, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert!(!dest.exists());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn ticks_report_partial_archive_size() {
        let temp = tempdir().unwrap();
        let data = temp.path().join("chain");
        fs::create_dir(&data).unwrap();
        let dest = temp.path().join("out.tar.gz");

        let command = script(temp.path(), "echo partial > \"$2\"\nsleep 0.3\n");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();

        engine(command)
            .create(&data, &dest, &CancellationToken::new(), move |progress| {
                sink.lock().unwrap().push(progress.bytes_written);
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 2, "{seen:?}");
        assert!(seen.iter().any(|&bytes| bytes == "partial\n".len() as u64));
    }

    #[tokio::test]
    async fn lists_top_level_entries() {
        let temp = tempdir().unwrap();
        let data = temp.path().join("chain");
        fs::create_dir_all(data.join("db")).unwrap();
        fs::write(data.join("db/state"), b"state").unwrap();
        fs::write(data.join("CURRENT"), b"MANIFEST").unwrap();
        let dest = temp.path().join("backup.tar.gz");

        let engine = engine(vec!["tar".into()]);
        let token = CancellationToken::new();
        engine.create(&data, &dest, &token, |_| {}).await.unwrap();

        let entries = engine.top_level_entries(&dest, &token).await.unwrap();
        assert_eq!(entries, vec!["chain"]);
    }

    #[tokio::test]
    async fn listing_skips_parent_and_dot_prefixes() {
        let temp = tempdir().unwrap();
        let command = script(
            temp.path(),
            "printf './chain/\\n./chain/db\\n../escape\\n/abs/path\\nstray/x\\n'\n",
        );

        let entries = engine(command)
            .top_level_entries(&temp.path().join("any.tar.gz"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entries, vec!["chain", "stray"]);
    }

    #[tokio::test]
    async fn listing_corrupt_archive_fails() {
        let temp = tempdir().unwrap();
        let archive = temp.path().join("broken.tar.gz");
        fs::write(&archive, b"not gzip").unwrap();

        let err = engine(vec!["tar".into()])
            .top_level_entries(&archive, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Archive(_)));
    }

    #[tokio::test]
    async fn missing_program_is_archive_failure() {
        let temp = tempdir().unwrap();
        let data = temp.path().join("chain");
        fs::create_dir(&data).unwrap();

        let err = engine(vec!["/nonexistent/tar".into()])
            .create(
                &data,
                &temp.path().join("out.tar.gz"),
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Archive(_)));
    }
}
