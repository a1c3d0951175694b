//! Rotating batched writer assembly
//!
//! Composes a concrete [TargetWriter] (a local file here; object-store
//! writers implement the same trait externally) with a rotation policy
//! and an optional pruner. Rotation closes the old writer asynchronously
//! so compression and finalization never block the hot path; pruning runs
//! after the close completes, against files matching the same base name.
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use futures::future::BoxFuture;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, error, info, trace};

pub mod file;
pub mod prune;

pub use file::FileWriter;
pub use prune::Pruner;

use crate::Error;

/// Default timestamp pattern for rotated file names.
pub const DEFAULT_TIMESTAMP_PATTERN: &str = "%Y-%m-%d_%H";

/// Default zero-pad width of the collision counter.
pub const DEFAULT_COUNTER_WIDTH: usize = 3;

/// A writable rotation target. Exactly one writer exists per
/// `(stream, base-name)` tuple at a time; closing must persist or discard
/// every byte previously accepted.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// appends bytes to the target
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Error>;

    /// flushes and finalizes the target
    async fn close(&mut self) -> Result<(), Error>;

    /// path or name of the current target
    fn target(&self) -> &Path;

    /// target-specific rotation hint, e.g. a multipart upload approaching
    /// its part-count ceiling
    fn near_target_limit(&self) -> bool {
        false
    }
}

/// Factory opening a fresh target for each rotation generation.
pub type OpenFn =
    Arc<dyn Fn(PathBuf) -> BoxFuture<'static, Result<Box<dyn TargetWriter>, Error>> + Send + Sync>;

/// Thresholds deciding when the current target is retired.
#[derive(Clone, Debug, Default)]
pub struct RotationPolicy {
    /// rotate when the target reaches this many bytes
    pub max_size: Option<u64>,
    /// rotate when the target has been open this long
    pub max_age: Option<Duration>,
    /// rotate when the local clock passes this time of day
    pub daily_at: Option<NaiveTime>,
}

impl RotationPolicy {
    fn needs_rotate(
        &self,
        size: u64,
        created: Instant,
        daily_deadline: Option<DateTime<Local>>,
        target_hint: bool,
    ) -> bool {
        if target_hint {
            return true;
        }
        if let Some(max) = self.max_size {
            if size >= max {
                return true;
            }
        }
        if let Some(age) = self.max_age {
            if created.elapsed() >= age {
                return true;
            }
        }
        if let Some(deadline) = daily_deadline {
            if Local::now() >= deadline {
                return true;
            }
        }
        false
    }

    fn next_daily_deadline(&self) -> Option<DateTime<Local>> {
        let at = self.daily_at?;
        let now = Local::now();
        let today = now.date_naive().and_time(at);
        let candidate = Local.from_local_datetime(&today).single()?;
        if candidate > now {
            Some(candidate)
        } else {
            let tomorrow = now.date_naive().succ_opt()?.and_time(at);
            Local.from_local_datetime(&tomorrow).single()
        }
    }
}

/// Produces target names `<base>_<timestamp>[_<counter>][.ext]` with a
/// configurable chrono pattern; the zero-padded counter disambiguates
/// collisions within one timestamp window.
#[derive(Clone, Debug)]
pub struct FileNaming {
    base: PathBuf,
    stem: String,
    extension: Option<String>,
    /// chrono format string for the timestamp part
    pub timestamp_pattern: String,
    /// zero-pad width of the collision counter
    pub counter_width: usize,
}

impl FileNaming {
    /// Derives naming from the configured base path, splitting off the
    /// extension.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base: PathBuf = base.into();
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_string());
        let extension = base.extension().map(|e| e.to_string_lossy().into_owned());
        FileNaming {
            base,
            stem,
            extension,
            timestamp_pattern: DEFAULT_TIMESTAMP_PATTERN.to_string(),
            counter_width: DEFAULT_COUNTER_WIDTH,
        }
    }

    /// Directory rotated files are written to.
    pub fn directory(&self) -> PathBuf {
        self.base
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Name prefix identifying files belonging to this logical target.
    pub fn prefix(&self) -> &str {
        &self.stem
    }

    fn candidate(&self, timestamp: &str, counter: Option<u64>) -> PathBuf {
        let mut name = format!("{}_{timestamp}", self.stem);
        if let Some(n) = counter {
            name.push_str(&format!("_{n:0width$}", width = self.counter_width));
        }
        if let Some(ext) = &self.extension {
            name.push('.');
            name.push_str(ext);
        }
        self.directory().join(name)
    }

    /// First path for the current timestamp that does not collide with an
    /// existing file (including already-compressed generations).
    pub fn next_path(&self, now: DateTime<Local>) -> PathBuf {
        let timestamp = now.format(&self.timestamp_pattern).to_string();
        let plain = self.candidate(&timestamp, None);
        if !occupied(&plain) {
            return plain;
        }
        let mut counter = 1;
        loop {
            let path = self.candidate(&timestamp, Some(counter));
            if !occupied(&path) {
                return path;
            }
            counter += 1;
        }
    }
}

fn occupied(path: &Path) -> bool {
    if path.exists() {
        return true;
    }
    let mut gz = path.as_os_str().to_owned();
    gz.push(".gz");
    PathBuf::from(gz).exists()
}

struct ActiveTarget {
    writer: Box<dyn TargetWriter>,
    created: Instant,
    size: u64,
    daily_deadline: Option<DateTime<Local>>,
}

/// Writer with rotation, pruning and optional gzip compression of retired
/// targets.
pub struct RotatingWriter {
    opener: OpenFn,
    naming: FileNaming,
    policy: RotationPolicy,
    compress: bool,
    pruner: Option<Pruner>,
    current: Option<ActiveTarget>,
}

impl RotatingWriter {
    /// Creates an assembly writing local files.
    pub fn for_files(
        naming: FileNaming,
        policy: RotationPolicy,
        compress: bool,
        pruner: Option<Pruner>,
    ) -> Self {
        let opener: OpenFn = Arc::new(|path| {
            Box::pin(async move {
                let writer = FileWriter::open(path).await?;
                Ok(Box::new(writer) as Box<dyn TargetWriter>)
            })
        });
        RotatingWriter {
            opener,
            naming,
            policy,
            compress,
            pruner,
            current: None,
        }
    }

    /// Creates an assembly over a custom target opener.
    pub fn new(
        opener: OpenFn,
        naming: FileNaming,
        policy: RotationPolicy,
        compress: bool,
        pruner: Option<Pruner>,
    ) -> Self {
        RotatingWriter {
            opener,
            naming,
            policy,
            compress,
            pruner,
            current: None,
        }
    }

    /// Path of the currently open target, if any.
    pub fn current_target(&self) -> Option<&Path> {
        self.current.as_ref().map(|a| a.writer.target())
    }

    /// Bytes written to the current target.
    pub fn current_size(&self) -> u64 {
        self.current.as_ref().map(|a| a.size).unwrap_or(0)
    }

    async fn open_target(&mut self) -> Result<(), Error> {
        let path = self.naming.next_path(Local::now());
        trace!(target = format!("{}", path.display()), "opening target");
        let writer = (self.opener)(path).await?;
        self.current = Some(ActiveTarget {
            writer,
            created: Instant::now(),
            size: 0,
            daily_deadline: self.policy.next_daily_deadline(),
        });
        Ok(())
    }

    fn rotation_due(&self) -> bool {
        match &self.current {
            Some(active) => self.policy.needs_rotate(
                active.size,
                active.created,
                active.daily_deadline,
                active.writer.near_target_limit(),
            ),
            None => false,
        }
    }

    fn write_would_overflow(&self, incoming: usize) -> bool {
        match (&self.current, self.policy.max_size) {
            (Some(active), Some(max)) => {
                active.size > 0 && active.size + incoming as u64 > max
            }
            _ => false,
        }
    }

    /// Writes a buffer, rotating first when a policy threshold was crossed
    /// or the write would push the target past its size limit.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        if self.current.is_none() {
            self.open_target().await?;
        } else if self.rotation_due() || self.write_would_overflow(buf.len()) {
            self.rotate().await?;
        }
        let active = self
            .current
            .as_mut()
            .ok_or_else(|| Error::OutputError("no open target".into()))?;
        let written = active.writer.write(buf).await?;
        active.size += written as u64;
        Ok(())
    }

    /// Retires the current target. Close, compression and pruning run in a
    /// detached task so the write path never waits on them; pruning only
    /// starts after the close completed.
    pub async fn rotate(&mut self) -> Result<(), Error> {
        let retired = match self.current.take() {
            Some(active) => active,
            None => return Ok(()),
        };
        info!(
            target = format!("{}", retired.writer.target().display()),
            size = retired.size,
            "rotating target"
        );
        let compress = self.compress;
        let pruner = self.pruner.clone();
        let directory = self.naming.directory();
        let prefix = self.naming.prefix().to_string();
        let _ = tokio::spawn(async move {
            finalize_target(retired.writer, compress, pruner, directory, prefix).await;
        });

        self.open_target().await
    }

    /// Closes the assembly inline: the final target is finalized and
    /// pruned before this returns.
    pub async fn close(&mut self) -> Result<(), Error> {
        let retired = match self.current.take() {
            Some(active) => active,
            None => return Ok(()),
        };
        finalize_target(
            retired.writer,
            self.compress,
            self.pruner.clone(),
            self.naming.directory(),
            self.naming.prefix().to_string(),
        )
        .await;
        Ok(())
    }
}

async fn finalize_target(
    mut writer: Box<dyn TargetWriter>,
    compress: bool,
    pruner: Option<Pruner>,
    directory: PathBuf,
    prefix: String,
) {
    let path = writer.target().to_path_buf();
    if let Err(e) = writer.close().await {
        error!(
            target = format!("{}", path.display()),
            error = format!("{e}"),
            "close failed during rotation"
        );
        return;
    }

    if compress {
        let gz_path = path.clone();
        let compressed = tokio::task::spawn_blocking(move || gzip_file(&gz_path)).await;
        match compressed {
            Ok(Ok(())) => debug!(target = format!("{}", path.display()), "target compressed"),
            Ok(Err(e)) => error!(
                target = format!("{}", path.display()),
                error = format!("{e}"),
                "compression failed, keeping plain file"
            ),
            Err(e) => error!(error = format!("{e}"), "compression task failed"),
        }
    }

    if let Some(pruner) = pruner {
        match pruner.prune(&directory, &prefix) {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!(removed = removed.len(), prefix = prefix, "pruned old targets");
                }
            }
            Err(e) => error!(error = format!("{e}"), "pruning failed"),
        }
    }
}

/// Compresses `path` to `path.gz` and removes the original.
fn gzip_file(path: &Path) -> Result<(), Error> {
    let mut input =
        std::fs::File::open(path).map_err(|e| Error::OutputError(format!("{e}")))?;
    let mut gz_path = path.as_os_str().to_owned();
    gz_path.push(".gz");
    let output =
        std::fs::File::create(&gz_path).map_err(|e| Error::OutputError(format!("{e}")))?;
    let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input
            .read(&mut buf)
            .map_err(|e| Error::OutputError(format!("{e}")))?;
        if n == 0 {
            break;
        }
        encoder
            .write_all(&buf[..n])
            .map_err(|e| Error::OutputError(format!("{e}")))?;
    }
    let _ = encoder
        .finish()
        .map_err(|e| Error::OutputError(format!("{e}")))?;
    std::fs::remove_file(path).map_err(|e| Error::OutputError(format!("{e}")))?;
    Ok(())
}
