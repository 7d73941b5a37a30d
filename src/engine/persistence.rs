use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use uuid::Uuid;

use crate::Result;

/// What a rewrite does with one line of the live file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineAction {
    Keep,
    Drop,
    Replace(String),
}

/// Disk I/O for a single collection's record file.
///
/// The live file is never edited in place: appends go to its end, every other change
/// streams it into a scratch file that is renamed over it. None of these methods take
/// the collection lock; callers serialize them.
pub struct RecordFile {
    name: String,
    dir: PathBuf,
    path: PathBuf,
}

impl RecordFile {
    pub fn new<P: AsRef<Path>>(dir: P, name: &str) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            path: dir.join(name),
            name: name.to_string(),
            dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.path).await?)
    }

    /// Creates an empty live file if there is none yet.
    pub async fn ensure_exists(&self) -> Result<()> {
        if !fs::try_exists(&self.dir).await? {
            fs::create_dir_all(&self.dir).await?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path).await?;
        Ok(())
    }

    /// Copies the live file into a fresh scratch file.
    pub async fn snapshot(&self) -> Result<ScratchFile> {
        let scratch = ScratchFile::new(self.scratch_path());
        fs::copy(&self.path, scratch.path()).await?;
        debug!("Copied {:?} to {:?}", self.path, scratch.path());
        Ok(scratch)
    }

    pub async fn append(&self, lines: &[String]) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path).await?;
        let mut out = BufWriter::new(file);
        for line in lines {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        out.flush().await?;
        out.into_inner().sync_all().await?;
        Ok(())
    }

    /// Streams the live file through `action` into a scratch file and swaps it in.
    ///
    /// The rename is the only step that changes the live file, so a failure at any
    /// earlier point leaves it untouched. When no line changed the scratch file is
    /// discarded. Blank lines are dropped. Returns the number of changed lines.
    pub async fn rewrite<F>(&self, mut action: F) -> Result<usize>
    where
        F: FnMut(&str) -> Result<LineAction>,
    {
        let scratch = ScratchFile::new(self.scratch_path());
        let mut lines = BufReader::new(File::open(&self.path).await?).lines();
        let mut out = BufWriter::new(File::create(scratch.path()).await?);

        let mut changed = 0;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match action(&line)? {
                LineAction::Keep => write_line(&mut out, &line).await?,
                LineAction::Drop => changed += 1,
                LineAction::Replace(replacement) => {
                    write_line(&mut out, &replacement).await?;
                    changed += 1;
                }
            }
        }
        out.flush().await?;
        out.into_inner().sync_all().await?;

        if changed > 0 {
            scratch.promote(&self.path).await?;
            debug!("Rewrote {:?}: {} line(s) changed", self.path, changed);
        }
        Ok(changed)
    }

    /// Removes the live file. Returns false when there was none.
    pub async fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn scratch_path(&self) -> PathBuf {
        self.dir.join(format!("__{}_{}__", self.name, Uuid::new_v4().simple()))
    }
}

async fn write_line(out: &mut BufWriter<File>, line: &str) -> Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    Ok(())
}

/// A temporary file next to the live file, removed when dropped unless promoted.
pub struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces `target` with this file.
    pub async fn promote(mut self, target: &Path) -> Result<()> {
        fs::rename(&self.path, target).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not remove scratch file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Line reader over a scratch copy of a record file.
pub struct Snapshot {
    // Declared before the scratch file so the handle closes before the file is removed.
    lines: Lines<BufReader<File>>,
    _scratch: ScratchFile,
}

impl Snapshot {
    pub async fn open(scratch: ScratchFile) -> Result<Self> {
        let file = File::open(scratch.path()).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            _scratch: scratch,
        })
    }

    /// Next non-blank line, or `None` at the end of the copy.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        while let Some(line) = self.lines.next_line().await? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }
}
