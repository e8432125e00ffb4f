//! Trash removal
//!
//! After a mirror run, everything under the destination that the run did
//! not produce or affirm is deleted. The run records its paths in a
//! [`PathLog`]; the file-backed [`FilePathLog`] variant with its chunked
//! external sort exists for operation under a strict memory budget.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

const SORT_CHUNK: usize = 55_555;
const SORT_RETRY_START: usize = 33_333;

/// The set of absolute paths the current run has produced or affirmed.
#[derive(Debug, Default)]
pub struct PathLog {
    paths: BTreeSet<PathBuf>,
}

impl PathLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: PathBuf) {
        self.paths.insert(path);
    }

    pub fn record_all<I: IntoIterator<Item = PathBuf>>(&mut self, paths: I) {
        self.paths.extend(paths);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Delete every file under `root` that the log does not list. Directories
/// are left in place.
pub fn remove_trash(log: &PathLog, root: &Path) -> Result<usize> {
    if !root.exists() {
        debug!("'{}' does not exist, nothing to clean", root.display());
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        let kind = entry.file_type();
        if !kind.is_file() && !kind.is_symlink() {
            continue;
        }
        if !log.contains(entry.path()) {
            info!("Removing obsolete '{}'", entry.path().display());
            std::fs::remove_file(entry.path())
                .with_context(|| format!("removing '{}'", entry.path().display()))?;
            removed += 1;
        }
    }
    info!("Trash cleanup finished, {} file(s) removed.", removed);

    Ok(removed)
}

/// File-backed path log for strict-memory operation: appended as plain
/// text, sorted and deduplicated externally before the diff.
pub struct FilePathLog {
    temp: NamedTempFile,
}

impl FilePathLog {
    pub fn new() -> Result<Self> {
        Ok(FilePathLog {
            temp: NamedTempFile::new()?,
        })
    }

    pub fn record(&mut self, path: &Path) -> Result<()> {
        writeln!(self.temp, "{}", path.display())?;

        Ok(())
    }

    /// Diff the recorded set against the files under `root` and delete the
    /// difference, using sorted merge over two external-sorted streams.
    pub fn remove_trash(mut self, root: &Path) -> Result<usize> {
        self.temp.flush()?;
        if !root.exists() {
            debug!("'{}' does not exist, nothing to clean", root.display());
            return Ok(0);
        }

        info!("Making current files list...");
        let mut current = NamedTempFile::new()?;
        for entry in WalkDir::new(root) {
            let entry = entry?;
            let kind = entry.file_type();
            if kind.is_file() || kind.is_symlink() {
                writeln!(current, "{}", entry.path().display())?;
            }
        }
        current.flush()?;

        let workdir = tempfile::tempdir()?;
        let should_sorted = workdir.path().join("should");
        let current_sorted = workdir.path().join("current");
        info!("Starting sorting legal files list...");
        external_sort_dedup(self.temp.path(), &should_sorted, SORT_CHUNK, SORT_RETRY_START)?;
        info!("Starting sorting current files list...");
        external_sort_dedup(current.path(), &current_sorted, SORT_CHUNK, SORT_RETRY_START)?;

        let mut should_lines = BufReader::new(File::open(&should_sorted)?).lines();
        let mut current_lines = BufReader::new(File::open(&current_sorted)?).lines();
        let mut should = should_lines.next().transpose()?;
        let mut on_disk = current_lines.next().transpose()?;
        let mut removed = 0;
        loop {
            match (&should, &on_disk) {
                (_, None) => break,
                (None, Some(path)) => {
                    removed += remove_one(Path::new(path))?;
                    on_disk = current_lines.next().transpose()?;
                }
                (Some(legal), Some(path)) => match legal.as_str().cmp(path.as_str()) {
                    std::cmp::Ordering::Equal => {
                        should = should_lines.next().transpose()?;
                        on_disk = current_lines.next().transpose()?;
                    }
                    // a recorded path missing from disk is not ours to fix
                    std::cmp::Ordering::Less => {
                        should = should_lines.next().transpose()?;
                    }
                    std::cmp::Ordering::Greater => {
                        removed += remove_one(Path::new(path))?;
                        on_disk = current_lines.next().transpose()?;
                    }
                },
            }
        }
        info!("Trash cleanup finished, {} file(s) removed.", removed);

        Ok(removed)
    }
}

fn remove_one(path: &Path) -> Result<usize> {
    info!("Removing obsolete '{}'", path.display());
    match std::fs::remove_file(path) {
        Ok(()) => Ok(1),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("'{}' is listed but does not exist", path.display());
            Ok(0)
        }
        Err(e) => Err(e).with_context(|| format!("removing '{}'", path.display())),
    }
}

/// Sort and deduplicate a line file with bounded memory: in-memory sorted
/// chunks, repeated with shifted chunk boundaries until a full pass
/// observes no adjacent out-of-order or duplicate lines.
pub fn external_sort_dedup(
    input: &Path,
    output: &Path,
    chunk: usize,
    retry_start: usize,
) -> Result<()> {
    let workdir = tempfile::tempdir()?;
    let mut source = input.to_path_buf();
    let mut start = 0usize;
    let mut size = chunk.max(1);
    let mut pass = 0usize;
    loop {
        debug!("sort iteration: chunk = {}, start = {}", size, start);
        let target = workdir.path().join(format!("pass-{}", pass));
        let converged = sort_pass(&source, &target, start, size)?;
        if converged {
            std::fs::copy(&target, output)
                .with_context(|| format!("writing '{}'", output.display()))?;
            return Ok(());
        }
        source = target;
        (start, size) = if start == 0 {
            (retry_start, retry_start.max(1) * 2)
        } else {
            (0, chunk.max(1))
        };
        pass += 1;
    }
}

/// One chunked pass. Returns true when the incoming stream was already
/// strictly increasing, which is the termination condition.
fn sort_pass(input: &Path, output: &Path, start: usize, chunk: usize) -> Result<bool> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("opening '{}'", input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("creating '{}'", output.display()))?,
    );
    let mut lines: Vec<String> = Vec::new();
    let mut previous: Option<String> = None;
    let mut converged = true;
    let mut catch_start = start > 0;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(prev) = &previous {
            if prev.as_str() >= line {
                converged = false;
            }
        }
        previous = Some(line.to_string());
        lines.push(line.to_string());
        let boundary = if catch_start { start } else { chunk };
        if lines.len() >= boundary {
            catch_start = false;
            flush_chunk(&mut lines, &mut writer)?;
        }
    }
    flush_chunk(&mut lines, &mut writer)?;
    writer.flush()?;

    Ok(converged)
}

fn flush_chunk(lines: &mut Vec<String>, writer: &mut impl Write) -> Result<()> {
    lines.sort();
    lines.dedup();
    for line in lines.drain(..) {
        writeln!(writer, "{}", line)?;
    }

    Ok(())
}
