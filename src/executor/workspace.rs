//! Run workspace and artifact storage
//!
//! Layout under the state directory:
//!
//! - `<state>/<pipeline>/workspace/` - working tree shared by all runs
//! - `<state>/<pipeline>/runs/<number>-<id>/artifacts/` - archived files, write-once
//! - `<state>/<pipeline>/runs/<number>-<id>/result.json` - terminal run record

use crate::pipeline::{ArtifactReference, PipelineError, PipelineResult};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directories of a single run
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    /// Working tree commands run in
    workspace: PathBuf,

    /// `<state>/<pipeline>/runs`
    runs_dir: PathBuf,

    /// This run's directory
    run_dir: PathBuf,

    /// This run's artifact directory
    artifacts_dir: PathBuf,

    /// Sequential run number
    run_number: u64,
}

impl RunWorkspace {
    /// Creates the directories for a new run.
    ///
    /// `workspace` overrides the default working tree location. When
    /// `run_number` is absent the next number after the highest existing run
    /// is used.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if directories cannot be created
    pub fn prepare(
        state_dir: &Path,
        pipeline: &str,
        run_id: Uuid,
        run_number: Option<u64>,
        workspace: Option<PathBuf>,
    ) -> io::Result<Self> {
        let pipeline_dir = state_dir.join(pipeline);
        let runs_dir = pipeline_dir.join("runs");
        fs::create_dir_all(&runs_dir)?;

        let run_number = match run_number {
            Some(n) => n,
            None => next_run_number(&runs_dir)?,
        };
        let short_id: String = run_id.simple().to_string().chars().take(8).collect();
        let run_dir = runs_dir.join(format!("{run_number}-{short_id}"));
        let artifacts_dir = run_dir.join("artifacts");
        fs::create_dir_all(&artifacts_dir)?;

        let workspace = workspace.unwrap_or_else(|| pipeline_dir.join("workspace"));
        fs::create_dir_all(&workspace)?;

        Ok(Self {
            workspace,
            runs_dir,
            run_dir,
            artifacts_dir,
            run_number,
        })
    }

    /// Working tree path
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// This run's directory
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// This run's artifact directory
    #[must_use]
    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Sequential run number
    #[must_use]
    pub fn run_number(&self) -> u64 {
        self.run_number
    }

    /// Copies files matching `pattern` (relative to `base`) into the artifact
    /// directory, keeping their relative layout.
    ///
    /// Files already archived in this run are not overwritten. Returns the
    /// references in path order; an empty list when nothing matched.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] on copy failures and
    /// [`PipelineError::Validation`] for malformed patterns.
    pub fn archive(
        &self,
        base: &Path,
        pattern: &str,
        label: &str,
    ) -> Result<Vec<ArtifactReference>, PipelineError> {
        let files = glob_files(base, pattern)?;
        let mut archived = Vec::with_capacity(files.len());

        for file in files {
            let relative = file
                .strip_prefix(base)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(file.file_name().unwrap_or_default()));
            let dest = self.artifacts_dir.join(&relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }

            match OpenOptions::new().write(true).create_new(true).open(&dest) {
                Ok(mut out) => {
                    let mut input = File::open(&file)?;
                    io::copy(&mut input, &mut out)?;
                    tracing::debug!(source = %file.display(), dest = %dest.display(), "Archived file");
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(dest = %dest.display(), "Already archived in this run");
                }
                Err(e) => return Err(e.into()),
            }

            archived.push(ArtifactReference::new(dest, label));
        }

        Ok(archived)
    }

    /// Writes `result.json` into the run directory
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the file cannot be written
    pub fn write_result(&self, result: &PipelineResult) -> io::Result<PathBuf> {
        let path = self.run_dir.join("result.json");
        let json = serde_json::to_string_pretty(result).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Removes the oldest run directories so that at most `keep` remain.
    /// The current run is never removed.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the runs directory cannot be read or a
    /// run directory cannot be removed
    pub fn prune(&self, keep: usize) -> io::Result<Vec<PathBuf>> {
        let mut runs = list_runs(&self.runs_dir)?;
        runs.sort_by_key(|(number, _)| *number);

        let excess = runs.len().saturating_sub(keep.max(1));
        let mut removed = Vec::new();
        for (_, dir) in runs.into_iter().take(excess) {
            if dir == self.run_dir {
                continue;
            }
            fs::remove_dir_all(&dir)?;
            removed.push(dir);
        }

        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), keep, "Discarded old runs");
        }
        Ok(removed)
    }
}

/// Run directories with their numbers
fn list_runs(runs_dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let number = name
            .to_string_lossy()
            .split('-')
            .next()
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(number) = number {
            runs.push((number, entry.path()));
        }
    }
    Ok(runs)
}

/// One past the highest existing run number
fn next_run_number(runs_dir: &Path) -> io::Result<u64> {
    Ok(list_runs(runs_dir)?
        .into_iter()
        .map(|(number, _)| number)
        .max()
        .map_or(1, |n| n + 1))
}

/// Files (not directories) matching `pattern`, sorted. Relative patterns are
/// resolved against `base`.
///
/// # Errors
///
/// Returns [`PipelineError::Validation`] for malformed patterns.
pub fn glob_files(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base.join(pattern)
    };

    let paths = glob::glob(&full.to_string_lossy()).map_err(|e| {
        PipelineError::Validation(crate::pipeline::ValidationError::InvalidStep(format!(
            "invalid pattern '{pattern}': {e}"
        )))
    })?;

    let mut files: Vec<PathBuf> = paths
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn prepare(state: &TempDir, number: Option<u64>) -> RunWorkspace {
        RunWorkspace::prepare(state.path(), "shop-api", Uuid::new_v4(), number, None).unwrap()
    }

    #[test]
    fn test_prepare_layout_and_numbering() {
        let state = TempDir::new().unwrap();
        let first = prepare(&state, None);
        let second = prepare(&state, None);

        assert_eq!(first.run_number(), 1);
        assert_eq!(second.run_number(), 2);
        assert!(first.artifacts_dir().is_dir());
        assert!(first.workspace().ends_with("shop-api/workspace"));
        assert_ne!(first.run_dir(), second.run_dir());

        let explicit = prepare(&state, Some(41));
        assert_eq!(explicit.run_number(), 41);
        assert_eq!(prepare(&state, None).run_number(), 42);
    }

    #[test]
    fn test_archive_copies_with_layout() {
        let state = TempDir::new().unwrap();
        let run = prepare(&state, None);
        let reports = run.workspace().join("target/surefire-reports");
        fs::create_dir_all(&reports).unwrap();
        fs::write(reports.join("TEST-a.xml"), "<a/>").unwrap();
        fs::write(reports.join("TEST-b.xml"), "<b/>").unwrap();
        fs::write(reports.join("notes.txt"), "skip").unwrap();

        let archived = run
            .archive(run.workspace(), "target/surefire-reports/*.xml", "test-reports")
            .unwrap();

        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].label, "test-reports");
        let copied = run.artifacts_dir().join("target/surefire-reports/TEST-a.xml");
        assert_eq!(fs::read_to_string(copied).unwrap(), "<a/>");
    }

    #[test]
    fn test_archive_is_write_once() {
        let state = TempDir::new().unwrap();
        let run = prepare(&state, None);
        let report = run.workspace().join("report.html");
        fs::write(&report, "first").unwrap();
        run.archive(run.workspace(), "report.html", "zap").unwrap();

        fs::write(&report, "second").unwrap();
        let again = run.archive(run.workspace(), "report.html", "zap").unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(
            fs::read_to_string(run.artifacts_dir().join("report.html")).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_archive_no_match_is_empty() {
        let state = TempDir::new().unwrap();
        let run = prepare(&state, None);
        assert!(run.archive(run.workspace(), "*.json", "x").unwrap().is_empty());
        assert!(run.archive(run.workspace(), "[", "x").is_err());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let state = TempDir::new().unwrap();
        let runs: Vec<_> = (0..4).map(|_| prepare(&state, None)).collect();
        let current = &runs[3];

        let removed = current.prune(2).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!runs[0].run_dir().exists());
        assert!(!runs[1].run_dir().exists());
        assert!(runs[2].run_dir().exists());
        assert!(current.run_dir().exists());
    }

    #[test]
    fn test_write_result() {
        use crate::pipeline::{PipelineResult, PipelineStatus};
        let state = TempDir::new().unwrap();
        let run = prepare(&state, None);
        let result = PipelineResult {
            run_id: Uuid::new_v4(),
            pipeline: "shop-api".to_string(),
            run_number: run.run_number(),
            status: PipelineStatus::Success,
            failure: None,
            stages: Vec::new(),
            cleanup_artifacts: Vec::new(),
            cleanup_errors: Vec::new(),
            started_at: chrono::Utc::now(),
            duration: std::time::Duration::from_secs(1),
        };
        let path = run.write_result(&result).unwrap();
        let back: PipelineResult =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, result);
    }
}
