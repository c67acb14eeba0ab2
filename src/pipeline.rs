//! Processing of the pending task catalog. Each task moves through three
//! states: pending (under the pending root), in progress (still under the
//! pending root, with a marker file), and done (under the done root). A task
//! is only moved once its energies are on disk, so a restarted run can pick
//! up wherever the previous one stopped.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{info, warn};
use walkdir::WalkDir;

use crate::{
    error::{Error, IoContext},
    program::Program,
    queue::{check_workers, dispatch, energies},
    settings::Settings,
    task::{find_task_dirs, Lifecycle, TaskDir, TASK_PREFIX},
    Result,
};

/// suffix of the hidden directories used to stage a task that is copied
/// rather than renamed into the done root
const STAGING_SUFFIX: &str = ".partial";

/// Totals over one [Pipeline::run]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// tasks completed by this run
    pub tasks: usize,

    /// energies computed across those tasks
    pub energies: usize,

    /// geometries left without an energy
    pub missing: usize,
}

pub struct Pipeline {
    pending_root: PathBuf,
    done_root: PathBuf,
    workers: usize,
}

impl Pipeline {
    pub fn new(
        pending_root: impl Into<PathBuf>,
        done_root: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            pending_root: pending_root.into(),
            done_root: done_root.into(),
            workers,
        }
    }

    /// label every task under the pending root with `program` and move it to
    /// the done root. tasks are processed one at a time in id order, with the
    /// geometries of each task spread over the worker pool
    pub fn run<P: Program + ?Sized>(
        &self,
        program: &P,
        settings: &Settings,
    ) -> Result<RunSummary> {
        check_workers(self.workers)?;
        fs::create_dir_all(&self.done_root).at(&self.done_root)?;
        self.recover()?;

        let tasks = find_task_dirs(&self.pending_root)?;
        info!(
            "found {} pending tasks in {}, running {} on {} workers",
            tasks.len(),
            self.pending_root.display(),
            program.name(),
            self.workers
        );
        let mut summary = RunSummary::default();
        for task in &tasks {
            let energies = self.process(task, program, settings)?;
            let missing = energies.iter().filter(|e| e.is_none()).count();
            summary.tasks += 1;
            summary.energies += energies.len() - missing;
            summary.missing += missing;
        }
        info!(
            "finished {} tasks: {} energies, {} missing",
            summary.tasks, summary.energies, summary.missing
        );
        Ok(summary)
    }

    /// clean up after a run that was killed partway through
    fn recover(&self) -> Result<()> {
        // a copy into the done root that never got renamed into place, or a
        // copied task whose pending original was being removed
        remove_staging_dirs(&self.done_root)?;
        remove_staging_dirs(&self.pending_root)?;

        for task in find_task_dirs(&self.pending_root)? {
            if task.state() != Lifecycle::InProgress {
                continue;
            }
            let done = self.done_root.join(task.name());
            if done.exists() {
                // the copy across filesystems finished before the original
                // was removed
                warn!(
                    "task {} is already in {}, removing the pending copy",
                    task.name(),
                    self.done_root.display()
                );
                fs::remove_dir_all(&task.path).at(&task.path)?;
                continue;
            }
            let marker = task.marker()?;
            let (started, pid) =
                marker.map(|m| (m.started, m.pid)).unwrap_or_default();
            warn!(
                "task {} was interrupted (started {started} by pid {pid}), \
                 running it again",
                task.name()
            );
            task.reset()?;
        }

        // the move finished but the marker was not cleared
        for task in find_task_dirs(&self.done_root)? {
            if task.state() == Lifecycle::InProgress {
                task.clear_marker()?;
            }
        }
        Ok(())
    }

    fn process<P: Program + ?Sized>(
        &self,
        task: &TaskDir,
        program: &P,
        settings: &Settings,
    ) -> Result<Vec<Option<f64>>> {
        let dest = self.done_root.join(task.name());
        if dest.exists() {
            return Err(Error::FatalConfig(format!(
                "task {} is already done at {}",
                task.name(),
                dest.display()
            )));
        }

        task.mark_in_progress()?;
        let info = task.info()?;
        let geoms = task.geoms()?;
        if geoms.len() != info.num_molecules {
            warn!(
                "task {} lists {} molecules but its geometry file holds {}",
                task.name(),
                info.num_molecules,
                geoms.len()
            );
        }
        let settings = settings.for_task(&info);
        info!(
            "starting task {} with {} geometries",
            task.name(),
            geoms.len()
        );

        let results = dispatch(program, &geoms, &settings, self.workers)?;
        let energies = energies(&results);
        task.write_energies(&energies)?;

        let done = move_task(task, &self.done_root)?;
        done.clear_marker()?;
        info!("finished task {}", done.name());
        Ok(energies)
    }
}

/// the hidden name `task` is copied to or moved aside under while it changes
/// roots
fn staging_name(task: &TaskDir) -> String {
    format!(".{}{STAGING_SUFFIX}", task.name())
}

fn is_staging_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix('.'))
        .is_some_and(|s| {
            s.starts_with(TASK_PREFIX) && s.ends_with(STAGING_SUFFIX)
        })
}

fn remove_staging_dirs(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(root).at(root)? {
        let path = entry.at(root)?.path();
        if is_staging_dir(&path) {
            warn!("removing partial copy {}", path.display());
            fs::remove_dir_all(&path).at(&path)?;
        }
    }
    Ok(())
}

/// move `task` into `done_root`, keeping its name. a plain rename is used when
/// possible. across filesystems the task is copied under a hidden staging name
/// first, so the done root never shows a partially copied task
fn move_task(task: &TaskDir, done_root: &Path) -> Result<TaskDir> {
    let dest = done_root.join(task.name());
    match fs::rename(&task.path, &dest) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            copy_across(task, done_root)?;
        }
        Err(e) => return Err(Error::io(&task.path, e)),
    }
    Ok(TaskDir {
        path: dest,
        id: task.id,
    })
}

/// copy `task` into `done_root` and remove the original. the original is
/// renamed to a hidden name before removal so that a partially removed task
/// never looks pending
pub(crate) fn copy_across(task: &TaskDir, done_root: &Path) -> Result<()> {
    let dest = done_root.join(task.name());
    let staging = done_root.join(staging_name(task));
    if staging.exists() {
        fs::remove_dir_all(&staging).at(&staging)?;
    }
    copy_dir(&task.path, &staging)?;
    fs::rename(&staging, &dest).at(&dest)?;

    let aside = task.path.with_file_name(staging_name(task));
    fs::rename(&task.path, &aside).at(&task.path)?;
    fs::remove_dir_all(&aside).at(&aside)
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::io(path, e.into())
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).at(&target)?;
        } else {
            fs::copy(entry.path(), &target).at(&target)?;
        }
    }
    Ok(())
}
