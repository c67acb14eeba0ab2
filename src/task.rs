use std::{
    fs::{self, read_to_string},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, IoContext},
    geom::{read_xyzs, Geom},
    Result,
};

/// every task directory name starts with this
pub const TASK_PREFIX: &str = "T_";

/// name of the task descriptor inside each task directory
pub const INFO_FILE: &str = "info.json";

/// name of the result artifact written next to the descriptor
pub const ENERGY_FILE: &str = "labels_01_energies.json";

/// present in a task directory while its calculations are running
pub const MARKER_FILE: &str = ".in_progress";

/// The descriptor stored as [INFO_FILE] in every task directory
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// the 1-based task id as a decimal string, without padding
    pub number: String,

    /// train or test split, if one has been assigned
    pub set: Option<String>,

    pub functional: String,

    pub basisset: String,

    /// the number of geometries sampled for the task
    pub num_molecules: usize,
}

impl TaskInfo {
    pub fn new(
        id: usize,
        functional: &str,
        basisset: &str,
        num_molecules: usize,
    ) -> Self {
        Self {
            number: id.to_string(),
            set: None,
            functional: functional.to_owned(),
            basisset: basisset.to_owned(),
            num_molecules,
        }
    }

    /// `functional###basisset`, used in directory and file names
    pub fn flavor(&self) -> String {
        format!("{}###{}", self.functional, self.basisset)
    }

    /// the name of the task directory for this task, with the id padded to
    /// `width` digits
    pub fn dir_name(&self, id: usize, width: usize) -> String {
        format!("{TASK_PREFIX}{id:0width$}_{}", self.flavor())
    }

    /// the name of the geometry file inside the task directory
    pub fn geom_file_name(&self) -> String {
        format!("data_01_{}.xyz", self.flavor())
    }
}

/// The lifecycle of a task as seen from the pending side. Done tasks live in a
/// separate root, so a [TaskDir] under the pending root is one of these two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    /// a previous run started this task and did not finish moving it
    InProgress,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Marker {
    pub started: String,
    pub pid: u32,
}

/// A task directory on disk
#[derive(Clone, Debug, PartialEq)]
pub struct TaskDir {
    pub path: PathBuf,
    pub id: usize,
}

impl TaskDir {
    /// wrap `path`, extracting the numeric id from a directory name like
    /// `T_007_pbe###def2-SVP`
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let id = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(parse_id)
            .ok_or_else(|| {
                Error::FatalConfig(format!(
                    "`{}` is not a task directory name",
                    path.display()
                ))
            })?;
        Ok(Self { path, id })
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }

    pub fn info(&self) -> Result<TaskInfo> {
        let path = self.path.join(INFO_FILE);
        let contents = read_to_string(&path).at(&path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::parse(&path, e.to_string()))
    }

    pub fn write_info(&self, info: &TaskInfo) -> Result<()> {
        let path = self.path.join(INFO_FILE);
        fs::write(&path, serde_json::to_string(info)?).at(&path)
    }

    /// the single `.xyz` file in the task directory. anything other than
    /// exactly one is a configuration error
    pub fn geom_file(&self) -> Result<PathBuf> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.path).at(&self.path)? {
            let path = entry.at(&self.path)?.path();
            if path.extension().is_some_and(|ext| ext == "xyz") {
                found.push(path);
            }
        }
        if found.len() != 1 {
            return Err(Error::FatalConfig(format!(
                "expected exactly one xyz file in {}, found {}",
                self.path.display(),
                found.len()
            )));
        }
        Ok(found.remove(0))
    }

    pub fn geoms(&self) -> Result<Vec<Geom>> {
        read_xyzs(self.geom_file()?)
    }

    pub fn energy_file(&self) -> PathBuf {
        self.path.join(ENERGY_FILE)
    }

    /// write `energies` as a JSON array, with missing entries as `null`
    pub fn write_energies(&self, energies: &[Option<f64>]) -> Result<()> {
        let path = self.energy_file();
        fs::write(&path, serde_json::to_string(energies)?).at(&path)
    }

    pub fn read_energies(&self) -> Result<Vec<Option<f64>>> {
        let path = self.energy_file();
        let contents = read_to_string(&path).at(&path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::parse(&path, e.to_string()))
    }

    fn marker_file(&self) -> PathBuf {
        self.path.join(MARKER_FILE)
    }

    pub fn state(&self) -> Lifecycle {
        if self.marker_file().exists() {
            Lifecycle::InProgress
        } else {
            Lifecycle::Pending
        }
    }

    /// record that this process has started working on the task
    pub fn mark_in_progress(&self) -> Result<()> {
        let marker = Marker {
            started: chrono::Local::now().to_rfc3339(),
            pid: std::process::id(),
        };
        let path = self.marker_file();
        fs::write(&path, serde_json::to_string(&marker)?).at(&path)
    }

    pub fn marker(&self) -> Result<Option<Marker>> {
        let path = self.marker_file();
        if !path.exists() {
            return Ok(None);
        }
        let contents = read_to_string(&path).at(&path)?;
        // an unreadable marker still marks the task as started
        Ok(Some(serde_json::from_str(&contents).unwrap_or(Marker {
            started: String::from("unknown"),
            pid: 0,
        })))
    }

    pub fn clear_marker(&self) -> Result<()> {
        remove_if_exists(&self.marker_file())
    }

    /// return an interrupted task to the plain pending state by removing any
    /// partial result and then the marker
    pub fn reset(&self) -> Result<()> {
        remove_if_exists(&self.energy_file())?;
        self.clear_marker()
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// extract the id from a task directory name
fn parse_id(name: &str) -> Option<usize> {
    name.strip_prefix(TASK_PREFIX)?
        .split('_')
        .next()?
        .parse()
        .ok()
}

/// find every task directory directly under `root`, sorted by id. entries
/// that are not directories or do not start with [TASK_PREFIX] are ignored
pub fn find_task_dirs(root: impl AsRef<Path>) -> Result<Vec<TaskDir>> {
    let root = root.as_ref();
    let mut ret = Vec::new();
    for entry in fs::read_dir(root).at(root)? {
        let path = entry.at(root)?.path();
        let is_task = path
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.starts_with(TASK_PREFIX));
        if is_task && path.is_dir() {
            ret.push(TaskDir::new(path)?);
        }
    }
    ret.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));
    Ok(ret)
}
