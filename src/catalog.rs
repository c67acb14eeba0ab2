//! Creation of the pending task catalog: one task directory for every
//! functional/basis set combination, each with its own random sample of the
//! geometry pool.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use rand::{seq::index, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, IoContext},
    geom::{read_xyzs, write_xyzs, Geom},
    task::{TaskDir, TaskInfo},
    Result,
};

/// name of the directory holding the task directories, both in the pending
/// and in the done output roots
pub const TASKS_DIR: &str = "tasks";

/// The contents of a flavor file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flavors {
    pub functionals: Vec<String>,
    pub basissets: Vec<String>,
}

impl Flavors {
    pub fn new(functionals: Vec<String>, basissets: Vec<String>) -> Self {
        Self {
            functionals,
            basissets,
        }
    }

    pub fn load(filename: impl AsRef<Path>) -> Result<Self> {
        let path = filename.as_ref();
        let contents = fs::read_to_string(path).at(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::parse(path, e.to_string()))
    }

    /// the number of tasks these flavors produce
    pub fn len(&self) -> usize {
        self.functionals.len() * self.basissets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// every (id, functional, basis set) combination. ids start at 1 and run
    /// functional-major: all basis sets of the first functional come first
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str, &str)> {
        self.functionals
            .iter()
            .flat_map(move |f| {
                self.basissets.iter().map(move |b| (f.as_str(), b.as_str()))
            })
            .enumerate()
            .map(|(i, (f, b))| (i + 1, f, b))
    }

    fn validate(&self) -> Result<()> {
        if self.functionals.is_empty() {
            return Err(Error::FatalConfig("no functionals given".to_owned()));
        }
        if self.basissets.is_empty() {
            return Err(Error::FatalConfig("no basis sets given".to_owned()));
        }
        for name in self.functionals.iter().chain(&self.basissets) {
            if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') {
                return Err(Error::FatalConfig(format!(
                    "`{name}` cannot be used in a task directory name"
                )));
            }
        }
        Ok(())
    }
}

/// the number of digits task ids are padded to for `n` tasks, ceil(log10(n))
pub fn id_width(n: usize) -> usize {
    let mut width = 0;
    let mut pow = 1usize;
    while pow < n {
        pow = pow.saturating_mul(10);
        width += 1;
    }
    width
}

/// A freshly created catalog
#[derive(Debug)]
pub struct Catalog {
    /// the directory containing the task directories
    pub root: PathBuf,

    /// the task directories, in id order
    pub tasks: Vec<TaskDir>,
}

/// Create the task catalog under `output_dir/tasks`. `output_dir` is removed
/// first if it already exists, so calling this twice with the same arguments
/// leaves a single catalog behind. Each task gets `num_molecules` geometries
/// sampled from `pool` without replacement, independently of every other
/// task. Pass a seeded `rng` for reproducible samples.
pub fn create<R: Rng + ?Sized>(
    flavors: &Flavors,
    pool: &[Geom],
    num_molecules: usize,
    output_dir: impl AsRef<Path>,
    rng: &mut R,
) -> Result<Catalog> {
    flavors.validate()?;
    if num_molecules == 0 {
        return Err(Error::FatalConfig(
            "the number of molecules per task must be positive".to_owned(),
        ));
    }
    if num_molecules > pool.len() {
        return Err(Error::FatalConfig(format!(
            "cannot sample {num_molecules} molecules from a pool of {}",
            pool.len()
        )));
    }

    let output_dir = output_dir.as_ref();
    if output_dir.exists() {
        info!("removing existing catalog at {}", output_dir.display());
        fs::remove_dir_all(output_dir).at(output_dir)?;
    }
    let root = output_dir.join(TASKS_DIR);
    fs::create_dir_all(&root).at(&root)?;

    let width = id_width(flavors.len());
    let mut tasks = Vec::with_capacity(flavors.len());
    for (id, functional, basis) in flavors.iter() {
        let info = TaskInfo::new(id, functional, basis, num_molecules);
        let task = TaskDir {
            path: root.join(info.dir_name(id, width)),
            id,
        };
        fs::create_dir(&task.path).at(&task.path)?;

        let sampled: Vec<Geom> = index::sample(rng, pool.len(), num_molecules)
            .into_iter()
            .map(|i| pool[i].clone())
            .collect();
        write_xyzs(task.path.join(info.geom_file_name()), &sampled)?;
        task.write_info(&info)?;
        debug!("created {}", task.name());
        tasks.push(task);
    }
    info!("created {} tasks in {}", tasks.len(), root.display());
    Ok(Catalog { root, tasks })
}

/// [create] with the flavors and geometry pool read from files
pub fn create_from_files<R: Rng + ?Sized>(
    flavor_file: impl AsRef<Path>,
    xyz_file: impl AsRef<Path>,
    num_molecules: usize,
    output_dir: impl AsRef<Path>,
    rng: &mut R,
) -> Result<Catalog> {
    let flavors = Flavors::load(flavor_file)?;
    let pool = read_xyzs(xyz_file)?;
    create(&flavors, &pool, num_molecules, output_dir, rng)
}
