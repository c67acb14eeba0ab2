use std::{
    fs::{read_to_string, File},
    path::Path,
    process::{Command, Stdio},
    time::Instant,
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    geom::Geom,
    settings::{QmMethod, Settings},
};

pub mod turbomole;
pub mod xtb;

pub use turbomole::Turbomole;
pub use xtb::Xtb;

/// eV per hartree
pub const HTOEV: f64 = 27.211399;

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{cmd}` failed: {msg}")]
    ProcessFailed { cmd: String, msg: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("error in output file {0}")]
    ErrorInOutput(String),

    #[error("energy not found in {0}")]
    EnergyNotFound(String),

    #[error("failed to parse energy in {0}")]
    EnergyParseError(String),

    #[error("failed to parse geometry in {0}: {1}")]
    GeomParseError(String, String),
}

impl ProgramError {
    pub fn is_error_in_output(&self) -> bool {
        matches!(self, ProgramError::ErrorInOutput(_))
    }
}

/// The outcome of a single calculation. A failed calculation is represented
/// by [ProgramResult::default], with every field empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgramResult {
    /// total energy in eV
    pub energy: Option<f64>,

    /// the geometry the program actually used, read back from its own files
    pub coords: Option<Geom>,

    /// flattened Cartesian gradient in eV/Å
    pub gradient: Option<Vec<f64>>,

    /// wall time of the calculation in seconds
    pub time: f64,
}

/// An external quantum chemistry program that labels one geometry at a time.
/// Implementations only provide [Program::run]; callers use
/// [Program::compute], which never fails.
pub trait Program: Sync {
    fn name(&self) -> &str;

    /// run the calculation for job `index` on `geom`
    fn run(
        &self,
        index: usize,
        geom: &Geom,
        settings: &Settings,
    ) -> Result<ProgramResult, ProgramError>;

    /// run the calculation for job `index`, converting any failure into an
    /// empty [ProgramResult]
    fn compute(
        &self,
        index: usize,
        geom: &Geom,
        settings: &Settings,
    ) -> ProgramResult {
        debug!("calculating job {index} with {}", self.name());
        let now = Instant::now();
        let res = self.run(index, geom, settings);
        let time = now.elapsed().as_secs_f64();
        match res {
            Ok(res) => {
                debug!("job {index} finished with energy {:?}", res.energy);
                ProgramResult { time, ..res }
            }
            Err(e) => {
                warn!("job {index} failed with {e}");
                ProgramResult {
                    time,
                    ..Default::default()
                }
            }
        }
    }
}

/// the [Program] for `settings.qm_method`
pub fn from_settings(settings: &Settings) -> Box<dyn Program> {
    match settings.qm_method {
        QmMethod::Xtb => Box::new(Xtb),
        QmMethod::Dft => Box::new(Turbomole),
    }
}

/// run `f` inside a fresh, uniquely named directory under
/// `settings.scratch_dir`. the directory is removed afterwards unless
/// `settings.delete_calculation_dirs` is false
pub(crate) fn in_scratch_dir<T>(
    settings: &Settings,
    prefix: &str,
    f: impl FnOnce(&Path) -> Result<T, ProgramError>,
) -> Result<T, ProgramError> {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(&settings.scratch_dir)?;
    let res = f(dir.path());
    if settings.delete_calculation_dirs {
        if let Err(e) = dir.close() {
            warn!("failed to remove calculation directory: {e}");
        }
    } else {
        #[allow(deprecated)]
        let path = dir.into_path();
        debug!("keeping calculation directory {}", path.display());
    }
    res
}

/// build a [Command] from `s`, which may carry leading arguments after the
/// program name, like `mpirun -np 4 xtb`
pub(crate) fn command(s: &str) -> Command {
    let mut words = s.split_whitespace();
    let mut cmd = Command::new(words.next().unwrap_or_default());
    cmd.args(words);
    cmd
}

/// read back the XYZ file a program was given, which is what it actually
/// computed
pub(crate) fn read_back(path: &Path) -> Result<Geom, ProgramError> {
    read_output(path)?.parse::<Geom>().map_err(|e| {
        ProgramError::GeomParseError(path.display().to_string(), e.to_string())
    })
}

/// run `cmd` to completion with its standard output sent to `log`
pub(crate) fn run_logged(
    cmd: &mut Command,
    log: &Path,
) -> Result<(), ProgramError> {
    let name = cmd.get_program().to_string_lossy().to_string();
    let output = cmd
        .stdout(File::create(log)?)
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ProgramError::ProcessFailed {
            cmd: name.clone(),
            msg: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(ProgramError::ProcessFailed {
            cmd: name,
            msg: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// read the output file at `path`, reporting a missing file as
/// [ProgramError::FileNotFound]
pub(crate) fn read_output(path: &Path) -> Result<String, ProgramError> {
    read_to_string(path)
        .map_err(|_| ProgramError::FileNotFound(path.display().to_string()))
}

/// parse a `float` written by a Fortran program, which may use `D` as the
/// exponent marker
pub(crate) fn parse_fortran(s: &str) -> Option<f64> {
    s.replace('D', "E").replace('d', "E").parse().ok()
}

/// read the Cartesian gradient from a Turbomole-style `gradient` file, which
/// both xtb and Turbomole write. the file contains the geometry of the last
/// cycle as `x y z element` lines followed by one `gx gy gz` line per atom in
/// hartree/bohr. the result is converted to eV/Å
pub(crate) fn read_gradient(path: &Path) -> Result<Vec<f64>, ProgramError> {
    let contents = read_output(path)?;
    let mut grad = Vec::new();
    for line in contents.lines() {
        let fields: Vec<_> = line.split_whitespace().collect();
        if fields.first() == Some(&"cycle") {
            // only the last cycle matters in an optimization
            grad.clear();
        } else if fields.len() == 3 && !line.starts_with('$') {
            for f in fields {
                let Some(v) = parse_fortran(f) else {
                    return Err(ProgramError::GeomParseError(
                        path.display().to_string(),
                        format!("bad gradient entry `{f}`"),
                    ));
                };
                grad.push(v);
            }
        }
    }
    if grad.is_empty() {
        return Err(ProgramError::GeomParseError(
            path.display().to_string(),
            "no gradient entries".to_owned(),
        ));
    }
    Ok(grad
        .into_iter()
        .map(|g| g * HTOEV * crate::geom::ANG_TO_BOHR)
        .collect())
}
