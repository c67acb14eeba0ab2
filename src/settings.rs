use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{error::IoContext, task::TaskInfo, Result};

/// The external program used to label geometries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QmMethod {
    Xtb,
    #[default]
    Dft,
}

impl Display for QmMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QmMethod::Xtb => write!(f, "xtb"),
            QmMethod::Dft => write!(f, "dft"),
        }
    }
}

/// Process-wide calculation settings. These are built once, usually from
/// [Settings::default] or [Settings::load], and then passed by reference to
/// everything that needs them. Per-task variations are made with
/// [Settings::for_task], which returns a new value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub qm_method: QmMethod,

    /// include a D3 dispersion correction in DFT calculations
    pub use_dispersions: bool,

    /// the Turbomole program run for the energy, `ridft` or `dscf`
    pub turbomole_method: String,

    pub turbomole_functional: String,

    pub turbomole_basis: String,

    /// remove each per-calculation working directory after reading its
    /// results. setting this to false leaves them under `scratch_dir` for
    /// inspection
    pub delete_calculation_dirs: bool,

    /// request a gradient along with the energy
    pub gradient: bool,

    /// molecular charge passed to the external program
    pub charge: isize,

    /// forwarded to the external program as `OMP_NUM_THREADS`
    pub omp_threads: usize,

    /// forwarded to the external program as `MKL_NUM_THREADS`
    pub mkl_threads: usize,

    /// directory in which per-calculation working directories are created
    pub scratch_dir: PathBuf,

    pub xtb_cmd: String,

    pub x2t_cmd: String,

    pub define_cmd: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qm_method: QmMethod::Dft,
            use_dispersions: false,
            turbomole_method: "ridft".to_owned(),
            turbomole_functional: "bmk".to_owned(),
            turbomole_basis: "6-311++G**".to_owned(),
            delete_calculation_dirs: true,
            gradient: false,
            charge: 0,
            omp_threads: 10,
            mkl_threads: 10,
            scratch_dir: PathBuf::from("."),
            xtb_cmd: "xtb".to_owned(),
            x2t_cmd: "x2t".to_owned(),
            define_cmd: "define".to_owned(),
        }
    }
}

impl Settings {
    /// load settings from the JSON file at `filename`. fields missing from the
    /// file take their default values
    pub fn load(filename: impl AsRef<Path>) -> Result<Self> {
        let path = filename.as_ref();
        let contents = std::fs::read_to_string(path).at(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// return a copy of `self` with the functional and basis set replaced by
    /// those of `info`
    pub fn for_task(&self, info: &TaskInfo) -> Self {
        Self {
            turbomole_functional: info.functional.clone(),
            turbomole_basis: info.basisset.clone(),
            ..self.clone()
        }
    }

    /// the thread-count environment variables for the external program
    pub fn thread_env(&self) -> [(&'static str, String); 2] {
        [
            ("OMP_NUM_THREADS", self.omp_threads.to_string()),
            ("MKL_NUM_THREADS", self.mkl_threads.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"qm_method": "xtb", "omp_threads": 2, "use_dispersions": true}"#,
        )
        .unwrap();
        let got = Settings::load(&path).unwrap();
        let want = Settings {
            qm_method: QmMethod::Xtb,
            omp_threads: 2,
            use_dispersions: true,
            ..Settings::default()
        };
        assert_eq!(got, want);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert!(Settings::load(&path).is_err());
        std::fs::write(&path, r#"{"qm_method": "hf"}"#).unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_for_task() {
        let base = Settings::default();
        let info = TaskInfo::new(3, "pbe0", "def2-SVP", 5);
        let got = base.for_task(&info);
        assert_eq!(got.turbomole_functional, "pbe0");
        assert_eq!(got.turbomole_basis, "def2-SVP");
        assert_eq!(got.turbomole_method, base.turbomole_method);
        // the base value is untouched
        assert_eq!(base.turbomole_functional, "bmk");
    }

    #[test]
    fn test_defaults() {
        let got: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(got, Settings::default());
        assert_eq!(got.qm_method, QmMethod::Dft);
        assert_eq!(got.turbomole_method, "ridft");
        assert!(got.delete_calculation_dirs);
        assert!(!got.use_dispersions);
    }
}
