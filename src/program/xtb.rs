use std::{fs, path::Path, sync::OnceLock};

use regex::Regex;

use crate::{
    geom::{xyz_string, Geom},
    settings::Settings,
};

use super::{
    command, in_scratch_dir, read_back, read_gradient, read_output,
    run_logged, Program, ProgramError, ProgramResult, HTOEV,
};

static CELL: OnceLock<[Regex; 2]> = OnceLock::new();

/// The semi-empirical [xtb](https://github.com/grimme-lab/xtb) program
#[derive(Clone, Copy, Debug, Default)]
pub struct Xtb;

impl Xtb {
    /// read the total energy from an xtb log file and convert it to eV. xtb
    /// prints the energy once per SCF, so the last one wins
    pub fn read_energy(log: &Path) -> Result<f64, ProgramError> {
        let contents = read_output(log)?;
        let outname = log.display().to_string();
        let [error_re, energy_re] = CELL.get_or_init(|| {
            [
                Regex::new(r"(?i)abnormal termination").unwrap(),
                Regex::new(r"\|\s*TOTAL ENERGY\s+(\S+)\s+Eh").unwrap(),
            ]
        });
        if error_re.is_match(&contents) {
            return Err(ProgramError::ErrorInOutput(outname));
        }
        let Some(caps) = energy_re.captures_iter(&contents).last() else {
            return Err(ProgramError::EnergyNotFound(outname));
        };
        match caps[1].parse::<f64>() {
            Ok(e) => Ok(e * HTOEV),
            Err(_) => Err(ProgramError::EnergyParseError(outname)),
        }
    }
}

impl Program for Xtb {
    fn name(&self) -> &str {
        "xtb"
    }

    /// writes `in.xyz`, runs `xtb in.xyz` in a scratch directory with the
    /// output going to `xtb.log`, and reads back the energy, the gradient if
    /// requested, and the geometry from `in.xyz`
    fn run(
        &self,
        _index: usize,
        geom: &Geom,
        settings: &Settings,
    ) -> Result<ProgramResult, ProgramError> {
        in_scratch_dir(settings, "xtb_tmpdir_", |dir| {
            let infile = dir.join("in.xyz");
            fs::write(&infile, xyz_string(geom))?;

            let mut cmd = command(&settings.xtb_cmd);
            cmd.arg("in.xyz")
                .current_dir(dir)
                .envs(settings.thread_env());
            if settings.gradient {
                cmd.arg("--grad");
            }
            if settings.charge != 0 {
                cmd.arg("--chrg").arg(settings.charge.to_string());
            }
            let log = dir.join("xtb.log");
            run_logged(&mut cmd, &log)?;

            let energy = Self::read_energy(&log)?;
            let gradient = if settings.gradient {
                Some(read_gradient(&dir.join("gradient"))?)
            } else {
                None
            };
            Ok(ProgramResult {
                energy: Some(energy),
                coords: Some(read_back(&infile)?),
                gradient,
                time: 0.0,
            })
        })
    }
}
