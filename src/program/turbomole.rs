use std::{
    fs,
    io::Write,
    path::Path,
    process::Stdio,
    sync::OnceLock,
};

use regex::Regex;

use crate::{
    atom::Atom,
    geom::{xyz_string, Geom, ANG_TO_BOHR},
    settings::Settings,
};

use super::{
    command, in_scratch_dir, parse_fortran, read_gradient, read_output,
    run_logged, Program, ProgramError, ProgramResult, HTOEV,
};

static CELL: OnceLock<Regex> = OnceLock::new();

/// DFT calculations with [Turbomole](https://www.turbomole.org). The input is
/// prepared with `x2t` and a scripted `define` session, and the energy comes
/// from `settings.turbomole_method`, usually `ridft`
#[derive(Clone, Copy, Debug, Default)]
pub struct Turbomole;

impl Turbomole {
    /// whether `settings` asks for the RI approximation
    fn uses_ri(settings: &Settings) -> bool {
        settings.turbomole_method.contains("ridft")
    }

    /// the answers fed to `define` on standard input: take the coordinates
    /// from `coord`, assign the basis set to every atom, start from an
    /// extended Hückel guess with the molecular charge, and switch on DFT
    /// with the requested functional
    pub fn define_input(settings: &Settings) -> String {
        let ri = if Self::uses_ri(settings) {
            "ri\non\n*\n"
        } else {
            ""
        };
        format!(
            "\n\na coord\n*\nno\nb all {}\n*\neht\n\n{}\ny\n\
             dft\non\nfunc {}\n*\n{ri}*\n",
            settings.turbomole_basis,
            settings.charge,
            settings.turbomole_functional,
        )
    }

    fn define(dir: &Path, settings: &Settings) -> Result<(), ProgramError> {
        let mut child = command(&settings.define_cmd)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(fs::File::create(dir.join("define.log"))?)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProgramError::ProcessFailed {
                cmd: settings.define_cmd.clone(),
                msg: e.to_string(),
            })?;
        // reap the child before reporting a failed write
        let written = match child.stdin.take() {
            Some(mut stdin) => {
                stdin.write_all(Self::define_input(settings).as_bytes())
            }
            None => Ok(()),
        };
        let output = child.wait_with_output()?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.contains("ended normally") {
            return Err(ProgramError::ProcessFailed {
                cmd: settings.define_cmd.clone(),
                msg: stderr.trim().to_string(),
            });
        }
        written?;
        Ok(())
    }

    /// insert `keyword` on its own line before the `$end` of the control file
    /// at `path`
    pub fn add_keyword(path: &Path, keyword: &str) -> Result<(), ProgramError> {
        let contents = read_output(path)?;
        let mut body = String::with_capacity(contents.len() + keyword.len());
        let mut inserted = false;
        for line in contents.lines() {
            if !inserted && line.trim() == "$end" {
                body.push_str(keyword);
                body.push('\n');
                inserted = true;
            }
            body.push_str(line);
            body.push('\n');
        }
        if !inserted {
            body.push_str(keyword);
            body.push_str("\n$end\n");
        }
        fs::write(path, body)?;
        Ok(())
    }

    /// fail if the program output at `path` reports an abnormal end
    fn check_output(path: &Path) -> Result<(), ProgramError> {
        let contents = read_output(path)?;
        let error_re = CELL.get_or_init(|| {
            Regex::new(r"(?i)(ended abnormally|did not converge)").unwrap()
        });
        if error_re.is_match(&contents) {
            return Err(ProgramError::ErrorInOutput(path.display().to_string()));
        }
        Ok(())
    }

    /// read the last SCF energy from a Turbomole `energy` file, in eV
    pub fn read_energy(path: &Path) -> Result<f64, ProgramError> {
        let contents = read_output(path)?;
        let outname = path.display().to_string();
        let mut energy = None;
        let mut in_block = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with("$energy") {
                in_block = true;
            } else if line.starts_with('$') {
                in_block = false;
            } else if in_block && !line.is_empty() {
                let Some(field) = line.split_whitespace().nth(1) else {
                    return Err(ProgramError::EnergyParseError(outname));
                };
                let Some(e) = parse_fortran(field) else {
                    return Err(ProgramError::EnergyParseError(outname));
                };
                energy = Some(e);
            }
        }
        match energy {
            Some(e) => Ok(e * HTOEV),
            None => Err(ProgramError::EnergyNotFound(outname)),
        }
    }

    /// read the `$coord` block of a Turbomole coord file, converting from
    /// bohr to Å
    pub fn read_coord(path: &Path) -> Result<Geom, ProgramError> {
        let contents = read_output(path)?;
        let bad = |msg: String| {
            ProgramError::GeomParseError(path.display().to_string(), msg)
        };
        let mut atoms = Vec::new();
        let mut in_block = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with("$coord") {
                in_block = true;
            } else if line.starts_with('$') {
                in_block = false;
            } else if in_block && !line.is_empty() {
                let fields: Vec<_> = line.split_whitespace().collect();
                if fields.len() < 4 {
                    return Err(bad(format!("bad coord line `{line}`")));
                }
                let mut coord = [0.0; 3];
                for (c, f) in coord.iter_mut().zip(&fields) {
                    *c = parse_fortran(f)
                        .ok_or_else(|| bad(format!("bad coordinate `{f}`")))?;
                }
                atoms.push(Atom::new(fields[3], coord[0], coord[1], coord[2]));
            }
        }
        if atoms.is_empty() {
            return Err(bad("no $coord block".to_owned()));
        }
        Ok(Geom::new(atoms).scaled(1.0 / ANG_TO_BOHR))
    }
}

impl Program for Turbomole {
    fn name(&self) -> &str {
        "turbomole"
    }

    fn run(
        &self,
        _index: usize,
        geom: &Geom,
        settings: &Settings,
    ) -> Result<ProgramResult, ProgramError> {
        in_scratch_dir(settings, "dft_tmpdir_", |dir| {
            fs::write(dir.join("in.xyz"), xyz_string(geom))?;

            let mut x2t = command(&settings.x2t_cmd);
            x2t.arg("in.xyz").current_dir(dir);
            run_logged(&mut x2t, &dir.join("coord"))?;

            Self::define(dir, settings)?;
            if settings.use_dispersions {
                Self::add_keyword(&dir.join("control"), "$disp3")?;
            }

            let log = dir.join("dft.out");
            let mut scf = command(&settings.turbomole_method);
            scf.current_dir(dir).envs(settings.thread_env());
            run_logged(&mut scf, &log)?;
            Self::check_output(&log)?;

            let gradient = if settings.gradient {
                let grad_cmd = if Self::uses_ri(settings) {
                    "rdgrad"
                } else {
                    "grad"
                };
                let log = dir.join("grad.out");
                let mut grad = command(grad_cmd);
                grad.current_dir(dir).envs(settings.thread_env());
                run_logged(&mut grad, &log)?;
                Self::check_output(&log)?;
                Some(read_gradient(&dir.join("gradient"))?)
            } else {
                None
            };

            Ok(ProgramResult {
                energy: Some(Self::read_energy(&dir.join("energy"))?),
                coords: Some(Self::read_coord(&dir.join("coord"))?),
                gradient,
                time: 0.0,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn fake(script: &str) -> String {
        let path: PathBuf =
            [env!("CARGO_MANIFEST_DIR"), "testfiles", "turbomole", script]
                .iter()
                .collect();
        format!("sh {}", path.display())
    }

    fn fake_settings(scratch: &Path) -> Settings {
        Settings {
            x2t_cmd: fake("fake_x2t.sh"),
            define_cmd: fake("fake_define.sh"),
            turbomole_method: fake("fake_ridft.sh"),
            scratch_dir: scratch.to_path_buf(),
            ..Settings::default()
        }
    }

    fn water() -> Geom {
        Geom::new(vec![
            Atom::new("O", 0.0, 0.0, -0.0657441568),
            Atom::new("H", 0.0, 0.7574590974, 0.5217905143),
            Atom::new("H", 0.0, -0.7574590974, 0.5217905143),
        ])
    }

    #[test]
    fn test_define_input() {
        let settings = Settings {
            turbomole_functional: "b3-lyp".to_owned(),
            turbomole_basis: "def2-SVP".to_owned(),
            ..Settings::default()
        };
        let got = Turbomole::define_input(&settings);
        let lines: Vec<_> = got.lines().collect();
        assert_eq!(
            lines,
            vec![
                "", "", "a coord", "*", "no", "b all def2-SVP", "*", "eht", "",
                "0", "y", "dft", "on", "func b3-lyp", "*", "ri", "on", "*",
                "*",
            ]
        );

        let settings = Settings {
            turbomole_method: "dscf".to_owned(),
            ..settings
        };
        assert!(!Turbomole::define_input(&settings).contains("\nri\n"));
    }

    #[test]
    fn test_read_energy() {
        let got =
            Turbomole::read_energy(Path::new("testfiles/turbomole/energy"))
                .unwrap();
        let want = -76.38049911021 * HTOEV;
        assert!((got - want).abs() < 1e-9);
    }

    #[test]
    fn test_read_coord() {
        let got =
            Turbomole::read_coord(Path::new("testfiles/turbomole/coord"))
                .unwrap();
        assert_eq!(got.labels().collect::<Vec<_>>(), vec!["O", "H", "H"]);
        assert!(got.max_deviation(&water()).unwrap() < 1e-9);
    }

    #[test]
    fn test_add_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let control = dir.path().join("control");
        fs::write(&control, "$title\n$dft\n   functional b3-lyp\n$end\n")
            .unwrap();
        Turbomole::add_keyword(&control, "$disp3").unwrap();
        assert_eq!(
            fs::read_to_string(&control).unwrap(),
            "$title\n$dft\n   functional b3-lyp\n$disp3\n$end\n"
        );

        fs::write(&control, "$title\n").unwrap();
        Turbomole::add_keyword(&control, "$disp3").unwrap();
        assert_eq!(
            fs::read_to_string(&control).unwrap(),
            "$title\n$disp3\n$end\n"
        );
    }

    #[test]
    fn test_check_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dft.out");
        fs::write(&out, " ridft ended normally\n").unwrap();
        assert!(Turbomole::check_output(&out).is_ok());
        fs::write(&out, " ridft ended abnormally\n").unwrap();
        assert!(Turbomole::check_output(&out).unwrap_err().is_error_in_output());
    }

    #[test]
    fn test_run_fake_turbomole() {
        let scratch = tempfile::tempdir().unwrap();
        let settings = Settings {
            use_dispersions: true,
            delete_calculation_dirs: false,
            ..fake_settings(scratch.path())
        };
        let got = Turbomole.run(0, &water(), &settings).unwrap();
        assert!((got.energy.unwrap() + 76.38049911021 * HTOEV).abs() < 1e-9);
        assert!(got.coords.unwrap().max_deviation(&water()).unwrap() < 1e-9);

        let entries: Vec<_> = fs::read_dir(scratch.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let control = fs::read_to_string(entries[0].join("control")).unwrap();
        assert!(control.contains("$disp3"));
        let define_in = fs::read_to_string(entries[0].join("define.in")).unwrap();
        assert!(define_in.contains("func bmk"));
        assert!(define_in.contains("b all 6-311++G**"));
    }

    #[test]
    fn test_run_failing_define() {
        let scratch = tempfile::tempdir().unwrap();
        let settings = Settings {
            define_cmd: fake("failing_define.sh"),
            ..fake_settings(scratch.path())
        };
        let got = Turbomole.run(0, &water(), &settings);
        assert!(matches!(got, Err(ProgramError::ProcessFailed { .. })));
        assert!(fs::read_dir(scratch.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_define_exits_without_reading() {
        let scratch = tempfile::tempdir().unwrap();
        let settings = fake_settings(scratch.path());
        let dir = scratch.path().join("calc");
        fs::create_dir(&dir).unwrap();
        for _ in 0..20 {
            let settings = Settings {
                define_cmd: fake("early_exit_define.sh"),
                ..settings.clone()
            };
            let got = Turbomole::define(&dir, &settings);
            match got {
                Err(ProgramError::ProcessFailed { msg, .. }) => {
                    assert!(msg.contains("ended abnormally"), "{msg}");
                }
                other => panic!("expected ProcessFailed, got {other:?}"),
            }
        }
    }
}
