use std::{fmt::Display, fs::read_to_string, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    atom::{Atom, ParseAtomError},
    error::{Error, IoContext},
    Result,
};

/// bohr per angstrom
pub const ANG_TO_BOHR: f64 = 1.889725989;

#[derive(Debug, Error, PartialEq)]
#[error("line {line}: {msg}")]
pub struct ParseGeomError {
    pub line: usize,
    pub msg: String,
}

impl ParseGeomError {
    fn new(line: usize, msg: impl Into<String>) -> Self {
        Self {
            line,
            msg: msg.into(),
        }
    }
}

/// A single molecule. The order of `atoms` is significant: results coming
/// back from a calculation are matched against their inputs atom by atom.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Geom {
    pub atoms: Vec<Atom>,
}

impl Geom {
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self { atoms }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.atoms.iter().map(|a| a.label.as_str())
    }

    /// the largest absolute coordinate difference between `self` and `other`
    /// along any axis of any atom. returns None if the two geometries do not
    /// describe the same atoms in the same order, since there is nothing
    /// meaningful to compare in that case
    pub fn max_deviation(&self, other: &Geom) -> Option<f64> {
        if self.len() != other.len() || !self.labels().eq(other.labels()) {
            return None;
        }
        Some(
            self.atoms
                .iter()
                .zip(&other.atoms)
                .map(|(a, b)| a.max_deviation(b))
                .fold(0.0, f64::max),
        )
    }

    /// return a copy of `self` with every coordinate multiplied by `factor`.
    /// see [ANG_TO_BOHR]
    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.atoms.iter().map(|a| a.scaled(factor)).collect())
    }
}

impl From<Vec<Atom>> for Geom {
    fn from(atoms: Vec<Atom>) -> Self {
        Self::new(atoms)
    }
}

impl Display for Geom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for atom in &self.atoms {
            writeln!(
                f,
                "{:5}{:15.10}{:15.10}{:15.10}",
                atom.label,
                atom.x(),
                atom.y(),
                atom.z(),
            )?
        }
        Ok(())
    }
}

impl FromStr for Geom {
    type Err = ParseGeomError;

    /// parse either a single XYZ record (atom count and comment line followed
    /// by atoms) or a bare list of atom lines
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut atoms = Vec::new();
        let mut skip = 0;
        for (i, line) in s.lines().enumerate() {
            let fields = line.split_whitespace().count();
            if skip > 0 {
                skip -= 1;
                continue;
            } else if fields == 0 {
                continue;
            } else if fields == 1 && atoms.is_empty() {
                // start of XYZ with comment line
                skip = 1;
                continue;
            }
            atoms.push(line.parse::<Atom>().map_err(|e: ParseAtomError| {
                ParseGeomError::new(i + 1, e.to_string())
            })?);
        }
        Ok(Geom::new(atoms))
    }
}

/// Parse a multi-record XYZ string. Each record is an atom count line, one
/// (possibly blank) comment line, and then that many atom lines. Blank lines
/// between records are skipped.
pub fn parse_xyzs(s: &str) -> std::result::Result<Vec<Geom>, ParseGeomError> {
    let mut ret = Vec::new();
    let mut lines = s.lines().enumerate();
    while let Some((i, line)) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let natoms: usize = line.parse().map_err(|_| {
            ParseGeomError::new(
                i + 1,
                format!("expected an atom count, found `{line}`"),
            )
        })?;
        if lines.next().is_none() {
            return Err(ParseGeomError::new(i + 2, "missing comment line"));
        }
        let mut atoms = Vec::with_capacity(natoms);
        for _ in 0..natoms {
            let Some((j, line)) = lines.next() else {
                return Err(ParseGeomError::new(
                    i + 1,
                    format!(
                        "truncated record: expected {natoms} atoms, found {}",
                        atoms.len()
                    ),
                ));
            };
            let atom = line.parse::<Atom>().map_err(|e: ParseAtomError| {
                ParseGeomError::new(j + 1, e.to_string())
            })?;
            atoms.push(atom);
        }
        ret.push(Geom::new(atoms));
    }
    Ok(ret)
}

/// read every geometry in the multi-record XYZ file at `path`
pub fn read_xyzs(path: impl AsRef<Path>) -> Result<Vec<Geom>> {
    let path = path.as_ref();
    let contents = read_to_string(path).at(path)?;
    parse_xyzs(&contents).map_err(|e| Error::parse(path, e.to_string()))
}

/// read the single geometry in the XYZ file at `path`
pub fn read_xyz(path: impl AsRef<Path>) -> Result<Geom> {
    let path = path.as_ref();
    let mut geoms = read_xyzs(path)?;
    match geoms.len() {
        1 => Ok(geoms.remove(0)),
        n => Err(Error::parse(
            path,
            format!("expected exactly one geometry, found {n}"),
        )),
    }
}

/// format `geom` as the atom lines of an XYZ record
pub fn geom_string(geom: &Geom) -> String {
    use std::fmt::Write;
    let mut ret = String::with_capacity(50 * geom.len());
    for g in &geom.atoms {
        writeln!(ret, "{} {:.10} {:.10} {:.10}", g.label, g.x(), g.y(), g.z())
            .unwrap();
    }
    ret
}

/// format `geoms` as a multi-record XYZ string, using `comments[i]` as the
/// comment line of record `i`
fn xyzs_string<'a>(
    geoms: &[Geom],
    comments: impl IntoIterator<Item = &'a str>,
) -> String {
    let mut comments = comments.into_iter();
    let mut ret = String::new();
    for geom in geoms {
        ret.push_str(&format!(
            "{}\n{}\n",
            geom.len(),
            comments.next().unwrap_or("")
        ));
        ret.push_str(&geom_string(geom));
    }
    ret
}

/// format `geom` as a complete single-record XYZ string
pub fn xyz_string(geom: &Geom) -> String {
    xyzs_string(std::slice::from_ref(geom), std::iter::empty())
}

pub fn write_xyz(path: impl AsRef<Path>, geom: &Geom) -> Result<()> {
    write_xyzs(path, std::slice::from_ref(geom))
}

pub fn write_xyzs(path: impl AsRef<Path>, geoms: &[Geom]) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, xyzs_string(geoms, std::iter::empty())).at(path)
}

/// like [write_xyzs] but with a per-record comment line, for example the name
/// of the task a geometry belongs to
pub fn write_xyzs_with_comments<S: AsRef<str>>(
    path: impl AsRef<Path>,
    geoms: &[Geom],
    comments: &[S],
) -> Result<()> {
    let path = path.as_ref();
    if geoms.len() != comments.len() {
        return Err(Error::parse(
            path,
            format!(
                "{} geometries but {} comment lines",
                geoms.len(),
                comments.len()
            ),
        ));
    }
    let body = xyzs_string(geoms, comments.iter().map(|s| s.as_ref()));
    std::fs::write(path, body).at(path)
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    fn water() -> Geom {
        Geom::new(vec![
            Atom::new("H", 0.0000000000, 0.7574590974, 0.5217905143),
            Atom::new("O", 0.0000000000, 0.0000000000, -0.0657441568),
            Atom::new("H", 0.0000000000, -0.7574590974, 0.5217905143),
        ])
    }

    #[test]
    fn test_from_cart() {
        let got = "
3
water geometry
 H          0.0000000000        0.7574590974        0.5217905143
 O          0.0000000000        0.0000000000       -0.0657441568
 H          0.0000000000       -0.7574590974        0.5217905143
"
        .parse::<Geom>()
        .unwrap();
        assert_eq!(got, water());
    }

    #[test]
    fn test_from_bare_atoms() {
        let got = "C 0.0 0.0 0.0\nO 0.0 0.0 1.2\n".parse::<Geom>().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got.atoms[1], Atom::new("O", 0.0, 0.0, 1.2));
    }

    #[test]
    fn test_parse_xyzs() {
        let s = "3

H 0.0 0.0 0.0
H 0.0 0.0 0.74
O 1.0 0.0 0.0
2
second molecule
c 0.0 0.0 0.0
o 0.0 0.0 1.128

1
a comment with four words
He 5.0 5.0 5.0
";
        let got = parse_xyzs(s).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].len(), 3);
        assert_eq!(
            got[1],
            Geom::new(vec![
                Atom::new("C", 0.0, 0.0, 0.0),
                Atom::new("O", 0.0, 0.0, 1.128),
            ])
        );
        assert_eq!(got[2].atoms[0].label, "He");
    }

    #[test]
    fn test_parse_xyzs_errors() {
        let got = parse_xyzs("2\n\nH 0.0 0.0 0.0\n").unwrap_err();
        assert_eq!(got.line, 1);

        let got = parse_xyzs("1\n\nH 0.0 zero 0.0\n").unwrap_err();
        assert_eq!(got.line, 3);

        let got = parse_xyzs("H 0.0 0.0 0.0\n").unwrap_err();
        assert_eq!(got.line, 1);
    }

    #[test]
    fn test_write_xyzs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xyz");
        let geoms = vec![water(), Geom::new(vec![Atom::new("HE", 1.0, 2.0, 3.0)])];
        write_xyzs(&path, &geoms).unwrap();
        assert_snapshot!(std::fs::read_to_string(&path).unwrap(), @r"
        3

        H 0.0000000000 0.7574590974 0.5217905143
        O 0.0000000000 0.0000000000 -0.0657441568
        H 0.0000000000 -0.7574590974 0.5217905143
        1

        He 1.0000000000 2.0000000000 3.0000000000
        ");
        assert_eq!(read_xyzs(&path).unwrap(), geoms);
    }

    #[test]
    fn test_write_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xyz");
        let geoms = vec![water(), water()];
        write_xyzs_with_comments(&path, &geoms, &["T_1", "T_2"]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let comments: Vec<_> = contents.lines().filter(|l| l.starts_with("T_")).collect();
        assert_eq!(comments, ["T_1", "T_2"]);
        assert_eq!(read_xyzs(&path).unwrap(), geoms);

        assert!(write_xyzs_with_comments(&path, &geoms, &["T_1"]).is_err());
    }

    #[test]
    fn test_read_xyz_single() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.xyz");
        write_xyz(&path, &water()).unwrap();
        assert_eq!(read_xyz(&path).unwrap(), water());

        write_xyzs(&path, &[water(), water()]).unwrap();
        assert!(read_xyz(&path).is_err());
    }

    #[test]
    fn test_max_deviation() {
        let mut moved = water();
        moved.atoms[1].coord[2] += 2e-5;
        let got = water().max_deviation(&moved).unwrap();
        assert!((got - 2e-5).abs() < 1e-12);

        let mut relabeled = water();
        relabeled.atoms[0].label = "He".to_owned();
        assert_eq!(water().max_deviation(&relabeled), None);
        assert_eq!(water().max_deviation(&Geom::default()), None);
    }

    #[test]
    fn test_bohr_round_trip() {
        let back = water().scaled(ANG_TO_BOHR).scaled(1.0 / ANG_TO_BOHR);
        assert!(water().max_deviation(&back).unwrap() < 1e-12);
    }
}
