use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("{0}")]
pub struct ParseAtomError(String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub label: String,
    pub coord: [f64; 3],
}

impl Atom {
    /// build an Atom, normalizing `label` to a capitalized element symbol so
    /// that `CL`, `cl`, and `Cl` all compare equal
    pub fn new(label: &str, x: f64, y: f64, z: f64) -> Self {
        Self {
            label: capitalize(label),
            coord: [x, y, z],
        }
    }

    pub fn x(&self) -> f64 {
        self.coord[0]
    }

    pub fn y(&self) -> f64 {
        self.coord[1]
    }

    pub fn z(&self) -> f64 {
        self.coord[2]
    }

    /// largest absolute difference along any axis between `self` and `other`
    pub fn max_deviation(&self, other: &Atom) -> f64 {
        self.coord
            .iter()
            .zip(other.coord.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// return a copy of `self` with every coordinate multiplied by `factor`
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            label: self.label.clone(),
            coord: self.coord.map(|c| c * factor),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

impl FromStr for Atom {
    type Err = ParseAtomError;

    /// parse an Atom from a line like
    ///  C 1.0 1.0 1.0
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<_> = s.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ParseAtomError(format!(
                "wrong number of fields in Atom: expected 4, got {}",
                fields.len()
            )));
        }
        let mut coord = [0.0; 3];
        for (c, f) in coord.iter_mut().zip(&fields[1..]) {
            *c = f.parse().map_err(|_| {
                ParseAtomError(format!(
                    "failed to parse coordinate field `{f}` as f64"
                ))
            })?;
        }
        Ok(Self::new(fields[0], coord[0], coord[1], coord[2]))
    }
}

impl Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:2} {:15.10} {:15.10} {:15.10}",
            self.label, self.coord[0], self.coord[1], self.coord[2]
        )
    }
}
