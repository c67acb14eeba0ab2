//! Parallel execution of a batch of calculations on a local worker pool.

use std::{sync::mpsc, time::Instant};

use log::{debug, info, warn};
use rayon::ThreadPoolBuilder;

use crate::{
    geom::Geom,
    program::{Program, ProgramResult},
    settings::Settings,
    Error, Result,
};

use histogram::Histogram;

mod histogram;

/// the largest per-axis difference in Å allowed between a submitted geometry
/// and the one a program reports back
pub const COORD_TOL: f64 = 1e-5;

/// A single calculation: the geometry at position `index` of a batch
#[derive(Clone, Copy, Debug)]
pub struct Job<'a> {
    pub index: usize,
    pub geom: &'a Geom,
}

impl<'a> Job<'a> {
    pub fn new(index: usize, geom: &'a Geom) -> Self {
        Self { index, geom }
    }
}

/// return an error if a pool of `workers` threads cannot be built
pub fn check_workers(workers: usize) -> Result<()> {
    if workers == 0 {
        return Err(Error::PoolConstruction(
            "the number of workers must be positive".to_owned(),
        ));
    }
    Ok(())
}

/// Run `program` on every geometry in `geoms` using a fresh pool of `workers`
/// threads and return one result per geometry, in the order of `geoms`.
/// Failed calculations and calculations whose reported geometry does not
/// match the input have no energy. The pool is shut down before returning.
pub fn dispatch<P: Program + ?Sized>(
    program: &P,
    geoms: &[Geom],
    settings: &Settings,
    workers: usize,
) -> Result<Vec<ProgramResult>> {
    check_workers(workers)?;
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("qmlabel-worker-{i}"))
        .build()
        .map_err(|e| Error::PoolConstruction(e.to_string()))?;

    let now = Instant::now();
    let jobs: Vec<_> = geoms
        .iter()
        .enumerate()
        .map(|(i, geom)| Job::new(i, geom))
        .collect();
    let mut dst = drain(&pool, program, &jobs, settings);
    drop(pool);

    let rejected = check_coords(geoms, &mut dst);
    summarize(&dst, rejected, now.elapsed().as_secs_f64());
    Ok(dst)
}

/// spawn every job in `jobs` onto `pool` and block until all of them have
/// reported back. each result lands in the slot given by its job's index,
/// regardless of the order in which the jobs finish
fn drain<P: Program + ?Sized>(
    pool: &rayon::ThreadPool,
    program: &P,
    jobs: &[Job],
    settings: &Settings,
) -> Vec<ProgramResult> {
    let (tx, rx) = mpsc::channel();
    pool.scope(move |s| {
        for job in jobs {
            let tx = tx.clone();
            s.spawn(move |_| {
                let res = program.compute(job.index, job.geom, settings);
                // the receiver outlives the scope, so this cannot fail
                let _ = tx.send((job.index, res));
            });
        }
    });

    let mut dst = vec![ProgramResult::default(); jobs.len()];
    for (index, res) in rx {
        dst[index] = res;
    }
    dst
}

/// compare the geometry each program reported with the one it was given and
/// drop the energy and gradient of every result that disagrees. returns the
/// number of results rejected this way
pub fn check_coords(geoms: &[Geom], results: &mut [ProgramResult]) -> usize {
    let mut rejected = 0;
    for (i, (geom, res)) in geoms.iter().zip(results.iter_mut()).enumerate() {
        if res.energy.is_none() {
            continue;
        }
        let dev = res.coords.as_ref().and_then(|c| c.max_deviation(geom));
        match dev {
            Some(dev) if dev <= COORD_TOL => continue,
            Some(dev) => warn!(
                "coordinates of job {i} changed by {dev:.2e} Å, \
                 discarding its energy"
            ),
            None => warn!(
                "job {i} did not report matching coordinates, \
                 discarding its energy"
            ),
        }
        res.energy = None;
        res.gradient = None;
        rejected += 1;
    }
    rejected
}

/// the energy of every result, in order
pub fn energies(results: &[ProgramResult]) -> Vec<Option<f64>> {
    results.iter().map(|r| r.energy).collect()
}

fn summarize(results: &[ProgramResult], rejected: usize, wall: f64) {
    let mut job_time = Histogram::<100>::new(0.0, 10.0);
    for res in results {
        job_time.insert(res.time);
    }
    let missing = results.iter().filter(|r| r.energy.is_none()).count();
    info!(
        "finished {} jobs after {wall:.1} s: {} computed, {missing} missing \
         ({rejected} with mismatched coordinates)",
        results.len(),
        results.len() - missing,
    );
    if job_time.count > 0 {
        info!(
            "job time: total {:.2} s, min {:.2} s, max {:.2} s, avg {:.2} s",
            job_time.total,
            job_time.cur_min,
            job_time.cur_max,
            job_time.average()
        );
        debug!("job time histogram:\n{job_time}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use crate::{atom::Atom, program::ProgramError};

    use super::*;

    /// echoes its input with energy equal to the job index. the job at
    /// `shift.0` reports its first atom moved by `shift.1` along x
    struct Echo {
        shift: Option<(usize, f64)>,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(shift: Option<(usize, f64)>) -> Self {
            Self {
                shift,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Program for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn run(
            &self,
            index: usize,
            geom: &Geom,
            _settings: &Settings,
        ) -> std::result::Result<ProgramResult, ProgramError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // finish the early jobs last
            thread::sleep(Duration::from_millis(5 * (8 - index as u64 % 8)));
            let mut coords = geom.clone();
            if let Some((i, d)) = self.shift {
                if i == index {
                    coords.atoms[0].coord[0] += d;
                }
            }
            if index == 5 {
                return Err(ProgramError::EnergyNotFound("job 5".to_owned()));
            }
            Ok(ProgramResult {
                energy: Some(index as f64),
                coords: Some(coords),
                gradient: Some(vec![0.0; 3 * geom.len()]),
                time: 0.0,
            })
        }
    }

    fn geoms(n: usize) -> Vec<Geom> {
        (0..n)
            .map(|i| {
                Geom::new(vec![
                    Atom::new("C", 0.1 * i as f64, 0.0, 0.0),
                    Atom::new("O", 0.1 * i as f64, 0.0, 1.128),
                ])
            })
            .collect()
    }

    #[test]
    fn test_dispatch_order() {
        let geoms = geoms(8);
        let echo = Echo::new(None);
        let got =
            dispatch(&echo, &geoms, &Settings::default(), 3).unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 8);
        assert_eq!(
            energies(&got),
            vec![
                Some(0.0),
                Some(1.0),
                Some(2.0),
                Some(3.0),
                Some(4.0),
                None,
                Some(6.0),
                Some(7.0)
            ]
        );
        for (i, res) in got.iter().enumerate() {
            if i != 5 {
                assert_eq!(res.coords.as_ref(), Some(&geoms[i]));
            }
        }
    }

    #[test]
    fn test_dispatch_tolerance() {
        let geoms = geoms(3);
        let settings = Settings::default();

        let within = Echo::new(Some((1, 0.9e-5)));
        let got = dispatch(&within, &geoms, &settings, 2).unwrap();
        assert_eq!(energies(&got), vec![Some(0.0), Some(1.0), Some(2.0)]);

        let beyond = Echo::new(Some((1, 1.1e-5)));
        let got = dispatch(&beyond, &geoms, &settings, 2).unwrap();
        assert_eq!(energies(&got), vec![Some(0.0), None, Some(2.0)]);
        assert_eq!(got[1].gradient, None);
        assert!(got[0].gradient.is_some());
    }

    #[test]
    fn test_check_coords_mismatch() {
        let geoms = geoms(3);
        let ok = |g: &Geom| ProgramResult {
            energy: Some(-1.0),
            coords: Some(g.clone()),
            ..Default::default()
        };
        let mut results: Vec<_> = geoms.iter().map(ok).collect();
        // no coordinates at all
        results[0].coords = None;
        // atoms swapped
        results[1].coords.as_mut().unwrap().atoms.reverse();
        let rejected = check_coords(&geoms, &mut results);
        assert_eq!(rejected, 2);
        assert_eq!(energies(&results), vec![None, None, Some(-1.0)]);
    }

    #[test]
    fn test_dispatch_no_workers() {
        let echo = Echo::new(None);
        let got = dispatch(&echo, &geoms(2), &Settings::default(), 0);
        assert!(matches!(got, Err(Error::PoolConstruction(_))));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatch_empty() {
        let echo = Echo::new(None);
        let got = dispatch(&echo, &[], &Settings::default(), 4).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_dispatch_dyn() {
        let echo: Box<dyn Program> = Box::new(Echo::new(None));
        let got =
            dispatch(echo.as_ref(), &geoms(2), &Settings::default(), 1).unwrap();
        assert_eq!(energies(&got), vec![Some(0.0), Some(1.0)]);
    }
}
