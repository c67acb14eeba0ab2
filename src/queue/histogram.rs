use std::fmt::Display;

/// a histogram of job times covering the range [min, max) with `N` bins.
/// values outside the range are not binned but still count toward the other
/// statistics
pub(crate) struct Histogram<const N: usize> {
    pub(crate) min: f64,
    pub(crate) cur_min: f64,
    pub(crate) cur_max: f64,
    pub(crate) total: f64,
    pub(crate) count: usize,
    denom: f64,
    data: [usize; N],
}

impl<const N: usize> Histogram<N> {
    pub(crate) fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            denom: max - min,
            data: [0; N],
            cur_min: f64::INFINITY,
            cur_max: f64::NEG_INFINITY,
            total: 0.0,
            count: 0,
        }
    }

    /// insert `val` into the appropriate bin in `self` and add it to the total
    pub(crate) fn insert(&mut self, val: f64) {
        let idx = N as f64 * (val - self.min) / self.denom;
        if idx >= 0.0 {
            if let Some(elt) = self.data.get_mut(idx.floor() as usize) {
                *elt += 1;
            }
        }
        self.cur_max = self.cur_max.max(val);
        self.cur_min = self.cur_min.min(val);
        self.total += val;
        self.count += 1;
    }

    /// return the average of `self`, or 0 if nothing has been inserted
    pub(crate) fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }
}

impl<const N: usize> Display for Histogram<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bin_width = self.denom / N as f64;
        for (i, v) in self.data.iter().enumerate() {
            if *v > 0 {
                writeln!(f, "{:5.2}{:5}", self.min + i as f64 * bin_width, v)?;
            }
        }
        Ok(())
    }
}
