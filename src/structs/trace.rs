use ndarray::{Array1, Array2, Zip};

/// Diagnostics produced by one forward solve
///
/// Strain arrays use the orientation of the targets: one row per region, one column per
/// timepoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationTrace {
    /// Simulated LV pressure (mmHg)
    pub lvp: Array1<f64>,
    /// LV volume at which each timepoint was solved
    pub lvv: Array1<f64>,
    pub ecc: Array2<f64>,
    pub ell: Array2<f64>,
    pub err: Array2<f64>,
    /// Control values the solve actually used, one array per timepoint
    pub controls: Vec<Array1<f64>>,
}

impl SimulationTrace {
    pub fn zeros(ndatapts: usize, nregions: usize) -> Self {
        SimulationTrace {
            lvp: Array1::zeros(ndatapts),
            lvv: Array1::zeros(ndatapts),
            ecc: Array2::zeros((nregions, ndatapts)),
            ell: Array2::zeros((nregions, ndatapts)),
            err: Array2::zeros((nregions, ndatapts)),
            controls: Vec::with_capacity(ndatapts),
        }
    }

    pub fn ndatapts(&self) -> usize {
        self.lvp.len()
    }

    pub fn nregions(&self) -> usize {
        self.ecc.nrows()
    }

    /// Largest absolute difference between the simulated series of two traces
    ///
    /// Returns infinity when the shapes differ.
    pub fn max_abs_diff(&self, other: &SimulationTrace) -> f64 {
        if self.lvp.dim() != other.lvp.dim() || self.ecc.dim() != other.ecc.dim() {
            return f64::INFINITY;
        }
        let mut diff: f64 = 0.0;
        Zip::from(&self.lvp)
            .and(&other.lvp)
            .for_each(|a, b| diff = diff.max((a - b).abs()));
        Zip::from(&self.lvv)
            .and(&other.lvv)
            .for_each(|a, b| diff = diff.max((a - b).abs()));
        for (mine, theirs) in [
            (&self.ecc, &other.ecc),
            (&self.ell, &other.ell),
            (&self.err, &other.err),
        ] {
            Zip::from(mine)
                .and(theirs)
                .for_each(|a, b| diff = diff.max((a - b).abs()));
        }
        diff
    }
}
