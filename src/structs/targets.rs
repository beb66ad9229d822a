use eyre::Result;
use ndarray::{Array1, Array2};

use crate::error::TmaxError;

/// Measured regional strains, rows are regions and columns are timepoints
#[derive(Debug, Clone, PartialEq)]
pub struct StrainTargets {
    ecc: Array2<f64>,
    ell: Array2<f64>,
}

impl StrainTargets {
    pub fn ecc(&self) -> &Array2<f64> {
        &self.ecc
    }

    pub fn ell(&self) -> &Array2<f64> {
        &self.ell
    }

    pub fn nregions(&self) -> usize {
        self.ecc.nrows()
    }
}

/// Clinical data the optimization tries to reproduce
///
/// Immutable once built. All consistency checks happen in [TargetSeries::new], so a value of
/// this type is always safe to hand to a forward solve.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSeries {
    lvp: Array1<f64>,
    lvv: Array1<f64>,
    strain: Option<StrainTargets>,
}

impl TargetSeries {
    pub fn new(
        lvp: Array1<f64>,
        lvv: Array1<f64>,
        ecc: Option<Array2<f64>>,
        ell: Option<Array2<f64>>,
    ) -> Result<Self> {
        let ndatapts = lvp.len();
        if ndatapts == 0 {
            return Err(TmaxError::Configuration("PV data has no data points".into()).into());
        }
        if lvv.len() != ndatapts {
            return Err(TmaxError::Configuration(format!(
                "LVV has {} data points but LVP has {}",
                lvv.len(),
                ndatapts
            ))
            .into());
        }

        let strain = match (ecc, ell) {
            (None, None) => None,
            (Some(ecc), Some(ell)) => {
                if ecc.ncols() != ndatapts {
                    return Err(TmaxError::Configuration(format!(
                        "Number of strain data points ({}) is different from PV data points ({})",
                        ecc.ncols(),
                        ndatapts
                    ))
                    .into());
                }
                if ell.dim() != ecc.dim() {
                    return Err(TmaxError::Configuration(format!(
                        "Ell has shape {:?} but Ecc has shape {:?}",
                        ell.dim(),
                        ecc.dim()
                    ))
                    .into());
                }
                Some(StrainTargets { ecc, ell })
            }
            _ => {
                return Err(TmaxError::Configuration(
                    "Ecc and Ell must be provided together".into(),
                )
                .into())
            }
        };

        Ok(TargetSeries { lvp, lvv, strain })
    }

    pub fn ndatapts(&self) -> usize {
        self.lvp.len()
    }

    pub fn lvp(&self) -> &Array1<f64> {
        &self.lvp
    }

    pub fn lvv(&self) -> &Array1<f64> {
        &self.lvv
    }

    pub fn strain(&self) -> Option<&StrainTargets> {
        self.strain.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn consistent_targets_are_accepted() {
        let targets = TargetSeries::new(
            array![10.0, 80.0, 20.0],
            array![120.0, 100.0, 60.0],
            Some(Array2::zeros((2, 3))),
            Some(Array2::zeros((2, 3))),
        )
        .unwrap();
        assert_eq!(targets.ndatapts(), 3);
        assert_eq!(targets.strain().unwrap().nregions(), 2);
    }

    #[test]
    fn strain_columns_must_match_pv_points() {
        let err = TargetSeries::new(
            array![10.0, 80.0, 20.0],
            array![120.0, 100.0, 60.0],
            Some(Array2::zeros((2, 4))),
            Some(Array2::zeros((2, 4))),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TmaxError>(),
            Some(TmaxError::Configuration(_))
        ));
    }

    #[test]
    fn volume_and_pressure_lengths_must_match() {
        assert!(TargetSeries::new(array![1.0, 2.0], array![1.0], None, None).is_err());
    }

    #[test]
    fn strain_families_come_in_pairs() {
        assert!(TargetSeries::new(
            array![1.0],
            array![1.0],
            Some(Array2::zeros((1, 1))),
            None
        )
        .is_err());
    }
}
