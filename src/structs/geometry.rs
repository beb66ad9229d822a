use std::collections::BTreeMap;

use eyre::Result;
use ndarray::{Array1, Array2, Axis};

use crate::error::TmaxError;

/// Unit direction vectors, one row per cell
#[derive(Debug, Clone, PartialEq)]
pub struct Directions {
    vectors: Array2<f64>,
}

impl Directions {
    /// Normalize every row of `vectors` to unit length
    ///
    /// `name` only appears in the error when a row has zero (or non-finite) length.
    pub fn normalized(name: &str, vectors: Array2<f64>) -> Result<Self> {
        if vectors.ncols() != 3 {
            return Err(TmaxError::InvalidGeometry(format!(
                "{} must have 3 columns, found {}",
                name,
                vectors.ncols()
            ))
            .into());
        }
        let mut vectors = vectors;
        for (i, mut row) in vectors.axis_iter_mut(Axis(0)).enumerate() {
            let norm = row.dot(&row).sqrt();
            if !norm.is_normal() {
                return Err(TmaxError::InvalidGeometry(format!(
                    "{} has a degenerate direction at cell {}",
                    name, i
                ))
                .into());
            }
            row /= norm;
        }
        Ok(Directions { vectors })
    }

    pub fn vectors(&self) -> &Array2<f64> {
        &self.vectors
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.nrows() == 0
    }
}

/// Material regions of the mesh
///
/// Regions are the distinct material labels in ascending order. The region index of a label is
/// its position in that order, which is also the row of the region in the strain arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Regions {
    labels: Vec<i64>,
    cell_region: Vec<usize>,
    sizes: Vec<usize>,
}

impl Regions {
    pub fn from_labels(matid: &Array1<i64>) -> Self {
        let mut index: BTreeMap<i64, usize> = BTreeMap::new();
        for &label in matid.iter() {
            index.entry(label).or_insert(0);
        }
        for (position, (_, slot)) in index.iter_mut().enumerate() {
            *slot = position;
        }
        let labels: Vec<i64> = index.keys().copied().collect();
        let cell_region: Vec<usize> = matid.iter().map(|label| index[label]).collect();
        let mut sizes = vec![0; labels.len()];
        for &r in &cell_region {
            sizes[r] += 1;
        }
        Regions {
            labels,
            cell_region,
            sizes,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    /// Region index of every cell
    pub fn cell_region(&self) -> &[usize] {
        &self.cell_region
    }

    /// Number of cells in every region
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Mean of a cell-wise field over each region
    pub fn mean(&self, cell_values: &Array1<f64>) -> Array1<f64> {
        let mut sums = Array1::<f64>::zeros(self.len());
        for (&r, v) in self.cell_region.iter().zip(cell_values.iter()) {
            sums[r] += v;
        }
        for (s, &n) in sums.iter_mut().zip(self.sizes.iter()) {
            if n > 0 {
                *s /= n as f64;
            }
        }
        sums
    }
}

/// Everything the forward model needs to know about the patient mesh
///
/// Directions are stored per cell: the controls live in a piecewise-constant space, so the cell
/// count is also the number of degrees of freedom of every control field.
#[derive(Debug, Clone)]
pub struct Geometry {
    fiber: Directions,
    sheet: Directions,
    normal: Directions,
    circumferential: Directions,
    longitudinal: Directions,
    radial: Directions,
    facet_boundaries: Array1<i64>,
    edge_boundaries: Array1<i64>,
    matid: Array1<i64>,
    regions: Regions,
}

#[allow(clippy::too_many_arguments)]
impl Geometry {
    pub fn new(
        fiber: Directions,
        sheet: Directions,
        normal: Directions,
        circumferential: Directions,
        longitudinal: Directions,
        radial: Directions,
        facet_boundaries: Array1<i64>,
        edge_boundaries: Array1<i64>,
        matid: Array1<i64>,
    ) -> Result<Self> {
        let ncells = matid.len();
        if ncells == 0 {
            return Err(TmaxError::InvalidGeometry("mesh has no cells".to_string()).into());
        }
        for (name, d) in [
            ("eF", &fiber),
            ("eS", &sheet),
            ("eN", &normal),
            ("eC", &circumferential),
            ("eL", &longitudinal),
            ("eR", &radial),
        ] {
            if d.len() != ncells {
                return Err(TmaxError::InvalidGeometry(format!(
                    "{} has {} rows but the mesh has {} cells",
                    name,
                    d.len(),
                    ncells
                ))
                .into());
            }
        }
        let regions = Regions::from_labels(&matid);
        Ok(Geometry {
            fiber,
            sheet,
            normal,
            circumferential,
            longitudinal,
            radial,
            facet_boundaries,
            edge_boundaries,
            matid,
            regions,
        })
    }

    /// Idealized mesh with `ncells` cells spread round-robin over `nregions` regions
    ///
    /// Fibers make a constant `helix_deg` angle with the circumferential direction.
    pub fn idealized(ncells: usize, nregions: usize, helix_deg: f64) -> Result<Self> {
        if nregions == 0 {
            return Err(TmaxError::InvalidGeometry("at least one region is required".into()).into());
        }
        let (sin, cos) = helix_deg.to_radians().sin_cos();
        let row = |v: [f64; 3]| Array2::from_shape_fn((ncells, 3), |(_, j)| v[j]);
        let matid = Array1::from_shape_fn(ncells, |i| (i % nregions) as i64 + 1);
        Geometry::new(
            Directions::normalized("eF", row([cos, 0.0, sin]))?,
            Directions::normalized("eS", row([0.0, 1.0, 0.0]))?,
            Directions::normalized("eN", row([-sin, 0.0, cos]))?,
            Directions::normalized("eC", row([1.0, 0.0, 0.0]))?,
            Directions::normalized("eL", row([0.0, 0.0, 1.0]))?,
            Directions::normalized("eR", row([0.0, 1.0, 0.0]))?,
            Array1::zeros(0),
            Array1::zeros(0),
            matid,
        )
    }

    pub fn ncells(&self) -> usize {
        self.matid.len()
    }

    pub fn regions(&self) -> &Regions {
        &self.regions
    }

    pub fn matid(&self) -> &Array1<i64> {
        &self.matid
    }

    pub fn fiber(&self) -> &Directions {
        &self.fiber
    }

    pub fn sheet(&self) -> &Directions {
        &self.sheet
    }

    pub fn normal(&self) -> &Directions {
        &self.normal
    }

    pub fn circumferential(&self) -> &Directions {
        &self.circumferential
    }

    pub fn longitudinal(&self) -> &Directions {
        &self.longitudinal
    }

    pub fn radial(&self) -> &Directions {
        &self.radial
    }

    pub fn facet_boundaries(&self) -> &Array1<i64> {
        &self.facet_boundaries
    }

    pub fn edge_boundaries(&self) -> &Array1<i64> {
        &self.edge_boundaries
    }

    /// Regional mean of `(f . eC)^2` and `(f . eL)^2`
    ///
    /// These are the fractions of the fiber strain seen along the circumferential and the
    /// longitudinal direction.
    pub fn fiber_projections(&self) -> Vec<(f64, f64)> {
        let f = self.fiber.vectors();
        let c = self.circumferential.vectors();
        let l = self.longitudinal.vectors();
        let cc = Array1::from_shape_fn(self.ncells(), |i| f.row(i).dot(&c.row(i)).powi(2));
        let ll = Array1::from_shape_fn(self.ncells(), |i| f.row(i).dot(&l.row(i)).powi(2));
        let cc = self.regions.mean(&cc);
        let ll = self.regions.mean(&ll);
        cc.iter().zip(ll.iter()).map(|(&a, &b)| (a, b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn directions_are_renormalized() {
        let d = Directions::normalized("eF", array![[3.0, 0.0, 4.0], [0.0, 2.0, 0.0]]).unwrap();
        assert_eq!(d.vectors(), &array![[0.6, 0.0, 0.8], [0.0, 1.0, 0.0]]);
    }

    #[test]
    fn zero_direction_is_rejected() {
        let err = Directions::normalized("eC", array![[0.0, 0.0, 0.0]]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TmaxError>(),
            Some(TmaxError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn regions_follow_sorted_labels() {
        let regions = Regions::from_labels(&array![7, 3, 7, 5, 3]);
        assert_eq!(regions.labels(), &[3, 5, 7]);
        assert_eq!(regions.cell_region(), &[2, 0, 2, 1, 0]);
        assert_eq!(regions.sizes(), &[2, 1, 2]);
        let mean = regions.mean(&array![1.0, 2.0, 3.0, 4.0, 6.0]);
        assert_eq!(mean, array![4.0, 4.0, 2.0]);
    }

    #[test]
    fn idealized_projections_match_helix_angle() {
        let geometry = Geometry::idealized(8, 4, 60.0).unwrap();
        assert_eq!(geometry.regions().len(), 4);
        for (cc, ll) in geometry.fiber_projections() {
            assert!((cc - 0.25).abs() < 1e-12);
            assert!((ll - 0.75).abs() < 1e-12);
        }
    }
}
