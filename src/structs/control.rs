use eyre::Result;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::TmaxError;
use crate::routines::reduction::{summarize, Communicator, ControlSummary};
use crate::structs::checkpoint::{record_name, Checkpoint};

/// Box constraint shared by every control field and every degree of freedom
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlBounds {
    pub lower: f64,
    pub upper: f64,
}

impl ControlBounds {
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(TmaxError::Configuration(format!(
                "lower bound {} must not exceed upper bound {}",
                lower, upper
            ))
            .into());
        }
        Ok(ControlBounds { lower, upper })
    }
}

impl Default for ControlBounds {
    fn default() -> Self {
        ControlBounds {
            lower: 0.0,
            upper: 500e3,
        }
    }
}

/// Discretization shared by all control fields
///
/// `local` is the number of degrees of freedom held by this worker and `global` the total over
/// all workers. A single process has `local == global`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub local: usize,
    pub global: usize,
}

impl FieldLayout {
    pub fn serial(ndofs: usize) -> Self {
        FieldLayout {
            local: ndofs,
            global: ndofs,
        }
    }
}

/// The Tmax field of one timepoint
#[derive(Debug, Clone, PartialEq)]
pub struct ControlField {
    index: usize,
    values: Array1<f64>,
    global_len: usize,
    bounds: ControlBounds,
    initial: f64,
}

impl ControlField {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Locally owned values
    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn global_len(&self) -> usize {
        self.global_len
    }

    pub fn bounds(&self) -> ControlBounds {
        self.bounds
    }

    /// The constant the field was seeded with
    pub fn initial(&self) -> f64 {
        self.initial
    }

    pub fn summary(&self, comm: &dyn Communicator) -> ControlSummary {
        summarize(self.values.view(), self.global_len, comm)
    }
}

/// All control fields of a run, ordered by timepoint
///
/// The field at position `p` always belongs to timepoint `p`. Flattening concatenates the
/// fields in that order, which is the layout the optimizer works on.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSet {
    fields: Vec<ControlField>,
    layout: FieldLayout,
}

impl ControlSet {
    /// Create one field per timepoint, seeded with `seed` or read from `checkpoint`
    ///
    /// Reading the checkpoint is plain data loading and never involves a differentiation
    /// context.
    pub fn init(
        ndatapts: usize,
        layout: FieldLayout,
        seed: f64,
        bounds: ControlBounds,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<Self> {
        if layout.local > layout.global {
            return Err(TmaxError::Configuration(format!(
                "local field size {} exceeds global size {}",
                layout.local, layout.global
            ))
            .into());
        }

        let mut fields = Vec::with_capacity(ndatapts);
        for index in 0..ndatapts {
            let mut values = Array1::from_elem(layout.local, seed);
            if let Some(checkpoint) = checkpoint {
                let stored = checkpoint.field(index)?;
                if stored.len() != layout.local {
                    return Err(TmaxError::Configuration(format!(
                        "{} holds {} values, expected {}",
                        record_name(index),
                        stored.len(),
                        layout.local
                    ))
                    .into());
                }
                values.assign(stored);
            }
            fields.push(ControlField {
                index,
                values,
                global_len: layout.global,
                bounds,
                initial: seed,
            });
        }

        if checkpoint.is_some() {
            tracing::info!("Initialized {} control fields from checkpoint", ndatapts);
        } else {
            tracing::debug!(
                "Initialized {} control fields with constant value {}",
                ndatapts,
                seed
            );
        }

        Ok(ControlSet { fields, layout })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn layout(&self) -> FieldLayout {
        self.layout
    }

    pub fn fields(&self) -> &[ControlField] {
        &self.fields
    }

    pub fn field(&self, timepoint: usize) -> Option<&ControlField> {
        self.fields.get(timepoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlField> {
        self.fields.iter()
    }

    /// Length of the flattened control vector
    pub fn flat_len(&self) -> usize {
        self.fields.len() * self.layout.local
    }

    /// Lower and upper bound of every field, one entry per timepoint
    pub fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.fields
            .iter()
            .map(|f| (f.bounds.lower, f.bounds.upper))
            .unzip()
    }

    /// Bounds broadcast to every degree of freedom of the flattened vector
    pub fn flat_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let mut lower = Vec::with_capacity(self.flat_len());
        let mut upper = Vec::with_capacity(self.flat_len());
        for field in &self.fields {
            lower.extend(std::iter::repeat(field.bounds.lower).take(self.layout.local));
            upper.extend(std::iter::repeat(field.bounds.upper).take(self.layout.local));
        }
        (lower, upper)
    }

    pub fn flatten(&self) -> Vec<f64> {
        let mut x = Vec::with_capacity(self.flat_len());
        for field in &self.fields {
            x.extend(field.values.iter());
        }
        x
    }

    /// Overwrite all fields from a flattened vector
    pub fn assign(&mut self, x: &[f64]) -> Result<()> {
        if x.len() != self.flat_len() {
            return Err(TmaxError::Optimizer(format!(
                "control vector has {} entries, expected {}",
                x.len(),
                self.flat_len()
            ))
            .into());
        }
        let n = self.layout.local;
        for (field, chunk) in self.fields.iter_mut().zip(x.chunks(n.max(1))) {
            field.values.assign(&ArrayView1::from(chunk));
        }
        Ok(())
    }

    pub fn summaries(&self, comm: &dyn Communicator) -> Vec<ControlSummary> {
        self.fields.iter().map(|f| f.summary(comm)).collect()
    }

    /// Copy the current values into a checkpoint, one `Tmax{index}` record per field
    pub fn to_checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new();
        for field in &self.fields {
            checkpoint.insert(record_name(field.index), field.values.clone());
        }
        checkpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routines::reduction::SelfComm;
    use ndarray::array;

    #[test]
    fn seeded_fields_hold_constant() {
        let set = ControlSet::init(
            3,
            FieldLayout::serial(4),
            1e3,
            ControlBounds::default(),
            None,
        )
        .unwrap();
        assert_eq!(set.len(), 3);
        for (p, field) in set.iter().enumerate() {
            assert_eq!(field.index(), p);
            assert!(field.values().iter().all(|&v| v == 1e3));
        }
    }

    #[test]
    fn flatten_and_assign_keep_timepoint_order() {
        let mut set = ControlSet::init(
            2,
            FieldLayout::serial(2),
            0.0,
            ControlBounds::default(),
            None,
        )
        .unwrap();
        set.assign(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(set.field(0).unwrap().values(), &array![1.0, 2.0]);
        assert_eq!(set.field(1).unwrap().values(), &array![3.0, 4.0]);
        assert_eq!(set.flatten(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(set.assign(&[1.0]).is_err());
    }

    #[test]
    fn bounds_are_broadcast() {
        let bounds = ControlBounds::new(1.0, 9.0).unwrap();
        let set = ControlSet::init(3, FieldLayout::serial(2), 5.0, bounds, None).unwrap();
        let (lower, upper) = set.bounds();
        assert_eq!(lower, vec![1.0; 3]);
        assert_eq!(upper, vec![9.0; 3]);
        let (lower, upper) = set.flat_bounds();
        assert_eq!(lower.len(), 6);
        assert_eq!(upper, vec![9.0; 6]);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(ControlBounds::new(2.0, 1.0).is_err());
    }

    #[test]
    fn checkpoint_overrides_seed() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("Tmax0", array![1.0, 2.0]);
        checkpoint.insert("Tmax1", array![3.0, 4.0]);
        let set = ControlSet::init(
            2,
            FieldLayout::serial(2),
            7.0,
            ControlBounds::default(),
            Some(&checkpoint),
        )
        .unwrap();
        assert_eq!(set.field(1).unwrap().values(), &array![3.0, 4.0]);
        assert_eq!(set.to_checkpoint(), checkpoint);
    }

    #[test]
    fn missing_checkpoint_record_is_an_error() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("Tmax0", array![1.0]);
        let err = ControlSet::init(
            2,
            FieldLayout::serial(1),
            0.0,
            ControlBounds::default(),
            Some(&checkpoint),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TmaxError>(),
            Some(TmaxError::MissingRecord { .. })
        ));
    }

    #[test]
    fn summaries_cover_every_field() {
        let mut set = ControlSet::init(
            2,
            FieldLayout::serial(2),
            0.0,
            ControlBounds::default(),
            None,
        )
        .unwrap();
        set.assign(&[1.0, 3.0, 5.0, 5.0]).unwrap();
        let summaries = set.summaries(&SelfComm);
        assert_eq!(summaries[0].mean, 2.0);
        assert_eq!(summaries[0].std, 1.0);
        assert_eq!(summaries[1].std, 0.0);
    }
}
