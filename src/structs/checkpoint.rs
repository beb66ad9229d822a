use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use eyre::Result;
use ndarray::{Array1, Ix1, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};

use crate::error::TmaxError;

/// Name of the record holding the control field of timepoint `index`
pub fn record_name(index: usize) -> String {
    format!("Tmax{}", index)
}

/// Name of the record holding the control field of timepoint `index` at one evaluation
pub fn evaluation_record_name(index: usize, evaluation: usize) -> String {
    format!("{}_eval{}", record_name(index), evaluation)
}

/// Named control fields saved to disk
///
/// Checkpoints are `.npz` archives of 1-D arrays. The optimizer's debug log and the final
/// optimized controls both hold `Tmax{index}` records, so either can seed a later run. The
/// debug log additionally keeps `Tmax{index}_eval{n}` for every evaluation `n`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    source: Option<PathBuf>,
    records: BTreeMap<String, Array1<f64>>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Checkpoint::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Array1<f64>) {
        self.records.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&Array1<f64>> {
        self.records.get(name)
    }

    /// Values stored for a timepoint, or an error naming the missing record
    pub fn field(&self, index: usize) -> Result<&Array1<f64>> {
        let name = record_name(index);
        self.records.get(&name).ok_or_else(|| {
            TmaxError::MissingRecord {
                path: self.source.clone().unwrap_or_default(),
                name,
            }
            .into()
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(|k| k.as_str())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TmaxError::io(path, e))?;
        let mut npz = NpzReader::new(file).map_err(|e| TmaxError::format(path, e))?;
        let names = npz.names().map_err(|e| TmaxError::format(path, e))?;

        let mut records = BTreeMap::new();
        for name in names {
            let values = npz
                .by_name::<OwnedRepr<f64>, Ix1>(&name)
                .map_err(|e| TmaxError::format(path, format!("{}: {}", name, e)))?;
            let key = name.trim_end_matches(".npy").to_string();
            records.insert(key, values);
        }
        tracing::debug!("Read {} records from {:?}", records.len(), path);

        Ok(Checkpoint {
            source: Some(path.to_path_buf()),
            records,
        })
    }

    /// Write all records, replacing the file if it exists
    ///
    /// The archive is written next to `path` and renamed over it once complete, so an
    /// interrupted write leaves the previous file intact.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| TmaxError::io(parent, e))?;
            }
        }
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let file = File::create(&partial).map_err(|e| TmaxError::io(&partial, e))?;
        let mut npz = NpzWriter::new_compressed(file);
        for (name, values) in &self.records {
            npz.add_array(name.as_str(), values)
                .map_err(|e| TmaxError::format(path, e))?;
        }
        npz.finish().map_err(|e| TmaxError::format(path, e))?;
        std::fs::rename(&partial, path).map_err(|e| TmaxError::io(path, e))?;
        Ok(())
    }
}
