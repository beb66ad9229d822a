use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use eyre::Result;
use ndarray::{Array1, Array2, Ix1, Ix2, OwnedRepr};
use ndarray_csv::Array2Reader;
use ndarray_npy::NpzReader;
use serde::Deserialize;

use crate::error::TmaxError;
use crate::routines::settings::{IoSettings, SimulationSettings};
use crate::structs::geometry::{Directions, Geometry};
use crate::structs::targets::TargetSeries;

/// Source of the patient mesh
pub trait MeshLoader {
    fn load(&self) -> Result<Geometry>;
}

/// Boundary markers that must be present on the facets of the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryMarkers {
    pub top: i64,
    pub lv_endo: i64,
    /// Zero when the mesh has no right ventricle
    pub rv_endo: i64,
    pub epi: i64,
}

impl From<&SimulationSettings> for BoundaryMarkers {
    fn from(settings: &SimulationSettings) -> Self {
        BoundaryMarkers {
            top: settings.topid,
            lv_endo: settings.lvendoid,
            rv_endo: settings.rvendoid,
            epi: settings.epiid,
        }
    }
}

/// Reads `{directory}/{casename}.npz`
///
/// The archive holds the cell-wise directions `eF`, `eS`, `eN`, `eC`, `eL`, `eR` (`ncells x 3`),
/// the integer arrays `facetboundaries` and `edgeboundaries` and the material labels `matid`.
#[derive(Debug, Clone)]
pub struct NpzMeshLoader {
    path: PathBuf,
    markers: Option<BoundaryMarkers>,
}

impl NpzMeshLoader {
    pub fn new(directory: impl AsRef<Path>, casename: &str) -> Self {
        NpzMeshLoader {
            path: directory.as_ref().join(format!("{}.npz", casename)),
            markers: None,
        }
    }

    pub fn from_settings(io: &IoSettings, simulation: &SimulationSettings) -> Self {
        NpzMeshLoader {
            path: io.mesh_path(),
            markers: Some(BoundaryMarkers::from(simulation)),
        }
    }

    /// Require the given boundary markers on the facets
    pub fn with_markers(mut self, markers: BoundaryMarkers) -> Self {
        self.markers = Some(markers);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_markers(&self, facets: &Array1<i64>) -> Result<()> {
        let markers = match self.markers {
            Some(markers) => markers,
            None => return Ok(()),
        };
        if facets.is_empty() {
            return Ok(());
        }
        for (name, id) in [
            ("topid", markers.top),
            ("LVendoid", markers.lv_endo),
            ("RVendoid", markers.rv_endo),
            ("epiid", markers.epi),
        ] {
            if id != 0 && !facets.iter().any(|&f| f == id) {
                return Err(TmaxError::InvalidGeometry(format!(
                    "{:?} has no facet marked with {} = {}",
                    self.path, name, id
                ))
                .into());
            }
        }
        Ok(())
    }
}

impl MeshLoader for NpzMeshLoader {
    fn load(&self) -> Result<Geometry> {
        let path = self.path.as_path();
        let file = File::open(path).map_err(|e| TmaxError::io(path, e))?;
        let mut npz = NpzReader::new(file).map_err(|e| TmaxError::format(path, e))?;

        let mut directions = Vec::with_capacity(6);
        for name in ["eF", "eS", "eN", "eC", "eL", "eR"] {
            let vectors = read_matrix(&mut npz, path, name)?;
            directions.push(Directions::normalized(name, vectors)?);
        }
        let facets = read_labels(&mut npz, path, "facetboundaries")?;
        let edges = read_labels(&mut npz, path, "edgeboundaries")?;
        let matid = read_labels(&mut npz, path, "matid")?;
        self.check_markers(&facets)?;

        let mut directions = directions.into_iter();
        let mut next = || {
            directions
                .next()
                .ok_or_else(|| TmaxError::format(path, "missing direction field"))
        };
        let geometry = Geometry::new(
            next()?,
            next()?,
            next()?,
            next()?,
            next()?,
            next()?,
            facets,
            edges,
            matid,
        )?;
        tracing::info!(
            "Loaded mesh {:?}: {} cells in {} regions",
            path,
            geometry.ncells(),
            geometry.regions().len()
        );
        Ok(geometry)
    }
}

fn has_name<R: Read + Seek>(npz: &mut NpzReader<R>, path: &Path, name: &str) -> Result<bool> {
    let names = npz.names().map_err(|e| TmaxError::format(path, e))?;
    Ok(names
        .iter()
        .any(|n| n == name || n.trim_end_matches(".npy") == name))
}

fn missing(path: &Path, name: &str) -> TmaxError {
    TmaxError::MissingRecord {
        path: path.to_path_buf(),
        name: name.to_string(),
    }
}

fn read_vector<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    path: &Path,
    name: &str,
) -> Result<Array1<f64>> {
    if !has_name(npz, path, name)? {
        return Err(missing(path, name).into());
    }
    npz.by_name::<OwnedRepr<f64>, Ix1>(name)
        .map_err(|e| TmaxError::format(path, format!("{}: {}", name, e)).into())
}

fn read_matrix<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    path: &Path,
    name: &str,
) -> Result<Array2<f64>> {
    if !has_name(npz, path, name)? {
        return Err(missing(path, name).into());
    }
    npz.by_name::<OwnedRepr<f64>, Ix2>(name)
        .map_err(|e| TmaxError::format(path, format!("{}: {}", name, e)).into())
}

/// Integer labels, accepting the 64-bit, 32-bit and floating point encodings meshes come in
fn read_labels<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    path: &Path,
    name: &str,
) -> Result<Array1<i64>> {
    if !has_name(npz, path, name)? {
        return Err(missing(path, name).into());
    }
    if let Ok(labels) = npz.by_name::<OwnedRepr<i64>, Ix1>(name) {
        return Ok(labels);
    }
    if let Ok(labels) = npz.by_name::<OwnedRepr<i32>, Ix1>(name) {
        return Ok(labels.mapv(i64::from));
    }
    if let Ok(labels) = npz.by_name::<OwnedRepr<u64>, Ix1>(name) {
        return Ok(labels.mapv(|v| v as i64));
    }
    let labels = npz
        .by_name::<OwnedRepr<f64>, Ix1>(name)
        .map_err(|e| TmaxError::format(path, format!("{}: {}", name, e)))?;
    Ok(labels.mapv(|v| v.round() as i64))
}

fn open_npz(path: &Path) -> Result<NpzReader<File>> {
    let file = File::open(path).map_err(|e| TmaxError::io(path, e))?;
    Ok(NpzReader::new(file).map_err(|e| TmaxError::format(path, e))?)
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// Pressure and volume series, from an `.npz` archive or a `.csv` file with `LVP` and `LVV`
/// columns
pub fn read_pv(path: impl AsRef<Path>) -> Result<(Array1<f64>, Array1<f64>)> {
    let path = path.as_ref();
    if is_csv(path) {
        #[derive(Debug, Deserialize)]
        struct Row {
            #[serde(rename = "LVP")]
            lvp: f64,
            #[serde(rename = "LVV")]
            lvv: f64,
        }

        let file = File::open(path).map_err(|e| TmaxError::io(path, e))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let mut lvp = Vec::new();
        let mut lvv = Vec::new();
        for row in reader.deserialize::<Row>() {
            let row = row.map_err(|e| TmaxError::format(path, e))?;
            lvp.push(row.lvp);
            lvv.push(row.lvv);
        }
        return Ok((Array1::from(lvp), Array1::from(lvv)));
    }

    let mut npz = open_npz(path)?;
    let lvp = read_vector(&mut npz, path, "LVP")?;
    let lvv = read_vector(&mut npz, path, "LVV")?;
    Ok((lvp, lvv))
}

/// `Ecc` and `Ell` from one `.npz` archive
pub fn read_strain_npz(path: impl AsRef<Path>) -> Result<(Array2<f64>, Array2<f64>)> {
    let path = path.as_ref();
    let mut npz = open_npz(path)?;
    let ecc = read_matrix(&mut npz, path, "Ecc")?;
    let ell = read_matrix(&mut npz, path, "Ell")?;
    Ok((ecc, ell))
}

/// A headerless CSV matrix
pub fn read_csv_matrix(path: impl AsRef<Path>) -> Result<Array2<f64>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| TmaxError::io(path, e))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(file);
    let matrix: Array2<f64> = reader
        .deserialize_array2_dynamic()
        .map_err(|e| TmaxError::format(path, e))?;
    Ok(matrix)
}

/// Read and validate the measured data named in the settings
pub fn read_targets(io: &IoSettings) -> Result<TargetSeries> {
    let (lvp, lvv) = read_pv(&io.pv_data_file)?;
    let (ecc, ell) = match (&io.strain_data_file, &io.ecc_file, &io.ell_file) {
        (Some(strain), _, _) => {
            let (ecc, ell) = read_strain_npz(strain)?;
            (Some(ecc), Some(ell))
        }
        (None, Some(ecc), Some(ell)) => (Some(read_csv_matrix(ecc)?), Some(read_csv_matrix(ell)?)),
        (None, None, None) => (None, None),
        _ => {
            return Err(TmaxError::Configuration(
                "io.ecc_file and io.ell_file must be given together".to_string(),
            )
            .into())
        }
    };
    let targets = TargetSeries::new(lvp, lvv, ecc, ell)?;
    tracing::info!(
        "Loaded {} data points{}",
        targets.ndatapts(),
        if targets.strain().is_some() {
            " with regional strains"
        } else {
            ""
        }
    );
    Ok(targets)
}
