use std::fs::File;

use eyre::Result;
use ndarray::{array, Array1};
use ndarray_npy::NpzWriter;
use tmaxopt::prelude::*;

/// Regional Tmax (Pa) used to synthesize the measurements, regions by row
fn true_tmax(region: usize, timepoint: usize) -> f64 {
    let base = [0.0, 2e3, 4e4, 8e4, 6e4];
    base[timepoint] * (1.0 + 0.15 * region as f64)
}

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/optimize_case/config.toml".to_string());
    let settings = read_settings(&path)?;

    // Idealized ventricle with four regions
    let geometry = Geometry::idealized(32, 4, 60.0)?;
    let lvv = array![120.0, 125.0, 110.0, 80.0, 70.0];
    write_mesh(&geometry, &settings)?;

    // Simulate the measurements with a known Tmax
    let mut truth = ControlSet::init(
        lvv.len(),
        FieldLayout::serial(geometry.ncells()),
        0.0,
        ControlBounds::default(),
        None,
    )?;
    let regions = geometry.regions().cell_region().to_vec();
    let x: Vec<f64> = (0..lvv.len())
        .flat_map(|p| regions.iter().map(move |&r| true_tmax(r, p)))
        .collect();
    truth.assign(&x)?;

    let placeholder = TargetSeries::new(Array1::zeros(lvv.len()), lvv.clone(), None, None)?;
    let problem = ForwardProblem::new(placeholder, geometry, settings.simulation.clone());
    let measured = validate(&RegionalLaplaceModel, &truth, &problem)?;
    write_measurements(&settings, &measured, &lvv)?;

    let result = fit(settings)?;

    let estimated = result.regional_tmax();
    for p in 0..lvv.len() {
        let row: Vec<String> = (0..estimated.nrows())
            .map(|r| {
                format!(
                    "{:8.1} ({:8.1})",
                    estimated[[r, p]],
                    true_tmax(r, p) * tmaxopt::simulator::regional::PA_TO_MMHG
                )
            })
            .collect();
        println!("t{}: {}", p, row.join("  "));
    }
    Ok(())
}

fn write_mesh(geometry: &Geometry, settings: &Settings) -> Result<()> {
    let path = settings.io.mesh_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut npz = NpzWriter::new(File::create(&path)?);
    npz.add_array("eF", geometry.fiber().vectors())?;
    npz.add_array("eS", geometry.sheet().vectors())?;
    npz.add_array("eN", geometry.normal().vectors())?;
    npz.add_array("eC", geometry.circumferential().vectors())?;
    npz.add_array("eL", geometry.longitudinal().vectors())?;
    npz.add_array("eR", geometry.radial().vectors())?;
    let simulation = &settings.simulation;
    npz.add_array(
        "facetboundaries",
        &array![simulation.topid, simulation.lvendoid, simulation.epiid],
    )?;
    npz.add_array("edgeboundaries", &Array1::<i64>::zeros(0))?;
    npz.add_array("matid", geometry.matid())?;
    npz.finish()?;
    Ok(())
}

fn write_measurements(
    settings: &Settings,
    measured: &SimulationTrace,
    lvv: &Array1<f64>,
) -> Result<()> {
    let mut npz = NpzWriter::new(File::create(&settings.io.pv_data_file)?);
    npz.add_array("LVP", &measured.lvp)?;
    npz.add_array("LVV", lvv)?;
    npz.finish()?;

    if let Some(strain) = &settings.io.strain_data_file {
        let mut npz = NpzWriter::new(File::create(strain)?);
        npz.add_array("Ecc", &measured.ecc)?;
        npz.add_array("Ell", &measured.ell)?;
        npz.finish()?;
    }
    Ok(())
}
