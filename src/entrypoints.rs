use std::time::Instant;

use eyre::{Result, WrapErr};

use crate::algorithms::TmaxEstimation;
use crate::routines::data::{read_targets, MeshLoader, NpzMeshLoader};
use crate::routines::logger;
use crate::routines::output::TmaxResult;
use crate::routines::reduction::{Communicator, SelfComm};
use crate::routines::settings::Settings;
use crate::simulator::regional::RegionalLaplaceModel;
use crate::simulator::{ForwardModel, ForwardProblem};
use crate::structs::checkpoint::Checkpoint;
use crate::structs::control::{ControlSet, FieldLayout};

/// Primary entrypoint for tmaxopt
///
/// Reads the mesh and the measured data named in `settings`, estimates one Tmax field per
/// timepoint with the [RegionalLaplaceModel] and writes the results to the output folder when
/// `[io].write` is set. See [crate::routines::settings] for the recognized keys.
pub fn fit(settings: Settings) -> Result<TmaxResult> {
    let now = Instant::now();
    logger::setup_log(&settings)?;
    tracing::info!(
        "Starting tmaxopt at {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    settings.validate()?;

    match settings.io.write {
        true => {
            settings.write()?;
            tracing::info!(
                "Output files will be written to {}",
                settings.io.output_folder
            )
        }
        false => {
            tracing::info!("Output files will not be written - set `write = true` in the [io] section to enable output files")
        }
    }

    // Read input data
    let geometry = NpzMeshLoader::from_settings(&settings.io, &settings.simulation)
        .load()
        .wrap_err("Failed to load the mesh")?;
    let targets = read_targets(&settings.io).wrap_err("Failed to read the measured data")?;
    let problem = ForwardProblem::new(targets, geometry, settings.simulation.clone());

    let result = match fit_with(&RegionalLaplaceModel, &problem, settings.clone(), &SelfComm) {
        Ok(result) => result,
        Err(err) => {
            tracing::error!("An error has occurred during the estimation: {:#}", err);
            return Err(err);
        }
    };

    if settings.io.write {
        result.write_outputs()?;
    }

    tracing::info!("Program complete after {:.2?}", now.elapsed());
    Ok(result)
}

/// Alternative entrypoint for custom forward models and data that is already in memory
///
/// The control fields are initialized from `[io].init_file` when given, otherwise every
/// degree of freedom starts at `[simulation].init_opt_val`. Every rank of `comm` must call
/// this together. It does not set up logging; with `[io].write` set only the evaluation history
/// and the debug checkpoint are written, call [TmaxResult::write_outputs] for the rest.
pub fn fit_with<M: ForwardModel>(
    model: &M,
    problem: &ForwardProblem,
    settings: Settings,
    comm: &dyn Communicator,
) -> Result<TmaxResult> {
    let now = Instant::now();
    let bounds = settings.simulation.bounds()?;

    let checkpoint = match &settings.io.init_file {
        Some(path) => Some(
            Checkpoint::read(path)
                .wrap_err_with(|| format!("Failed to read initial controls from {}", path))?,
        ),
        None => None,
    };
    let controls = ControlSet::init(
        problem.ndatapts(),
        FieldLayout::serial(problem.geometry.ncells()),
        settings.simulation.init_opt_val,
        bounds,
        checkpoint.as_ref(),
    )?;

    let mut estimation = TmaxEstimation::new(model, problem, controls, comm, settings);
    let result = estimation.fit();
    if comm.is_coordinator() {
        tracing::info!("Total time: {:.2?}", now.elapsed());
    }
    result
}
