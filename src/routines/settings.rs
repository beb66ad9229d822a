use std::path::{Path, PathBuf};

use config::Config as eConfig;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::error::TmaxError;
use crate::routines::output::OutputFile;
use crate::structs::control::ControlBounds;

/// Contains all settings for a Tmax estimation run
///
/// Every section is optional in the TOML file and falls back to its defaults. Keys of the
/// `[io]` and `[simulation]` sections also accept the spelling used by older case files, e.g.
/// `nLoadSteps` or `PVloop_data_file`.
#[derive(Debug, Deserialize, Clone, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub io: IoSettings,
    pub simulation: SimulationSettings,
    pub optimizer: OptimizerSettings,
    pub log: LogSettings,
}

/// Input and output locations
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct IoSettings {
    /// Name of the mesh archive, without extension
    #[serde(default = "default_casename")]
    pub casename: String,
    /// Folder holding `{casename}.npz`
    #[serde(default = "default_directory", alias = "directory_me")]
    pub mesh_directory: String,
    /// `.npz` archive with `LVP` and `LVV`, or a `.csv` file with those two columns
    #[serde(
        default = "default_pv_file",
        alias = "PVloop_data_file",
        alias = "pvloop_data_file"
    )]
    pub pv_data_file: String,
    /// `.npz` archive with `Ecc` and `Ell`
    #[serde(default, alias = "Strain_data_file")]
    pub strain_data_file: Option<String>,
    /// CSV matrix of circumferential strain, used when no strain archive is given
    #[serde(default)]
    pub ecc_file: Option<String>,
    #[serde(default)]
    pub ell_file: Option<String>,
    #[serde(default = "default_output_folder", alias = "outputfolder")]
    pub output_folder: String,
    /// Write result files, the evaluation history and the log file
    #[serde(default = "default_true")]
    pub write: bool,
    /// Checkpoint used to initialize the control fields
    #[serde(default, alias = "Initfile", alias = "initfile")]
    pub init_file: Option<String>,
    /// Checkpoint holding the controls of every evaluation, relative to the output folder
    ///
    /// Only written when `write` is set.
    #[serde(default = "default_debug_file")]
    pub debug_file: Option<String>,
}

impl Default for IoSettings {
    fn default() -> Self {
        IoSettings {
            casename: default_casename(),
            mesh_directory: default_directory(),
            pv_data_file: default_pv_file(),
            strain_data_file: None,
            ecc_file: None,
            ell_file: None,
            output_folder: default_output_folder(),
            write: true,
            init_file: None,
            debug_file: default_debug_file(),
        }
    }
}

impl IoSettings {
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        Path::new(&self.output_folder).join(file_name)
    }

    pub fn mesh_path(&self) -> PathBuf {
        Path::new(&self.mesh_directory).join(format!("{}.npz", self.casename))
    }
}

/// Parameters of the forward simulation and the loss weights
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct SimulationSettings {
    /// Increments used to ramp up to the first timepoint
    #[serde(default = "default_load_steps", alias = "nLoadSteps", alias = "nloadsteps")]
    pub n_load_steps: usize,
    /// Sub-steps between two consecutive timepoints
    #[serde(
        default = "default_intermediate_steps",
        alias = "Nintermediate_stp",
        alias = "nintermediate_stp"
    )]
    pub n_intermediate_steps: usize,
    #[serde(default = "default_upper_bound", alias = "UpperBd", alias = "upperbd")]
    pub upper_bound: f64,
    #[serde(default, alias = "LowerBd", alias = "lowerbd")]
    pub lower_bound: f64,
    /// Constant every control field starts from when no checkpoint is given
    #[serde(default)]
    pub init_opt_val: f64,
    /// Weight of the temporal regularization of Tmax
    #[serde(default, alias = "Kreg", alias = "kreg")]
    pub k_reg: f64,
    /// Weight of the regional strain mismatch
    #[serde(default, alias = "Kstr", alias = "kstr")]
    pub k_str: f64,
    #[serde(default, alias = "Kell", alias = "kell")]
    pub k_ell: f64,
    #[serde(default, alias = "Kecc", alias = "kecc")]
    pub k_ecc: f64,
    /// Weight of the LV pressure mismatch
    #[serde(default = "default_klvp", alias = "Klvp", alias = "klvp")]
    pub k_lvp: f64,
    #[serde(default = "default_abs_tol")]
    pub abs_tol: f64,
    #[serde(default = "default_rel_tol")]
    pub rel_tol: f64,
    #[serde(default = "default_max_newton_iter")]
    pub max_newton_iter: usize,
    #[serde(default = "default_topid")]
    pub topid: i64,
    #[serde(default = "default_lvendoid", alias = "LVendoid")]
    pub lvendoid: i64,
    /// Zero when the mesh has no right ventricle
    #[serde(default, alias = "RVendoid")]
    pub rvendoid: i64,
    #[serde(default = "default_epiid")]
    pub epiid: i64,
    #[serde(default)]
    pub material: MaterialSettings,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            n_load_steps: default_load_steps(),
            n_intermediate_steps: default_intermediate_steps(),
            upper_bound: default_upper_bound(),
            lower_bound: 0.0,
            init_opt_val: 0.0,
            k_reg: 0.0,
            k_str: 0.0,
            k_ell: 0.0,
            k_ecc: 0.0,
            k_lvp: default_klvp(),
            abs_tol: default_abs_tol(),
            rel_tol: default_rel_tol(),
            max_newton_iter: default_max_newton_iter(),
            topid: default_topid(),
            lvendoid: default_lvendoid(),
            rvendoid: 0,
            epiid: default_epiid(),
            material: MaterialSettings::default(),
        }
    }
}

impl SimulationSettings {
    pub fn bounds(&self) -> Result<ControlBounds> {
        ControlBounds::new(self.lower_bound, self.upper_bound)
    }
}

/// Guccione passive and active material parameters
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct MaterialSettings {
    #[serde(default = "default_cparam", alias = "Cparam", alias = "cparam")]
    pub c_param: f64,
    #[serde(default = "default_bff")]
    pub bff: f64,
    #[serde(default = "default_b", rename = "B", alias = "b")]
    pub b: f64,
    #[serde(default = "default_l0")]
    pub l0: f64,
    #[serde(default = "default_ca0", alias = "Ca0")]
    pub ca0: f64,
    #[serde(default = "default_ca0", alias = "Ca0max")]
    pub ca0max: f64,
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Ratio between cavity pressure and wall fiber stress
    #[serde(default = "default_wall_ratio")]
    pub wall_ratio: f64,
    /// Stress-free cavity volume, the first LVV sample when unset
    #[serde(default)]
    pub reference_volume: Option<f64>,
}

impl Default for MaterialSettings {
    fn default() -> Self {
        MaterialSettings {
            c_param: default_cparam(),
            bff: default_bff(),
            b: default_b(),
            l0: default_l0(),
            ca0: default_ca0(),
            ca0max: default_ca0(),
            lr: default_lr(),
            wall_ratio: default_wall_ratio(),
            reference_volume: None,
        }
    }
}

/// Options of the bounded quasi-Newton optimizer
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct OptimizerSettings {
    #[serde(default = "default_max_iterations", alias = "maxiter")]
    pub max_iterations: u64,
    /// Tolerance on the infinity norm of the projected gradient
    #[serde(default = "default_pgtol")]
    pub pgtol: f64,
    /// Tolerance on the relative decrease of the objective
    #[serde(default)]
    pub ftol: f64,
    /// The same tolerance as a multiple of machine epsilon, takes precedence over `ftol`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factr: Option<f64>,
    /// Number of correction pairs kept by the limited-memory update
    #[serde(default = "default_memory")]
    pub memory: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        OptimizerSettings {
            max_iterations: default_max_iterations(),
            pgtol: default_pgtol(),
            ftol: 0.0,
            factr: None,
            memory: default_memory(),
        }
    }
}

impl OptimizerSettings {
    /// Relative decrease of the objective below which the optimizer stops
    pub fn relative_tolerance(&self) -> f64 {
        match self.factr {
            Some(factr) => factr * f64::EPSILON,
            None => self.ftol,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Written inside the output folder
    #[serde(default = "default_log_file")]
    pub file: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

impl Settings {
    /// Check the settings that cannot be expressed by the types alone
    pub fn validate(&self) -> Result<()> {
        self.simulation.bounds()?;
        if self.optimizer.relative_tolerance() < 0.0 {
            return Err(TmaxError::Configuration(
                "optimizer.ftol and optimizer.factr must not be negative".into(),
            )
            .into());
        }
        if self.optimizer.memory == 0 {
            return Err(
                TmaxError::Configuration("optimizer.memory must be at least 1".into()).into(),
            );
        }
        if self.simulation.n_load_steps == 0 || self.simulation.n_intermediate_steps == 0 {
            return Err(TmaxError::Configuration(
                "nLoadSteps and Nintermediate_stp must be at least 1".into(),
            )
            .into());
        }
        if self.io.ecc_file.is_some() != self.io.ell_file.is_some() {
            return Err(TmaxError::Configuration(
                "io.ecc_file and io.ell_file must be given together".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Writes the settings to `settings.json` in the output folder
    pub fn write(&self) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        let outputfile = OutputFile::new(&self.io.output_folder, "settings.json")?;
        std::io::Write::write_all(&mut outputfile.file(), serialized.as_bytes())
            .map_err(|e| TmaxError::io(outputfile.relative_path(), e))?;
        Ok(())
    }
}

/// Read settings from a TOML file
///
/// Values can be overridden with environment variables prefixed by `TMAX`, using `__` between
/// section and key, e.g. `TMAX__OPTIMIZER__MAX_ITERATIONS=10`.
pub fn read_settings(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let parsed = eConfig::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix("TMAX")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| TmaxError::Configuration(e.to_string()))
        .wrap_err_with(|| format!("Failed to read settings from {:?}", path))?;

    let settings: Settings = parsed
        .try_deserialize()
        .map_err(|e| TmaxError::Configuration(e.to_string()))?;
    settings.validate()?;

    Ok(settings)
}

// *********************************
// Default values for deserializing
// *********************************
fn default_casename() -> String {
    "mesh".to_string()
}

fn default_directory() -> String {
    ".".to_string()
}

fn default_pv_file() -> String {
    "PVloop.npz".to_string()
}

fn default_output_folder() -> String {
    "outputs".to_string()
}

fn default_debug_file() -> Option<String> {
    Some("Tmax_debug.npz".to_string())
}

fn default_true() -> bool {
    true
}

fn default_load_steps() -> usize {
    18
}

fn default_intermediate_steps() -> usize {
    30
}

fn default_upper_bound() -> f64 {
    500e3
}

fn default_klvp() -> f64 {
    1.0
}

fn default_abs_tol() -> f64 {
    1e-8
}

fn default_rel_tol() -> f64 {
    5e-7
}

fn default_max_newton_iter() -> usize {
    40
}

fn default_topid() -> i64 {
    4
}

fn default_lvendoid() -> i64 {
    2
}

fn default_epiid() -> i64 {
    1
}

fn default_cparam() -> f64 {
    120.0
}

fn default_bff() -> f64 {
    11.6
}

fn default_b() -> f64 {
    4.75
}

fn default_l0() -> f64 {
    1.08
}

fn default_ca0() -> f64 {
    4.35
}

fn default_lr() -> f64 {
    1.85
}

fn default_wall_ratio() -> f64 {
    1.25
}

fn default_max_iterations() -> u64 {
    50
}

fn default_pgtol() -> f64 {
    1e-9
}

fn default_memory() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "log.txt".to_string()
}
