use std::path::PathBuf;

use eyre::Result;
use tmaxopt::error::TmaxError;
use tmaxopt::routines::settings::{read_settings, Settings};

fn write_config(name: &str, contents: &str) -> Result<PathBuf> {
    let folder = std::env::temp_dir().join(format!("tmaxopt-settings-{}", std::process::id()));
    std::fs::create_dir_all(&folder)?;
    let path = folder.join(format!("{}.toml", name));
    std::fs::write(&path, contents)?;
    Ok(path)
}

/// Test the defaults of every section
#[test]
fn test_settings_defaults() {
    let settings = Settings::default();

    assert_eq!(settings.io.casename, "mesh");
    assert_eq!(settings.io.output_folder, "outputs");
    assert!(settings.io.write);
    assert_eq!(settings.io.init_file, None);
    assert_eq!(settings.io.debug_file.as_deref(), Some("Tmax_debug.npz"));

    assert_eq!(settings.simulation.n_load_steps, 18);
    assert_eq!(settings.simulation.n_intermediate_steps, 30);
    assert_eq!(settings.simulation.upper_bound, 500e3);
    assert_eq!(settings.simulation.lower_bound, 0.0);
    assert_eq!(settings.simulation.init_opt_val, 0.0);
    assert_eq!(settings.simulation.k_lvp, 1.0);
    assert_eq!(settings.simulation.k_reg, 0.0);
    assert_eq!(settings.simulation.max_newton_iter, 40);
    assert_eq!(settings.simulation.lvendoid, 2);

    assert_eq!(settings.optimizer.max_iterations, 50);
    assert_eq!(settings.optimizer.memory, 10);
    assert_eq!(settings.optimizer.relative_tolerance(), 0.0);
    assert_eq!(settings.log.level, "info");
}

/// An empty file yields the defaults
#[test]
fn test_empty_file() -> Result<()> {
    let path = write_config("empty", "")?;
    let settings = read_settings(&path)?;
    assert_eq!(settings, Settings::default());
    Ok(())
}

/// Keys written the way older case files spell them
#[test]
fn test_legacy_aliases() -> Result<()> {
    let path = write_config(
        "aliases",
        r#"
[io]
casename = "patient1"
directory_me = "meshes"
PVloop_data_file = "pv.csv"
outputfolder = "results"
Initfile = "Tmax_init.npz"

[simulation]
nLoadSteps = 5
Nintermediate_stp = 10
UpperBd = 300000.0
LowerBd = 10.0
init_opt_val = 1000.0
Kreg = 0.5
Kstr = 2.0
Kecc = 1.0
Kell = 0.25
Klvp = 3.0
LVendoid = 3
RVendoid = 5

[simulation.material]
Cparam = 100.0
B = 5.0

[optimizer]
maxiter = 20
"#,
    )?;
    let settings = read_settings(&path)?;

    assert_eq!(settings.io.casename, "patient1");
    assert_eq!(settings.io.mesh_directory, "meshes");
    assert_eq!(settings.io.pv_data_file, "pv.csv");
    assert_eq!(settings.io.output_folder, "results");
    assert_eq!(settings.io.init_file.as_deref(), Some("Tmax_init.npz"));
    assert_eq!(settings.io.mesh_path(), PathBuf::from("meshes/patient1.npz"));

    let simulation = &settings.simulation;
    assert_eq!(simulation.n_load_steps, 5);
    assert_eq!(simulation.n_intermediate_steps, 10);
    assert_eq!(simulation.upper_bound, 300e3);
    assert_eq!(simulation.lower_bound, 10.0);
    assert_eq!(simulation.init_opt_val, 1000.0);
    assert_eq!(simulation.k_reg, 0.5);
    assert_eq!(simulation.k_str, 2.0);
    assert_eq!(simulation.k_ecc, 1.0);
    assert_eq!(simulation.k_ell, 0.25);
    assert_eq!(simulation.k_lvp, 3.0);
    assert_eq!(simulation.lvendoid, 3);
    assert_eq!(simulation.rvendoid, 5);
    assert_eq!(simulation.material.c_param, 100.0);
    assert_eq!(simulation.material.b, 5.0);
    assert_eq!(settings.optimizer.max_iterations, 20);

    let bounds = simulation.bounds()?;
    assert_eq!((bounds.lower, bounds.upper), (10.0, 300e3));
    Ok(())
}

/// `factr` counts machine epsilons, `ftol` is the tolerance itself
#[test]
fn test_factr_is_scaled_by_machine_epsilon() -> Result<()> {
    let path = write_config(
        "factr",
        r#"
[optimizer]
factr = 1e7
"#,
    )?;
    let settings = read_settings(&path)?;
    assert_eq!(settings.optimizer.factr, Some(1e7));
    assert_eq!(settings.optimizer.relative_tolerance(), 1e7 * f64::EPSILON);
    assert!(settings.optimizer.relative_tolerance() < 1e-8);

    let path = write_config(
        "ftol",
        r#"
[optimizer]
ftol = 1e-6
"#,
    )?;
    let settings = read_settings(&path)?;
    assert_eq!(settings.optimizer.factr, None);
    assert_eq!(settings.optimizer.relative_tolerance(), 1e-6);
    Ok(())
}

/// Bounds that cannot hold any value are a configuration error
#[test]
fn test_inverted_bounds() -> Result<()> {
    let path = write_config(
        "inverted",
        r#"
[simulation]
lower_bound = 10.0
upper_bound = 1.0
"#,
    )?;
    let err = read_settings(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TmaxError>(),
        Some(TmaxError::Configuration(_))
    ));
    Ok(())
}

/// Strain csv files come in pairs
#[test]
fn test_unpaired_strain_files() -> Result<()> {
    let path = write_config(
        "unpaired",
        r#"
[io]
ecc_file = "ecc.csv"
"#,
    )?;
    let err = read_settings(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TmaxError>(),
        Some(TmaxError::Configuration(_))
    ));
    Ok(())
}

/// A missing file names the path in the error
#[test]
fn test_missing_file() {
    let err = read_settings("does/not/exist.toml").unwrap_err();
    assert!(format!("{:#}", err).contains("does/not/exist.toml"));
}

/// Test Settings serialization to JSON
#[test]
fn test_settings_serialization() -> Result<()> {
    let mut settings = Settings::default();
    settings.simulation.k_reg = 0.1;
    settings.optimizer.max_iterations = 7;

    let json = serde_json::to_string(&settings)?;
    assert!(json.contains("\"simulation\""));
    assert!(json.contains("\"B\""));

    let deserialized: Settings = serde_json::from_str(&json)?;
    assert_eq!(deserialized, settings);
    Ok(())
}

/// Settings are echoed to `settings.json` in the output folder
#[test]
fn test_settings_written_to_output_folder() -> Result<()> {
    let folder =
        std::env::temp_dir().join(format!("tmaxopt-settings-out-{}", std::process::id()));
    let mut settings = Settings::default();
    settings.io.output_folder = folder.to_string_lossy().to_string();
    settings.write()?;

    let contents = std::fs::read_to_string(folder.join("settings.json"))?;
    let written: Settings = serde_json::from_str(&contents)?;
    assert_eq!(written, settings);
    std::fs::remove_dir_all(&folder).ok();
    Ok(())
}
