use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use eyre::{Result, WrapErr};
use ndarray::Array2;
use serde::Serialize;

use crate::algorithms::Status;
use crate::routines::reduction::ControlSummary;
use crate::routines::settings::Settings;
use crate::simulator::regional::PA_TO_MMHG;
use crate::simulator::ForwardProblem;
use crate::structs::control::ControlSet;
use crate::structs::geometry::Regions;
use crate::structs::targets::TargetSeries;
use crate::structs::trace::SimulationTrace;

pub mod evaluations;

/// Defines the result of a Tmax estimation
///
/// A [TmaxResult] holds the optimized controls, the trace of the validation solve and what is
/// needed to compare both with the measured data.
#[derive(Debug, Clone)]
pub struct TmaxResult {
    controls: ControlSet,
    trace: SimulationTrace,
    targets: TargetSeries,
    regions: Regions,
    objective: f64,
    iterations: u64,
    evaluations: usize,
    status: Status,
    summaries: Vec<ControlSummary>,
    settings: Settings,
}

#[allow(clippy::too_many_arguments)]
impl TmaxResult {
    pub fn new(
        controls: ControlSet,
        trace: SimulationTrace,
        problem: &ForwardProblem,
        objective: f64,
        iterations: u64,
        evaluations: usize,
        status: Status,
        summaries: Vec<ControlSummary>,
        settings: Settings,
    ) -> Self {
        TmaxResult {
            controls,
            trace,
            targets: problem.targets.clone(),
            regions: problem.geometry.regions().clone(),
            objective,
            iterations,
            evaluations,
            status,
            summaries,
            settings,
        }
    }

    pub fn controls(&self) -> &ControlSet {
        &self.controls
    }

    /// Trace of the validation solve with the optimized controls
    pub fn trace(&self) -> &SimulationTrace {
        &self.trace
    }

    pub fn objective(&self) -> f64 {
        self.objective
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Number of forward solves done by the optimizer
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn converged(&self) -> bool {
        self.status == Status::Converged
    }

    pub fn summaries(&self) -> &[ControlSummary] {
        &self.summaries
    }

    /// Regional mean of every control field in mmHg, regions by row and timepoints by column
    pub fn regional_tmax(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.regions.len(), self.controls.len()));
        for (p, field) in self.controls.iter().enumerate() {
            let means = self.regions.mean(field.values());
            for (r, mean) in means.iter().enumerate() {
                out[[r, p]] = mean * PA_TO_MMHG;
            }
        }
        out
    }

    pub fn write_outputs(&self) -> Result<()> {
        let folder = &self.settings.io.output_folder;
        tracing::debug!("Writing outputs to {:?}", folder);
        self.settings.write()?;
        self.controls
            .to_checkpoint()
            .write(self.settings.io.output_path("Tmax_opt.npz"))
            .wrap_err("Failed to write optimized controls")?;
        self.write_pv_loop().wrap_err("Failed to write PV loop")?;
        self.write_summary().wrap_err("Failed to write Tmax summary")?;
        self.write_regional_tmax()
            .wrap_err("Failed to write regional Tmax")?;
        self.write_strain().wrap_err("Failed to write strains")?;
        Ok(())
    }

    /// Simulated and measured pressure and volume per timepoint
    pub fn write_pv_loop(&self) -> Result<()> {
        #[derive(Debug, Serialize)]
        struct Row {
            timepoint: usize,
            #[serde(rename = "LVV_sim")]
            lvv_sim: f64,
            #[serde(rename = "LVP_sim")]
            lvp_sim: f64,
            #[serde(rename = "LVV_data")]
            lvv_data: f64,
            #[serde(rename = "LVP_data")]
            lvp_data: f64,
        }

        let outputfile = OutputFile::new(&self.settings.io.output_folder, "pv_loop.csv")?;
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_writer(outputfile.file());
        for p in 0..self.targets.ndatapts() {
            writer.serialize(Row {
                timepoint: p,
                lvv_sim: self.trace.lvv[p],
                lvp_sim: self.trace.lvp[p],
                lvv_data: self.targets.lvv()[p],
                lvp_data: self.targets.lvp()[p],
            })?;
        }
        writer.flush()?;
        tracing::debug!("PV loop written to {:?}", outputfile.relative_path());
        Ok(())
    }

    /// Mean and standard deviation of every optimized control field
    pub fn write_summary(&self) -> Result<()> {
        #[derive(Debug, Serialize)]
        struct Row {
            timepoint: usize,
            mean: f64,
            std: f64,
        }

        let outputfile = OutputFile::new(&self.settings.io.output_folder, "tmax_summary.csv")?;
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_writer(outputfile.file());
        for (p, summary) in self.summaries.iter().enumerate() {
            writer.serialize(Row {
                timepoint: p,
                mean: summary.mean,
                std: summary.std,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// One row per timepoint, one column per region label
    pub fn write_regional_tmax(&self) -> Result<()> {
        let outputfile = OutputFile::new(&self.settings.io.output_folder, "regional_Tmax.csv")?;
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(outputfile.file());

        writer.write_field("timepoint")?;
        for label in self.regions.labels() {
            writer.write_field(format!("region_{}", label))?;
        }
        writer.write_record(None::<&[u8]>)?;

        let regional = self.regional_tmax();
        for (p, column) in regional.columns().into_iter().enumerate() {
            writer.write_field(format!("{}", p))?;
            for value in column.iter() {
                writer.write_field(format!("{}", value))?;
            }
            writer.write_record(None::<&[u8]>)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Measured and simulated regional strains, one row per region and timepoint
    pub fn write_strain(&self) -> Result<()> {
        #[derive(Debug, Serialize)]
        struct Row {
            region: i64,
            timepoint: usize,
            #[serde(rename = "Ecc_data")]
            ecc_data: Option<f64>,
            #[serde(rename = "Ecc_sim")]
            ecc_sim: f64,
            #[serde(rename = "Ell_data")]
            ell_data: Option<f64>,
            #[serde(rename = "Ell_sim")]
            ell_sim: f64,
            #[serde(rename = "Err_sim")]
            err_sim: f64,
        }

        let outputfile = OutputFile::new(&self.settings.io.output_folder, "total_Strain.csv")?;
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_writer(outputfile.file());
        let strain = self.targets.strain();
        for (r, &label) in self.regions.labels().iter().enumerate() {
            for p in 0..self.trace.ndatapts() {
                writer.serialize(Row {
                    region: label,
                    timepoint: p,
                    ecc_data: strain.map(|s| s.ecc()[[r, p]]),
                    ecc_sim: self.trace.ecc[[r, p]],
                    ell_data: strain.map(|s| s.ell()[[r, p]]),
                    ell_sim: self.trace.ell[[r, p]],
                    err_sim: self.trace.err[[r, p]],
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

/// Contains all the necessary information of an output file
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    relative_path: PathBuf,
}

impl OutputFile {
    pub fn new(folder: &str, file_name: &str) -> Result<Self> {
        let relative_path = Path::new(&folder).join(file_name);

        if let Some(parent) = relative_path.parent() {
            create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create directories for {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&relative_path)
            .wrap_err_with(|| format!("Failed to open file: {:?}", relative_path))?;

        Ok(OutputFile {
            file,
            relative_path,
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_owned(self) -> File {
        self.file
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }
}
