use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{Writer, WriterBuilder};
use eyre::Result;
use serde::Serialize;

use crate::routines::optimization::observer::{EvaluationEvent, EvaluationObserver};
use crate::routines::output::OutputFile;
use crate::routines::reduction::ControlSummary;

/// Summary of one evaluation of the reduced objective
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationRecord {
    pub evaluation: usize,
    pub loss: f64,
    pub summaries: Vec<ControlSummary>,
}

/// Append-only history of the evaluations, written to `evaluations.csv`
///
/// One row per evaluation with the loss followed by the mean and standard deviation of every
/// control field. Rows are flushed as soon as the loss is known, so the file is complete up
/// to the last finished evaluation even if the run aborts.
pub struct EvaluationLog {
    writer: Writer<File>,
    path: PathBuf,
    header_written: bool,
    records: Vec<EvaluationRecord>,
}

impl EvaluationLog {
    pub fn create(folder: &str) -> Result<Self> {
        let outputfile = OutputFile::new(folder, "evaluations.csv")?;
        let path = outputfile.relative_path().to_path_buf();
        let writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(outputfile.file_owned());
        Ok(EvaluationLog {
            writer,
            path,
            header_written: false,
            records: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[EvaluationRecord] {
        &self.records
    }

    fn write_header(&mut self, nfields: usize) -> Result<()> {
        self.writer.write_field("evaluation")?;
        self.writer.write_field("loss")?;
        for p in 0..nfields {
            self.writer.write_field(format!("mean_Tmax{}", p))?;
            self.writer.write_field(format!("std_Tmax{}", p))?;
        }
        self.writer.write_record(None::<&[u8]>)?;
        self.header_written = true;
        Ok(())
    }
}

impl EvaluationObserver for EvaluationLog {
    fn after_evaluation(&mut self, event: &EvaluationEvent) -> Result<()> {
        let loss = match event.loss {
            Some(loss) => loss,
            None => return Ok(()),
        };
        if !self.header_written {
            self.write_header(event.summaries.len())?;
        }

        self.writer.write_field(format!("{}", event.evaluation))?;
        self.writer.write_field(format!("{}", loss))?;
        for summary in event.summaries {
            self.writer.write_field(format!("{}", summary.mean))?;
            self.writer.write_field(format!("{}", summary.std))?;
        }
        self.writer.write_record(None::<&[u8]>)?;
        self.writer.flush()?;

        self.records.push(EvaluationRecord {
            evaluation: event.evaluation,
            loss,
            summaries: event.summaries.to_vec(),
        });
        Ok(())
    }
}

impl EvaluationObserver for &mut EvaluationLog {
    fn after_evaluation(&mut self, event: &EvaluationEvent) -> Result<()> {
        (**self).after_evaluation(event)
    }
}
