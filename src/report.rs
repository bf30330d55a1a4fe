//! Presentation of sweep results.
//!
//! Rows are `parameter, latency` in sweep order. Skipped steps are printed as rows with a status
//! instead of a latency so a gap in the curve always has a visible cause.
use crate::error::{ProbeError, Result};
use crate::format_size;
use crate::sweep::{Measurement, Outcome, Parameter};
use crate::timer::LatencyUnit;
use std::io::{self, Write};
use tabled::settings::Style;

/// Ratio over the previous latency that `Plain` flags as a jump.
const JUMP_RATIO: f64 = 1.5;

/// Output format selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    /// Aligned rows, streamed as each step finishes
    #[default]
    Plain,
    /// Markdown table, printed when the sweep finishes
    Table,
    /// CSV, streamed and flushed per row
    Csv,
}

/// Column semantics for one sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Columns {
    pub parameter: Parameter,
    pub unit: LatencyUnit,
}

impl Columns {
    fn heading(&self) -> &'static str {
        match self.parameter {
            Parameter::SizeBytes => "Size",
            Parameter::StrideBytes => "Stride(B)",
            Parameter::Entries => "Entries",
            Parameter::Ways => "Ways",
            Parameter::CodeBytes => "Code size",
        }
    }

    fn latency_heading(&self) -> String {
        format!("Latency ({})", self.unit.suffix())
    }

    fn format_param(&self, param: usize) -> String {
        if self.parameter.is_size() {
            format_size(param as u64)
        } else {
            param.to_string()
        }
    }
}

/// Sink for sweep measurements.
pub trait Report {
    fn begin(&mut self, columns: &Columns) -> Result<()>;
    fn emit(&mut self, measurement: &Measurement) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

impl Report for Box<dyn Report> {
    fn begin(&mut self, columns: &Columns) -> Result<()> {
        (**self).begin(columns)
    }

    fn emit(&mut self, measurement: &Measurement) -> Result<()> {
        (**self).emit(measurement)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

fn emit_before_begin() -> ProbeError {
    ProbeError::invalid("measurement emitted before the report began")
}

/// Reporter writing `format` to stdout.
pub fn stdout_reporter(format: Format) -> Box<dyn Report> {
    match format {
        Format::Plain => Box::new(Plain::new(io::stdout())),
        Format::Table => Box::new(Table::new(io::stdout())),
        Format::Csv => Box::new(Csv::new(io::stdout())),
    }
}

/// Streaming aligned rows, marking significant latency jumps.
pub struct Plain<W> {
    out: W,
    columns: Option<Columns>,
    prev_latency: Option<f64>,
    any_jump: bool,
}

impl<W: Write> Plain<W> {
    pub fn new(out: W) -> Self {
        Plain {
            out,
            columns: None,
            prev_latency: None,
            any_jump: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Report for Plain<W> {
    fn begin(&mut self, columns: &Columns) -> Result<()> {
        self.columns = Some(*columns);
        self.prev_latency = None;
        self.any_jump = false;
        writeln!(
            self.out,
            "{:>12} {:>16}",
            columns.heading(),
            columns.latency_heading()
        )?;
        writeln!(self.out, "{:-<12} {:-<16}", "", "")?;
        Ok(())
    }

    fn emit(&mut self, measurement: &Measurement) -> Result<()> {
        let columns = self.columns.ok_or_else(emit_before_begin)?;
        let param = columns.format_param(measurement.param);
        match measurement.outcome {
            Outcome::Latency(latency) => {
                let jump = match self.prev_latency {
                    Some(prev) if latency > prev * JUMP_RATIO => {
                        self.any_jump = true;
                        " ←"
                    }
                    _ => "",
                };
                writeln!(
                    self.out,
                    "{param:>12} {latency:>9.2} {:<6}{jump}",
                    columns.unit.suffix()
                )?;
                self.prev_latency = Some(latency);
            }
            Outcome::Skipped(reason) => {
                writeln!(self.out, "{param:>12} {:>16}", format!("skipped: {reason}"))?;
            }
        }
        self.out.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.any_jump {
            writeln!(
                self.out,
                "\n← latency rose more than {JUMP_RATIO}x over the previous row"
            )?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Collects rows and prints one markdown table at the end.
pub struct Table<W> {
    out: W,
    columns: Option<Columns>,
    rows: Vec<[String; 2]>,
}

impl<W: Write> Table<W> {
    pub fn new(out: W) -> Self {
        Table {
            out,
            columns: None,
            rows: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Report for Table<W> {
    fn begin(&mut self, columns: &Columns) -> Result<()> {
        self.columns = Some(*columns);
        self.rows.clear();
        Ok(())
    }

    fn emit(&mut self, measurement: &Measurement) -> Result<()> {
        let columns = self.columns.ok_or_else(emit_before_begin)?;
        let latency = match measurement.outcome {
            Outcome::Latency(latency) => format!("{latency:.3}"),
            Outcome::Skipped(reason) => format!("skipped: {reason}"),
        };
        self.rows
            .push([columns.format_param(measurement.param), latency]);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(columns) = self.columns.take() else {
            return Ok(());
        };
        let mut builder = tabled::builder::Builder::new();
        builder.push_record([columns.heading().to_string(), columns.latency_heading()]);
        for row in self.rows.drain(..) {
            builder.push_record(row);
        }
        let mut table = builder.build();
        table.with(Style::markdown());
        writeln!(self.out, "{table}")?;
        self.out.flush()?;
        Ok(())
    }
}

/// `parameter,latency,status` rows for plotting.
pub struct Csv<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> Csv<W> {
    pub fn new(out: W) -> Self {
        Csv {
            writer: csv::Writer::from_writer(out),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| io::Error::other(err.to_string()).into())
    }
}

impl<W: Write> Report for Csv<W> {
    fn begin(&mut self, columns: &Columns) -> Result<()> {
        let param = match columns.parameter {
            Parameter::SizeBytes => "size_bytes",
            Parameter::CodeBytes => "code_bytes",
            other => other.label(),
        };
        let latency = format!("latency_{}", columns.unit.suffix());
        self.writer.write_record([param, latency.as_str(), "status"])?;
        Ok(())
    }

    fn emit(&mut self, measurement: &Measurement) -> Result<()> {
        let (latency, status) = match measurement.outcome {
            Outcome::Latency(latency) => (latency.to_string(), "ok"),
            Outcome::Skipped(reason) => (String::new(), reason.as_str()),
        };
        let param = measurement.param.to_string();
        self.writer
            .write_record([param.as_str(), latency.as_str(), status])?;
        self.writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
