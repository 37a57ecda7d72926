use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::data::Observations;
use crate::error::ConfigError;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse '{value}' in column '{column}' on line {line}")]
    Parse {
        line: usize,
        column: String,
        value: String,
    },
    #[error("the first column must be named 'time', found '{0}'")]
    MissingTimeColumn(String),
    #[error("invalid observations: {0}")]
    Config(#[from] ConfigError),
}

/// Read observations from a CSV file
///
/// The header must be `time,<name>,<name>...`. Empty cells and `.` are read as
/// missing values. Lines starting with `#` are ignored.
pub fn read_observations(path: impl AsRef<Path>) -> Result<Observations, DataError> {
    let file = std::fs::File::open(path)?;
    from_reader(file)
}

impl Observations {
    /// See [read_observations]
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, DataError> {
        read_observations(path)
    }
}

/// Read observations in CSV form from any reader
pub fn from_reader<R: Read>(reader: R) -> Result<Observations, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let first = headers.get(0).unwrap_or_default().to_string();
    if !first.eq_ignore_ascii_case("time") {
        return Err(DataError::MissingTimeColumn(first));
    }
    let names: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();

    let mut times = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line() as usize).unwrap_or(0);
        let time = parse_cell(record.get(0).unwrap_or_default(), line, "time")?;
        let time = match time {
            Some(t) => t,
            None => {
                return Err(DataError::Parse {
                    line,
                    column: "time".to_string(),
                    value: String::new(),
                })
            }
        };
        let mut row = Vec::with_capacity(names.len());
        for (k, name) in names.iter().enumerate() {
            let cell = record.get(k + 1).unwrap_or_default();
            row.push(parse_cell(cell, line, name)?.unwrap_or(f64::NAN));
        }
        times.push(time);
        values.push(row);
    }

    Ok(Observations::new(names, times, values)?)
}

fn parse_cell(cell: &str, line: usize, column: &str) -> Result<Option<f64>, DataError> {
    if cell.is_empty() || cell == "." {
        return Ok(None);
    }
    cell.parse::<f64>()
        .map(Some)
        .map_err(|_| DataError::Parse {
            line,
            column: column.to_string(),
            value: cell.to_string(),
        })
}
