use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use viscox_core::buffer::Sample;
use viscox_core::export::{validate_label, ExportError, Exporter};
use viscox_core::tags::{MOTOR_RPM, SENSOR_LOAD, TIME_HEADER};

pub const RECORD_EXTENSION: &str = "csv";

/// Writes each export as `{YYYYMMDD_HHMMSS}_{label}.csv` under one directory.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    dir: PathBuf,
}

impl CsvExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a file that does not exist yet; a second export with the same label
    /// inside the same second gets a numeric suffix instead of overwriting.
    fn create_record(&self, label: &str) -> Result<(PathBuf, File), ExportError> {
        fs::create_dir_all(&self.dir)?;
        let stem = format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), label);
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.{RECORD_EXTENSION}")
            } else {
                format!("{stem}_{attempt}.{RECORD_EXTENSION}")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Exporter for CsvExporter {
    fn export(
        &self,
        label: &str,
        sensor: &[Sample],
        motor: &[Sample],
    ) -> Result<String, ExportError> {
        let label = validate_label(label)?;
        let (path, file) = self.create_record(label)?;

        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(file);
        for (header, samples) in [(SENSOR_LOAD.header, sensor), (MOTOR_RPM.header, motor)] {
            writer.write_record([TIME_HEADER, header]).map_err(encode_error)?;
            for sample in samples {
                writer
                    .write_record([sample.timestamp.to_string(), sample.value.to_string()])
                    .map_err(encode_error)?;
            }
        }
        writer.flush()?;

        info!(
            path = %path.display(),
            sensor_rows = sensor.len(),
            motor_rows = motor.len(),
            "Record written"
        );
        Ok(path.display().to_string())
    }
}

fn encode_error(e: csv::Error) -> ExportError {
    ExportError::Encode(e.to_string())
}

/// Both sections of a record read back from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSections {
    pub sensor: Vec<Sample>,
    pub motor: Vec<Sample>,
}

#[derive(Clone, Copy)]
enum Section {
    Sensor,
    Motor,
}

pub fn read_record(path: &Path) -> Result<RecordSections, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(encode_error)?;

    let mut sections = RecordSections::default();
    let mut current = None;
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(encode_error)?;
        let (Some(first), Some(second)) = (row.get(0), row.get(1)) else {
            return Err(ExportError::Encode(format!("row {index} has fewer than two cells")));
        };
        if first == TIME_HEADER {
            current = match second {
                h if h == SENSOR_LOAD.header => Some(Section::Sensor),
                h if h == MOTOR_RPM.header => Some(Section::Motor),
                other => {
                    return Err(ExportError::Encode(format!("unknown section {other:?}")));
                }
            };
            continue;
        }

        let parse = |cell: &str| {
            cell.trim()
                .parse::<f64>()
                .map_err(|_| ExportError::Encode(format!("row {index}: {cell:?} is not a number")))
        };
        let sample = Sample::new(parse(first)?, parse(second)?);
        match current {
            Some(Section::Sensor) => sections.sensor.push(sample),
            Some(Section::Motor) => sections.motor.push(sample),
            None => {
                return Err(ExportError::Encode(format!(
                    "row {index} appears before any section header"
                )));
            }
        }
    }
    debug!(
        path = %path.display(),
        sensor_rows = sections.sensor.len(),
        motor_rows = sections.motor.len(),
        "Record read"
    );
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[f64]) -> Vec<Sample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(1_700_000_000.0 + i as f64 * 0.1, *v))
            .collect()
    }

    #[test]
    fn writes_independent_sections() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path().join("records"));
        let sensor = samples(&[1.5, 2.25, 3.0]);
        let motor = samples(&[0.0]);

        let id = exporter.export("run-1", &sensor, &motor).unwrap();
        let path = PathBuf::from(&id);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("_run-1.csv"), "{name}");
        // YYYYMMDD_HHMMSS_
        assert_eq!(name.find("_run-1"), Some(15));

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1 + 3 + 1 + 1);
        assert_eq!(lines[0], "Time,Sensor Data");
        assert_eq!(lines[4], "Time,Motor Data");
        assert_eq!(lines[5], "1700000000,0");

        let back = read_record(&path).unwrap();
        assert_eq!(back.sensor, sensor);
        assert_eq!(back.motor, motor);
    }

    #[test]
    fn same_second_exports_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path());
        let a = exporter.export("dup", &[], &[]).unwrap();
        let b = exporter.export("dup", &samples(&[1.0]), &[]).unwrap();
        assert_ne!(a, b);
        assert!(read_record(Path::new(&a)).unwrap().sensor.is_empty());
        assert_eq!(read_record(Path::new(&b)).unwrap().sensor.len(), 1);
    }

    #[test]
    fn rejects_bad_labels_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path().join("never"));
        assert!(matches!(
            exporter.export("../up", &[], &[]),
            Err(ExportError::InvalidLabel(_))
        ));
        assert!(!dir.path().join("never").exists());
    }

    #[test]
    fn reader_rejects_orphan_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "1.0,2.0\n").unwrap();
        assert!(matches!(read_record(&path), Err(ExportError::Encode(_))));
    }
}
