//! Metrics export (JSON array or CSV)

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::error::ExportError;

use super::collector::PerformanceSample;

const CSV_HEADER: &str = "timestamp,fps,managedMemoryMB,nativeMemoryMB,lastRenderTimeMs,level";

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    /// Guess from the file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => f.write_str("json"),
            ExportFormat::Csv => f.write_str("csv"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Serialize samples as a pretty-printed JSON array
pub fn to_json(samples: &[PerformanceSample]) -> Result<Vec<u8>, ExportError> {
    Ok(serde_json::to_vec_pretty(samples)?)
}

/// Write samples as CSV with a header row
pub fn write_csv<W: Write>(samples: &[PerformanceSample], mut writer: W) -> io::Result<()> {
    writeln!(writer, "{}", CSV_HEADER)?;
    for sample in samples {
        writeln!(
            writer,
            "{},{},{},{},{},{}",
            sample.timestamp.to_rfc3339(),
            sample.fps,
            sample.managed_memory_mb,
            sample.native_memory_mb,
            sample.last_render_time_ms,
            sample.level,
        )?;
    }
    writer.flush()
}

/// Write samples to `path` in `format`
pub fn export_to_path(
    samples: &[PerformanceSample],
    path: &Path,
    format: ExportFormat,
) -> Result<(), ExportError> {
    let io_error = |source: io::Error| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };

    // Serialize first so a serializer failure leaves no partial file
    let json = match format {
        ExportFormat::Json => Some(to_json(samples)?),
        ExportFormat::Csv => None,
    };

    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    match json {
        Some(bytes) => writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(io_error),
        None => write_csv(samples, &mut writer).map_err(io_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;

    fn collector_with_samples() -> MetricsCollector {
        let collector = MetricsCollector::default();
        collector.record_sample(60.0, 120.0, 30.0);
        collector.record_sample(12.0, 120.0, 30.0);
        collector
    }

    #[test]
    fn test_export_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let written = collector_with_samples()
            .export(&path, ExportFormat::Json)
            .unwrap();
        assert_eq!(written, 2);

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let first = &value.as_array().unwrap()[0];
        assert_eq!(first["fps"], 60.0);
        assert_eq!(first["managedMemoryMB"], 120.0);
        assert_eq!(first["nativeMemoryMB"], 30.0);
        assert_eq!(first["level"], "good");
        assert!(first["lastRenderTimeMs"].is_number());
        assert!(first["timestamp"].is_string());
        assert_eq!(value[1]["level"], "critical");
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");

        collector_with_samples()
            .export(&path, ExportFormat::Csv)
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row.len(), 6);
        assert_eq!(row[1], "60");
        assert_eq!(row[5], "good");
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("metrics.json");
        let collector = collector_with_samples();

        let result = collector.export(&path, ExportFormat::Json);
        assert!(matches!(result, Err(ExportError::Io { .. })));
        // Collection is unaffected
        assert!(collector.record_sample(60.0, 1.0, 0.0).is_some());
        assert_eq!(collector.len(), 3);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
        assert_eq!(
            ExportFormat::from_path(Path::new("out/metrics.csv")),
            Some(ExportFormat::Csv)
        );
        assert_eq!(ExportFormat::from_path(Path::new("metrics")), None);
    }
}
