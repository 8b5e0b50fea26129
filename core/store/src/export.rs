//! Export of persisted result sets to CSV or JSON.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use pcemirror_common::{Error, OperationId, Result, TrafficFlow};

use crate::Store;

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    /// Conventional file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("Unsupported export format: {other}"))),
        }
    }
}

const CSV_HEADER: [&str; 15] = [
    "src_ip",
    "src_workload_id",
    "dst_ip",
    "dst_workload_id",
    "service_name",
    "port",
    "proto",
    "policy_decision",
    "flow_direction",
    "num_connections",
    "bytes_in",
    "bytes_out",
    "first_detected",
    "last_detected",
    "rule_href",
];

/// Write the stored flows of an operation to `writer`. Returns the row count.
pub fn export_flows<W: Write>(
    store: &Store,
    operation_id: &OperationId,
    format: ExportFormat,
    writer: W,
) -> Result<usize> {
    let flows = store.list_flows(operation_id)?;
    match format {
        ExportFormat::Csv => write_csv(&flows, writer)?,
        ExportFormat::Json => write_json(&flows, writer)?,
    }
    Ok(flows.len())
}

/// Export to a file, creating parent directories as needed.
pub fn export_to_file(
    store: &Store,
    operation_id: &OperationId,
    format: ExportFormat,
    path: impl AsRef<Path>,
) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    let rows = export_flows(store, operation_id, format, BufWriter::new(file))?;
    info!("Exported {} flows to {}", rows, path.display());
    Ok(rows)
}

fn write_json<W: Write>(flows: &[TrafficFlow], mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, flows)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn write_csv<W: Write>(flows: &[TrafficFlow], mut writer: W) -> Result<()> {
    writeln!(writer, "{}", CSV_HEADER.join(","))?;

    for flow in flows {
        let fields = [
            opt(&flow.src_ip),
            opt(&flow.src_workload_id),
            opt(&flow.dst_ip),
            opt(&flow.dst_workload_id),
            opt(&flow.service_name),
            opt(&flow.port),
            opt(&flow.proto),
            flow.policy_decision.to_string(),
            opt(&flow.flow_direction),
            flow.num_connections.to_string(),
            opt(&flow.bytes_in),
            opt(&flow.bytes_out),
            flow.first_detected.map(|t| t.to_rfc3339()).unwrap_or_default(),
            flow.last_detected.map(|t| t.to_rfc3339()).unwrap_or_default(),
            opt(&flow.rule_href),
        ];
        let line: Vec<String> = fields.iter().map(|f| escape_csv(f)).collect();
        writeln!(writer, "{}", line.join(","))?;
    }

    writer.flush()?;
    Ok(())
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// Quote a field if it contains a delimiter, quote or line break.
fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
