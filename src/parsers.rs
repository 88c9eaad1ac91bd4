use crate::status::GpuMetric;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed GPU row '{row}': {reason}")]
    GpuRow { row: String, reason: String },
    #[error("GPU '{name}' reports zero total memory")]
    GpuZeroTotal { name: String },
    #[error("idle field not found in CPU summary line")]
    IdleNotFound,
    #[error("could not parse idle percentage from '{field}'")]
    IdleValue { field: String },
    #[error("memory row not found in output")]
    MemoryRowNotFound,
    #[error("malformed memory row '{row}': {reason}")]
    MemoryRow { row: String, reason: String },
    #[error("memory row reports zero total")]
    MemoryZeroTotal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub total_mb: u64,
    pub used_mb: u64,
    pub usage_percentage: f64,
}

/// Labels `free -m` uses for the physical-memory row; the second is
/// what a zh_CN locale prints.
const MEMORY_ROW_LABELS: [&str; 2] = ["Mem:", "内存："];

/// Substring marking the idle field in the `top -bn1` CPU summary line.
const IDLE_MARKER: &str = "id";

/// Parses `nvidia-smi --query-gpu=name,memory.used,memory.total
/// --format=csv` output: a header line followed by one CSV row per GPU
/// (`name, <used> MiB, <total> MiB`). Rows come back in file order.
pub fn parse_gpu_table(text: &str) -> Result<Vec<GpuMetric>, ParseError> {
    let mut gpus = Vec::new();
    for row in text.lines().skip(1) {
        let row = row.trim();
        if row.is_empty() {
            continue;
        }
        let mut fields = row.split(',');
        let name = fields
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ParseError::GpuRow {
                row: row.to_string(),
                reason: "missing GPU name".to_string(),
            })?
            .to_string();
        let memory_used_mb = leading_integer(fields.next(), row, "memory.used")?;
        let memory_total_mb = leading_integer(fields.next(), row, "memory.total")?;
        if memory_total_mb == 0 {
            return Err(ParseError::GpuZeroTotal { name });
        }
        let usage_percentage = round2(memory_used_mb as f64 / memory_total_mb as f64 * 100.0);
        gpus.push(GpuMetric {
            name,
            memory_used_mb,
            memory_total_mb,
            usage_percentage,
        });
    }
    Ok(gpus)
}

/// Parses the single `%Cpu(s): ...` summary line from `top -bn1`,
/// returning usage as `100 - idle`, rounded to 2 decimals.
pub fn parse_cpu_line(text: &str) -> Result<f64, ParseError> {
    for field in text.trim().split(',') {
        if !field.contains(IDLE_MARKER) {
            continue;
        }
        let idle = field
            .split_whitespace()
            .next()
            .and_then(|token| token.parse::<f64>().ok())
            .ok_or_else(|| ParseError::IdleValue {
                field: field.trim().to_string(),
            })?;
        return Ok(round2(100.0 - idle));
    }
    Err(ParseError::IdleNotFound)
}

/// Parses `free -m` output: scans for the physical-memory row and
/// reads total and used (MiB) from its second and third columns.
pub fn parse_memory_block(text: &str) -> Result<MemoryReading, ParseError> {
    for line in text.lines() {
        if !MEMORY_ROW_LABELS
            .iter()
            .any(|label| line.starts_with(label))
        {
            continue;
        }
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 3 {
            return Err(ParseError::MemoryRow {
                row: line.to_string(),
                reason: "expected at least 3 columns".to_string(),
            });
        }
        let total_mb = parse_column(columns[1], line, "total")?;
        let used_mb = parse_column(columns[2], line, "used")?;
        if total_mb == 0 {
            return Err(ParseError::MemoryZeroTotal);
        }
        return Ok(MemoryReading {
            total_mb,
            used_mb,
            usage_percentage: round2(used_mb as f64 / total_mb as f64 * 100.0),
        });
    }
    Err(ParseError::MemoryRowNotFound)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Extracts the leading numeric token from a field like ` 2048 MiB`.
fn leading_integer(field: Option<&str>, row: &str, what: &str) -> Result<u64, ParseError> {
    field
        .and_then(|f| f.split_whitespace().next())
        .and_then(|token| token.parse::<u64>().ok())
        .ok_or_else(|| ParseError::GpuRow {
            row: row.to_string(),
            reason: format!("missing or non-numeric {what} field"),
        })
}

fn parse_column(token: &str, row: &str, what: &str) -> Result<u64, ParseError> {
    token.parse::<u64>().map_err(|_| ParseError::MemoryRow {
        row: row.to_string(),
        reason: format!("non-numeric {what} column '{token}'"),
    })
}
