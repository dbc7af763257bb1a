//! Resource quantity parsing
//!
//! CPU quantities are normalized to cores, RAM quantities to bytes. Two RAM
//! unit tables exist: allocation figures reported by the cluster use binary
//! bases for the `Ki`..`Ei` suffixes, while the saturation and utilization path
//! treats every suffix as a power of 1000. Callers pick the table matching
//! the source of the numbers and never mix the two in one ratio.

use crate::error::QuantityError;

/// Default number of decimal places kept after conversion
pub const DEFAULT_PRECISION: u32 = 2;

/// Divisors for CPU suffixes, relative to one core
const CPU_ORDERS_OF_MAGNITUDE: &[(&str, f64)] = &[("m", 1e3), ("n", 1e9)];

const BINARY_UNITS: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
];

const DECIMAL_UNITS: &[(&str, f64)] = &[
    ("Ki", 1e3),
    ("Mi", 1e6),
    ("Gi", 1e9),
    ("Ti", 1e12),
    ("Pi", 1e15),
    ("Ei", 1e18),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
];

/// Which RAM unit table to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamScale {
    /// `Ki`..`Ei` are powers of 1024, `K`..`E` powers of 1000
    Binary,
    /// Every suffix is a power of 1000
    Decimal,
}

impl RamScale {
    fn table(self) -> &'static [(&'static str, f64)] {
        match self {
            RamScale::Binary => BINARY_UNITS,
            RamScale::Decimal => DECIMAL_UNITS,
        }
    }
}

/// Round to `precision` decimal places
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Split a quantity into its numeric prefix and unit suffix
fn split_quantity(value: &str) -> (&str, &str) {
    let idx = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(value.len());
    value.split_at(idx)
}

fn parse_number(raw: &str, number: &str) -> Result<f64, QuantityError> {
    number.parse::<f64>().map_err(|_| QuantityError {
        value: raw.to_string(),
        reason: "numeric prefix missing or invalid",
    })
}

/// Convert a CPU quantity (`"250m"`, `"100n"`, `"4"`) to cores
pub fn parse_cpu(value: &str, precision: u32) -> Result<f64, QuantityError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }

    let (number, suffix) = split_quantity(trimmed);
    let count = parse_number(value, number)?;

    let cores = if suffix.is_empty() {
        count
    } else {
        let divisor = CPU_ORDERS_OF_MAGNITUDE
            .iter()
            .find(|(unit, _)| *unit == suffix)
            .map(|(_, d)| *d)
            .ok_or_else(|| QuantityError {
                value: value.to_string(),
                reason: "unknown cpu suffix",
            })?;
        count / divisor
    };

    Ok(round_to(cores, precision))
}

/// Like [`parse_cpu`] but an absent quantity counts as zero
pub fn parse_cpu_opt(value: Option<&str>, precision: u32) -> Result<f64, QuantityError> {
    value.map_or(Ok(0.0), |v| parse_cpu(v, precision))
}

/// Convert a RAM quantity (`"512Mi"`, `"1G"`, `"1024"`) to bytes
pub fn parse_ram(value: &str, scale: RamScale) -> Result<f64, QuantityError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }

    let (number, suffix) = split_quantity(trimmed);
    let count = parse_number(value, number)?;

    if suffix.is_empty() {
        return Ok(count);
    }

    scale
        .table()
        .iter()
        .find(|(unit, _)| *unit == suffix)
        .map(|(_, multiplier)| count * multiplier)
        .ok_or_else(|| QuantityError {
            value: value.to_string(),
            reason: "unknown memory suffix",
        })
}

/// Like [`parse_ram`] but an absent quantity counts as zero
pub fn parse_ram_opt(value: Option<&str>, scale: RamScale) -> Result<f64, QuantityError> {
    value.map_or(Ok(0.0), |v| parse_ram(v, scale))
}

/// `used / total` as a percentage, zero when `total` is zero
pub fn percent_of(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        used / total * 100.0
    }
}

/// Render cores as a millicore string (`0.25` -> `"250m"`)
pub fn format_millicores(cores: f64) -> String {
    if cores == 0.0 {
        return "0m".to_string();
    }
    format!("{}m", (cores * 1000.0).floor() as i64)
}

/// Render bytes with the largest binary suffix that fits
pub fn format_binary_bytes(bytes: f64) -> String {
    if bytes == 0.0 {
        return "0Ki".to_string();
    }

    for (unit, size) in BINARY_UNITS[..6].iter().rev() {
        if bytes >= *size {
            return format!("{}{}", round_to(bytes / size, 2), unit);
        }
    }

    format!("{}", bytes)
}
