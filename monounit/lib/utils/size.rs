use crate::{MonounitError, MonounitResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Decimal multipliers recognised in size strings.
const SIZE_UNITS: [(&str, u64); 5] = [
    ("TB", 1_000_000_000_000),
    ("GB", 1_000_000_000),
    ("MB", 1_000_000),
    ("KB", 1_000),
    ("B", 1),
];

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a human-readable size of the form `<integer><unit>` into bytes.
///
/// Units are `B`, `KB`, `MB`, `GB` and `TB` with decimal multipliers. Unit matching is
/// case-insensitive and whitespace between number and unit is allowed.
///
/// ## Examples
///
/// ```
/// use monounit::utils::parse_size;
///
/// assert_eq!(parse_size("2GB").unwrap(), 2_000_000_000);
/// assert_eq!(parse_size("512 MB").unwrap(), 512_000_000);
/// assert!(parse_size("12XB").is_err());
/// ```
pub fn parse_size(value: &str) -> MonounitResult<u64> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(MonounitError::Validation(format!(
            "size {value:?} does not start with a number"
        )));
    }

    let count: u64 = digits
        .parse()
        .map_err(|_| MonounitError::Validation(format!("size {value:?} is out of range")))?;

    let unit = unit.trim().to_ascii_uppercase();
    let multiplier = SIZE_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, multiplier)| *multiplier)
        .ok_or_else(|| {
            MonounitError::Validation(format!("size {value:?} has an unrecognised unit"))
        })?;

    count
        .checked_mul(multiplier)
        .ok_or_else(|| MonounitError::Validation(format!("size {value:?} is out of range")))
}

/// Formats a byte count using decimal (base-1000) units, e.g. `1500000` becomes `2MB`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: f64 = 1000.0;
    const PREFIXES: [char; 6] = ['k', 'M', 'G', 'T', 'P', 'E'];

    if bytes < 1000 {
        return format!("{bytes}B");
    }

    let mut value = bytes as f64 / UNIT;
    let mut exp = 0;
    while value >= UNIT && exp < PREFIXES.len() - 1 {
        value /= UNIT;
        exp += 1;
    }

    format!("{:.0}{}B", value, PREFIXES[exp])
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
