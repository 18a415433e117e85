//! Utility functions
/// Format a byte count for humans, in powers of 1000.
pub fn to_human_readable(n: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    let delimiter = 1000_f64;

    if n < 1000 {
        return format!("{n} B");
    }

    let mut n = n as f64;
    let mut u = 0;
    while (n * 10.0).round() / 10.0 >= delimiter && u < units.len() - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u])
}

/// Percentage of `part` in `total`, `0` for an empty total.
pub fn percent(part: u64, total: u64) -> u8 {
    (part.saturating_mul(100).checked_div(total).unwrap_or(0)).min(100) as u8
}
