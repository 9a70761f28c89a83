//! Latency formatting.

use std::time::Duration;

/// Format `elapsed`, truncated to whole microseconds, as a compact duration
/// string: `0s`, `15µs`, `1.234ms`, `2.5s`, `1m30s`, `1h0m0s`.
pub fn format_latency(elapsed: Duration) -> String {
    let micros = elapsed.as_micros();
    if micros == 0 {
        return "0s".to_owned();
    }
    if micros < 1_000 {
        return format!("{micros}µs");
    }
    if micros < 1_000_000 {
        return format!("{}ms", decimal(micros, 1_000));
    }

    let total_secs = micros / 1_000_000;
    let seconds = decimal((total_secs % 60) * 1_000_000 + micros % 1_000_000, 1_000_000);
    let minutes = (total_secs / 60) % 60;
    let hours = total_secs / 3_600;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// `value / unit` with the fractional part printed without trailing zeros.
fn decimal(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let fraction = format!("{rem:0width$}");
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}
