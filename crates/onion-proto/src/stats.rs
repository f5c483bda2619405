//! Statistics counters and the periodic heartbeat.
//!
//! Every counter here is monotonic and advisory: it may be bumped
//! before the associated I/O actually completes, and nothing in the
//! engine makes a control decision based on one.

use tracing::info;

/// Monotonic counters for the relay cell engine.
#[derive(Default, Debug, Clone)]
#[non_exhaustive]
pub struct Stats {
    /// How many relay cells have originated at this node, or have been
    /// relayed onward (not recognized here)?
    pub n_relay_cells_relayed: u64,
    /// How many relay cells have been delivered to streams at this
    /// node?
    pub n_relay_cells_delivered: u64,
    /// How many DATA cells have we packaged, ever?
    pub n_data_cells_packaged: u64,
    /// How many bytes of data have we put in DATA cells, ever?
    pub n_data_bytes_packaged: u64,
    /// How many DATA cells have we received, ever?
    pub n_data_cells_received: u64,
    /// How many bytes of data have we received in DATA cells, ever?
    pub n_data_bytes_received: u64,
    /// How many bytes have we handed to transports, ever?
    pub n_bytes_written: u64,
    /// How many cells' worth of bytes have we taken from transports,
    /// ever?
    pub n_bytes_read: u64,
}

/// Format `secs` of uptime as `days h:mm`.
fn fmt_uptime(secs: u64) -> String {
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;
    match days {
        0 => format!("{}:{:02}", hours, minutes),
        1 => format!("{} day {}:{:02}", days, hours, minutes),
        _ => format!("{} days {}:{:02}", days, hours, minutes),
    }
}

/// Format a byte count as a human-readable bandwidth figure.
fn fmt_bandwidth(bytes: u64) -> String {
    if bytes < (1 << 20) {
        format!("{} kB", bytes >> 10)
    } else if bytes < (1 << 30) {
        format!("{:.2} MB", bytes as f64 / f64::from(1_u32 << 20))
    } else {
        format!("{:.2} GB", bytes as f64 / f64::from(1_u32 << 30))
    }
}

/// Emit the heartbeat log line: uptime, open circuits, and traffic
/// totals.
pub(crate) fn log_heartbeat(stats: &Stats, uptime_secs: u64, n_circuits: usize) {
    info!(
        "Heartbeat: uptime is {}, with {} circuits open. I've pushed {} and received {}.",
        fmt_uptime(uptime_secs),
        n_circuits,
        fmt_bandwidth(stats.n_bytes_written),
        fmt_bandwidth(stats.n_bytes_read),
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uptime_formats() {
        assert_eq!(fmt_uptime(0), "0:00");
        assert_eq!(fmt_uptime(3 * 3600 + 5 * 60 + 59), "3:05");
        assert_eq!(fmt_uptime(86400 + 60), "1 day 0:01");
        assert_eq!(fmt_uptime(3 * 86400 + 2 * 3600), "3 days 2:00");
    }

    #[test]
    fn bandwidth_formats() {
        assert_eq!(fmt_bandwidth(0), "0 kB");
        assert_eq!(fmt_bandwidth(1023 * 1024), "1023 kB");
        assert_eq!(fmt_bandwidth(1024 * 1024), "1.00 MB");
        assert_eq!(fmt_bandwidth(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
        assert_eq!(fmt_bandwidth(2 * 1024 * 1024 * 1024), "2.00 GB");
    }
}
