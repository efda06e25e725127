//! Device options.
//!
//! Options carry built-in defaults and can be overridden from environment
//! variables prefixed with `GRIDRAID_` (e.g. `GRIDRAID_RELEASE_DELAY_MS=100`).
//! Invalid values are reported with a warning and the default is kept.

use std::time::Duration;

/// Tunables for a device instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// How long a region stays held after its last in-flight write completes
    /// before the release is sent. Batches the grant round trips of
    /// back-to-back writes.
    pub release_delay: Duration,
    /// Bytes of balanced reads a member serves before the round-robin index
    /// advances to the next member.
    pub balance_den: u64,
    /// log2 of the block size. One block is striped into the data fragments
    /// plus the parity fragment.
    pub blocksize_bits: u32,
    /// Identity presented to the server on the data socket.
    pub client_id: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            release_delay: Duration::from_secs(1),
            balance_den: 1 << 21,
            // The host page size.
            blocksize_bits: 12,
            client_id: 6,
        }
    }
}

impl Options {
    /// Built-in defaults with `GRIDRAID_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.read_env_var_settings();
        options
    }

    /// Apply `GRIDRAID_*` environment variables to self.
    pub fn read_env_var_settings(&mut self) {
        if let Some(ms) = parse_env::<u64>("GRIDRAID_RELEASE_DELAY_MS") {
            self.release_delay = Duration::from_millis(ms);
        }
        if let Some(den) = parse_env::<u64>("GRIDRAID_BALANCE_DEN") {
            if den > 0 {
                self.balance_den = den;
            } else {
                warn!("GRIDRAID_BALANCE_DEN must be positive, keeping {}", self.balance_den);
            }
        }
        if let Some(bits) = parse_env::<u32>("GRIDRAID_BLOCKSIZE_BITS") {
            // At least one sector, at most 1 MiB.
            if (9..=20).contains(&bits) {
                self.blocksize_bits = bits;
            } else {
                warn!("GRIDRAID_BLOCKSIZE_BITS {} out of range, keeping {}", bits, self.blocksize_bits);
            }
        }
        if let Some(id) = parse_env::<u32>("GRIDRAID_CLIENT_ID") {
            self.client_id = id;
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    match val.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("ignoring unparsable {}={:?}", name, val);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.release_delay, Duration::from_secs(1));
        assert_eq!(options.balance_den, 1 << 21);
        assert_eq!(options.blocksize_bits, 12);
    }

    #[test]
    fn env_override_and_validation() {
        // Env vars are process-global; run both cases in one test to avoid
        // interference between parallel test threads.
        std::env::set_var("GRIDRAID_RELEASE_DELAY_MS", "250");
        std::env::set_var("GRIDRAID_BLOCKSIZE_BITS", "40");
        let options = Options::from_env();
        assert_eq!(options.release_delay, Duration::from_millis(250));
        // Out-of-range value keeps the default.
        assert_eq!(options.blocksize_bits, 12);
        std::env::remove_var("GRIDRAID_RELEASE_DELAY_MS");
        std::env::remove_var("GRIDRAID_BLOCKSIZE_BITS");
    }
}
