//! Small stateless helpers shared across the router crates.

use std::time::Duration;

pub mod panic_guard;
pub mod shutdown;

/// Builds the canonical map key for a tablet: hostname followed by each
/// `name:port` pair, sorted, comma-joined. Grounded on the original
/// `TabletToMapKey`: `parts := sort(name:port for name,port in portMap);
/// parts := [hostname] + parts; join(",")`.
pub fn tablet_map_key<'a>(hostname: &str, ports: impl IntoIterator<Item = (&'a str, u16)>) -> String {
    let mut parts: Vec<String> = ports.into_iter().map(|(name, port)| format!("{name}:{port}")).collect();
    parts.sort();
    parts.insert(0, hostname.to_string());
    parts.join(",")
}

/// A doubling backoff sequence, starting at `base` and capped at `max`.
/// Resetting returns the iterator to its starting state, matching the probe
/// state machine's "resets to the base delay after any successful message"
/// rule.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Returns the delay to wait before the next retry, then doubles the
    /// internal counter (capped at `max`) for the following call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
