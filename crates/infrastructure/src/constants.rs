use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/keel/config.yaml";

// ── Channel capacities ─────────────────────────────────────────────
//
// Both signals coalesce: capacity 1 plus drop-if-full senders means any
// burst collapses into a single pending reconcile pass.

pub const HEALTH_SIGNAL_CAPACITY: usize = 1;
pub const CONFIG_SIGNAL_CAPACITY: usize = 1;

// ── Timeouts ───────────────────────────────────────────────────────

/// Debounce window for config file change events.
pub const CONFIG_WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// How long shutdown waits for the watcher task to wind down.
pub const WATCHER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
