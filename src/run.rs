//! Run orchestration
//! Builds the shared payload and broker, waits out the run, reports totals

use std::sync::Arc;

use tracing::info;

use crate::broker::Broker;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::EngineError;
use crate::payload;
use crate::stats::{GlobalSnapshot, GlobalStats};

/// Final outcome of a traffic run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub snapshot: GlobalSnapshot,
    pub all_succeeded: bool,
}

impl RunSummary {
    /// Process exit code: zero only when every connection succeeded
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded {
            0
        } else {
            1
        }
    }
}

/// Execute one full traffic run to completion (or cancellation)
pub fn run(config: Config, cancel: CancelToken) -> Result<RunSummary, EngineError> {
    let config = Arc::new(config.validated()?);

    // build the shared pattern buffer before any connection can touch it
    let _ = payload::byte_at(0);

    let global = Arc::new(GlobalStats::new());
    global.start();

    let mut broker = Broker::new(Arc::clone(&config), cancel, Arc::clone(&global))?;
    broker.run_to_completion();

    let snapshot = global.snapshot();
    info!(
        connections = snapshot.connections_completed + snapshot.connections_failed,
        failed = snapshot.connections_failed,
        bytes_sent = snapshot.bytes_sent,
        bytes_recv = snapshot.bytes_recv,
        elapsed = ?snapshot.duration,
        mbps = format!("{:.2}", snapshot.mbps()),
        "run complete"
    );

    Ok(RunSummary {
        all_succeeded: snapshot.connections_failed == 0,
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_rejected() {
        // connect role with no targets
        let result = run(Config::default(), CancelToken::new());
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn exit_codes_follow_outcome() {
        let ok = RunSummary {
            snapshot: GlobalSnapshot::default(),
            all_succeeded: true,
        };
        assert_eq!(ok.exit_code(), 0);
        let bad = RunSummary {
            snapshot: GlobalSnapshot::default(),
            all_succeeded: false,
        };
        assert_eq!(bad.exit_code(), 1);
    }
}
