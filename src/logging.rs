// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters come from the `GC_LOG` environment variable (comma-separated
//! `target=level` directives, default level `info`); output is human-readable
//! unless `GC_LOG_JSONL=1` selects JSONL. Initialization is guarded so
//! library consumers and tests can call [`init`] freely.

use std::sync::Once;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// ENV used to set log filters.
const FILTER_ENV: &str = "GC_LOG";

/// ENV selecting JSONL output.
const JSONL_ENV: &str = "GC_LOG_JSONL";

/// Default log level when `GC_LOG` is unset.
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Idempotent.
pub fn init() {
    INIT.call_once(setup);
}

fn setup() {
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

    let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);

    if jsonl {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .init();
    }
}
