//! Shared setup for integration tests.
//!
//! `init_tracing()` installs a subscriber once per test binary. Library
//! events only exist with `--features tracing`.
//!
//! - `RUST_LOG`: filter directives. Defaults to split/join decisions only:
//!   `warn,catree::tree::adapt=debug`.
//! - `CATREE_LOG_DIR`: when set, events are also appended as NDJSON to
//!   `$CATREE_LOG_DIR/catree.jsonl`.
//!
//! ```bash
//! CATREE_LOG_DIR=logs RUST_LOG=catree=trace \
//!     cargo test --features tracing --test concurrent_tests hot_spot
//! jq 'select(.fields.message == "joined partitions")' logs/catree.jsonl
//! ```

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

const DEFAULT_FILTER: &str = "warn,catree::tree::adapt=debug";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the test subscriber. Later calls do nothing.
pub fn init_tracing() {
    INIT.call_once(|| {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_names(true)
            .compact()
            .with_filter(filter());

        // Append mode: nextest runs each test in its own process.
        let file_layer = env::var_os("CATREE_LOG_DIR").and_then(|dir| {
            let dir = PathBuf::from(dir);
            std::fs::create_dir_all(&dir).ok()?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("catree.jsonl"))
                .ok()?;

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_thread_ids(true)
                    .json()
                    .with_filter(filter()),
            )
        });

        let _ = Registry::default()
            .with(console_layer)
            .with(file_layer)
            .try_init();
    });
}
