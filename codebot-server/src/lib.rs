pub mod agent;
pub mod classifier;
pub mod config;
pub mod gate;
pub mod git;
pub mod github;
pub mod ingest;
pub mod lifecycle;
pub mod poller;
pub mod prompt;
pub mod queue;
pub mod reconciliation;
pub mod reply;
pub mod runner;
pub mod webhook;
pub mod worker;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use codebot_core::store::EventStore;

use crate::gate::DedupGate;
use crate::lifecycle::LifecycleService;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(hash: &str) -> String {
    hash.get(..8).unwrap_or(hash).to_string()
}

pub fn get_bot_version() -> String {
    // A pinned revision wins over the one `built` read from .git
    if let Some(git_hash) = option_env!("CODEBOT_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        built_info::PKG_VERSION.to_string()
    }
}

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub gate: Arc<DedupGate>,
    pub lifecycle: Arc<LifecycleService>,
    pub webhook_secret: Option<String>,
    pub branch_prefix: String,
}
