// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod inspect;
pub mod record;
pub mod recover;

use convo_ledger::LedgerConfig;
use std::path::PathBuf;

/// Config file plus the flags every subcommand shares.
pub fn load_config(
    config: Option<PathBuf>,
    log_path: Option<PathBuf>,
    call_id: Option<String>,
) -> anyhow::Result<LedgerConfig> {
    let mut cfg = LedgerConfig::load(config.as_deref())?;
    if let Some(p) = log_path {
        cfg.log_path = p;
    }
    if call_id.is_some() {
        cfg.call_id = call_id;
    }
    Ok(cfg)
}
