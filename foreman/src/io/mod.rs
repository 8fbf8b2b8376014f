//! Side-effecting adapters: config file, ledger files, tracker and agent CLIs.

pub mod config;
pub mod issue_store;
pub mod ledger;
pub mod process;
pub mod prompt;
pub mod provider;
