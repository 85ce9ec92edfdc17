#![deny(unsafe_code)]

//! Search client: runs one search at a time against the knowledge backend,
//! files finished searches into history and exposes everything through a
//! small CLI.

pub mod cli;
pub mod error;
pub mod session;
pub mod settings;

pub use error::{CliError, CliResult, SessionError, SessionResult, SettingsError};
pub use session::{PendingSearch, SearchObserver, SearchOutcome, SearchProgress, SearchSession};
pub use settings::{ClientSettings, SettingsStore};
