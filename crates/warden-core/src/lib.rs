//! Core building blocks shared by Warden binaries.
//!
//! The update pipeline, process discovery, and console bridge live here so
//! downstream crates can focus on operator surfaces instead of reimplementing
//! orchestration.

pub mod config;
pub mod console;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod logging;
pub mod privilege;
pub mod process;
pub mod update;

pub use config::{ConfigFormat, WardenConfig, DEFAULT_CONFIG_PATH};
pub use console::{ConsoleBridge, LogTail, ScreenInjector, SessionInjector};
pub use error::{WardenError, WardenResult};
pub use fetch::{HttpFetcher, SourceFetcher};
pub use process::{ProcessLocator, ProcessRecord, ProcessTable, SystemProcessTable, TargetProcess};
pub use update::{
    ApplyOutcome, AtomicWriter, CheckOutcome, ContentValidator, RescueGenerator, UpdateController,
    UpdatePhase, Verdict, WriteOutcome,
};
