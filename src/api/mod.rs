//! Purpose: Define the stable public Rust API boundary for cplrun.
//! Exports: Loading, recipe lookup, execution, and result types needed by the CLI and hosts.
//! Role: Public, additive-only surface; hides raw CPL pointers and the worker protocol.
//! Invariants: Nothing exported here hands out a raw runtime pointer.
//! Invariants: Execution results are plain owned data once `collect` returns.

pub use crate::core::cpl::{CplSymbols, DynamicModule, SymbolSource};
pub use crate::core::envelope::{Envelope, ErrorRecord, ProducedFrame};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorClass, ErrorKind};
pub use crate::core::frames::{Frame, FrameConfig, FrameGroup, TagCount};
pub use crate::core::harness::{
    Diagnostics, ExecState, LogLevel, MemoryDump, PreparedRun, RunRequest, RunningExecution,
    read_envelope,
};
pub use crate::core::library::{LibraryHandle, LibraryRegistry};
pub use crate::core::log::{LogEntry, forward_log, parse_log, read_log};
pub use crate::core::params::{
    ParamConstraint, ParamModes, ParamType, ParamValue, ParameterDescriptor,
};
pub use crate::core::recipe::{Recipe, RecipeSummary, find_plugin, list_plugins};
pub use crate::core::version::{
    CplVersion, SUPPORTED_VERSIONS, Support, TYPE_TAG_BOUNDARY, TypeTags, VERSION_FLOOR, classify,
};
