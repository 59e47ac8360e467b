use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Io,
    ModuleNotFound,
    NotACompatibleModule,
    IncompleteAbi,
    VersionBelowFloor,
    RecipeNotFound,
    MalformedConfig,
    Initialization,
    RecipeCrashed,
    SpawnFailed,
    Decode,
}

/// Coarse grouping used by hosts to decide how to react to a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The module cannot be used at all; never retried.
    Load,
    /// The module loaded but the requested recipe or its declared schema is unusable.
    Schema,
    /// Inputs left the runtime in a dirty state before any worker was spawned.
    Initialization,
    /// No structured diagnosis is available from the worker.
    Crash,
    Host,
}

impl ErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::ModuleNotFound
            | ErrorKind::NotACompatibleModule
            | ErrorKind::IncompleteAbi
            | ErrorKind::VersionBelowFloor => ErrorClass::Load,
            ErrorKind::RecipeNotFound | ErrorKind::MalformedConfig => ErrorClass::Schema,
            ErrorKind::Initialization => ErrorClass::Initialization,
            ErrorKind::RecipeCrashed | ErrorKind::SpawnFailed | ErrorKind::Decode => {
                ErrorClass::Crash
            }
            ErrorKind::Internal | ErrorKind::Usage | ErrorKind::Io => ErrorClass::Host,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    signal: Option<i32>,
    backtrace: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            signal: None,
            backtrace: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// Signal that terminated the worker, when the crash was signal-driven.
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// Contents of the forensic backtrace file left by the crash handler.
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(signal) = self.signal {
            write!(f, " (signal: {signal})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Io => 3,
        ErrorKind::ModuleNotFound => 4,
        ErrorKind::NotACompatibleModule => 5,
        ErrorKind::IncompleteAbi => 6,
        ErrorKind::VersionBelowFloor => 7,
        ErrorKind::RecipeNotFound => 8,
        ErrorKind::MalformedConfig => 9,
        ErrorKind::Initialization => 10,
        ErrorKind::RecipeCrashed => 11,
        ErrorKind::SpawnFailed => 12,
        ErrorKind::Decode => 13,
    }
}
