//! Purpose: Turn a loaded module into one shared, immutable CPL capability handle.
//! Exports: `LibraryRegistry`, `LibraryHandle`.
//! Role: Library adapter; every recipe lookup starts from a handle built here.
//! Invariants: One `CplLibrary` per `cpl_init` address per registry, built at most once.
//! Invariants: The runtime initializer runs exactly once, before the handle is published.
//! Invariants: Registries are append-only; handles keep their backing modules loaded.
//! Invariants: A runtime rejected for its version is remembered and never initialized again.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::cpl::sys::{CPL_DESCRIPTION_DEFAULT, CPL_INIT_DEFAULT, PluginGetInfoFn};
use crate::core::cpl::{CplSymbols, DynamicModule, SymbolSource, borrowed_string};
use crate::core::error::{Error, ErrorKind};
use crate::core::version::{CplVersion, Support, TypeTags, VERSION_FLOOR, classify};

/// Shared runtime state for every module that resolves to the same `cpl_init`.
struct CplLibrary {
    symbols: CplSymbols,
    version: CplVersion,
    version_string: String,
    description: String,
    support: Support,
    type_tags: TypeTags,
    _source: Arc<dyn SymbolSource>,
}

/// Registry slot for one `cpl_init` address.
enum Runtime {
    Ready(Arc<CplLibrary>),
    BelowFloor(CplVersion),
}

/// One opened module: its own plugin entry point plus the loader reference keeping it mapped.
struct ModuleImage {
    label: String,
    plugin_get_info: Option<PluginGetInfoFn>,
    _source: Arc<dyn SymbolSource>,
}

/// Capability handle for one loaded module, cheap to clone.
#[derive(Clone)]
pub struct LibraryHandle {
    library: Arc<CplLibrary>,
    module: Arc<ModuleImage>,
}

impl LibraryHandle {
    pub fn symbols(&self) -> &CplSymbols {
        &self.library.symbols
    }

    pub fn version(&self) -> CplVersion {
        self.library.version
    }

    pub fn version_string(&self) -> &str {
        &self.library.version_string
    }

    pub fn description(&self) -> &str {
        &self.library.description
    }

    pub fn support(&self) -> Support {
        self.library.support
    }

    pub fn type_tags(&self) -> &TypeTags {
        &self.library.type_tags
    }

    /// Path or label the module was opened from.
    pub fn label(&self) -> &str {
        &self.module.label
    }

    /// Whether both handles share one runtime adapter (and thus one symbol table).
    pub fn same_library(&self, other: &LibraryHandle) -> bool {
        Arc::ptr_eq(&self.library, &other.library)
    }

    pub(crate) fn plugin_get_info(&self) -> Option<PluginGetInfoFn> {
        self.module.plugin_get_info
    }
}

/// Process-owned cache of CPL runtimes keyed by the address of `cpl_init`.
#[derive(Default)]
pub struct LibraryRegistry {
    libraries: Mutex<HashMap<usize, Runtime>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<LibraryHandle, Error> {
        let path = path.as_ref();
        let module = DynamicModule::open(path)?;
        let label = module.path().display().to_string();
        self.load_from_source(label, Arc::new(module))
            .map_err(|err| {
                if err.path().is_some() {
                    err
                } else {
                    err.with_path(path)
                }
            })
    }

    pub fn load_from_source(
        &self,
        label: impl Into<String>,
        source: Arc<dyn SymbolSource>,
    ) -> Result<LibraryHandle, Error> {
        let label = label.into();
        let init = source.resolve(c"cpl_init").ok_or_else(|| {
            Error::new(ErrorKind::NotACompatibleModule)
                .with_message("module does not export cpl_init")
                .with_hint("Recipe modules must be linked against the CPL runtime.")
        })?;
        let key = init as usize;

        let library = {
            let mut libraries = self
                .libraries
                .lock()
                .map_err(|_| Error::new(ErrorKind::Internal).with_message("library registry poisoned"))?;
            if !libraries.contains_key(&key) {
                let built = build_library(&label, Arc::clone(&source))?;
                libraries.insert(key, built);
            } else {
                tracing::debug!(module = %label, "reusing cached CPL runtime");
            }
            match libraries.get(&key) {
                Some(Runtime::Ready(library)) => Arc::clone(library),
                Some(Runtime::BelowFloor(version)) => return Err(below_floor(*version)),
                None => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_message("library registry lost an entry"));
                }
            }
        };

        let plugin_get_info = resolve_plugin_get_info(source.as_ref());
        Ok(LibraryHandle {
            library,
            module: Arc::new(ModuleImage {
                label,
                plugin_get_info,
                _source: source,
            }),
        })
    }

    /// Number of distinct usable runtimes cached so far.
    pub fn len(&self) -> usize {
        self.libraries
            .lock()
            .map(|libraries| {
                libraries
                    .values()
                    .filter(|runtime| matches!(runtime, Runtime::Ready(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn resolve_plugin_get_info(source: &dyn SymbolSource) -> Option<PluginGetInfoFn> {
    let address: *const c_void = source.resolve(c"cpl_plugin_get_info")?;
    // SAFETY: cpl_plugin_get_info has the `int (*)(cpl_pluginlist *)` signature in every release.
    Some(unsafe { std::mem::transmute::<*const c_void, PluginGetInfoFn>(address) })
}

fn below_floor(version: CplVersion) -> Error {
    Error::new(ErrorKind::VersionBelowFloor)
        .with_message(format!(
            "CPL {version} is older than the supported floor {VERSION_FLOOR}"
        ))
        .with_hint("Rebuild the recipe against a newer CPL release.")
}

fn build_library(label: &str, source: Arc<dyn SymbolSource>) -> Result<Runtime, Error> {
    let symbols = CplSymbols::bind(source.as_ref())?;

    // SAFETY: all symbols were bound from the same runtime; init takes a flag word.
    unsafe { (symbols.init)(CPL_INIT_DEFAULT) };

    // SAFETY: version and description getters take no arguments and return static data.
    let (version, version_string, description) = unsafe {
        (
            CplVersion::new(
                (symbols.version_get_major)(),
                (symbols.version_get_minor)(),
                (symbols.version_get_micro)(),
            ),
            borrowed_string((symbols.version_get_version)()).unwrap_or_default(),
            borrowed_string((symbols.get_description)(CPL_DESCRIPTION_DEFAULT)).unwrap_or_default(),
        )
    };

    if version < VERSION_FLOOR {
        tracing::debug!(module = %label, %version, "rejecting CPL runtime below the floor");
        // SAFETY: pairs the init above; the runtime is not used again.
        unsafe { (symbols.end)() };
        return Ok(Runtime::BelowFloor(version));
    }

    let support = classify(version);
    match support {
        Support::KnownExact => tracing::debug!(module = %label, %version, "loaded CPL runtime"),
        Support::KnownMajor => {
            tracing::debug!(module = %label, %version, "CPL version matches a known major release")
        }
        Support::Unknown => {
            tracing::warn!(module = %label, %version, "CPL version is not in the supported list")
        }
    }

    Ok(Runtime::Ready(Arc::new(CplLibrary {
        symbols,
        version,
        version_string,
        description,
        support,
        type_tags: TypeTags::for_version(version),
        _source: source,
    })))
}
