//! Purpose: Enumerate the recipes a module exposes and bind to one by name.
//! Exports: `Recipe`, `RecipeSummary`, `find_plugin`, `list_plugins`.
//! Role: Plugin registry walker sitting between the library handle and the harness.
//! Invariants: A returned `Recipe` has already run its own initializer.
//! Invariants: First exact, case-sensitive name match in enumeration order wins.
//! Invariants: Dropping a `Recipe` deinitializes the plugin and deletes its plugin list.

use std::ptr;

use serde::Serialize;

use crate::core::cpl::sys::{CplPlugin, CplPluginList, CplRecipe};
use crate::core::cpl::{CplSymbols, borrowed_string};
use crate::core::error::{Error, ErrorKind};
use crate::core::frames::{FrameConfig, read_frame_config};
use crate::core::library::LibraryHandle;
use crate::core::params::{ParameterDescriptor, read_parameters};

/// Identity of one recipe as shown in listings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RecipeSummary {
    pub name: String,
    pub version: u64,
    pub version_string: String,
    pub synopsis: String,
}

/// A recipe bound to its library handle and initialized for execution.
pub struct Recipe {
    handle: LibraryHandle,
    list: *mut CplPluginList,
    plugin: *mut CplPlugin,
    frame_config: Option<Vec<FrameConfig>>,
}

// SAFETY: the plugin and its list are only touched through `&self`/`&mut self`, and
// the runtime objects they point at are not tied to the creating thread.
unsafe impl Send for Recipe {}

/// Owns a populated plugin list until it is handed to a `Recipe` or dropped.
struct PluginList<'a> {
    symbols: &'a CplSymbols,
    list: *mut CplPluginList,
}

impl<'a> PluginList<'a> {
    fn populate(handle: &'a LibraryHandle) -> Result<Self, Error> {
        let get_info = handle.plugin_get_info().ok_or_else(|| {
            Error::new(ErrorKind::RecipeNotFound)
                .with_message("module does not export cpl_plugin_get_info")
                .with_path(handle.label())
        })?;
        let symbols = handle.symbols();
        // SAFETY: a fresh list from the runtime is filled by the module's own entry point.
        let list = unsafe {
            let list = (symbols.pluginlist_new)();
            get_info(list);
            list
        };
        Ok(Self { symbols, list })
    }

    fn plugins(&self) -> Vec<*mut CplPlugin> {
        let mut out = Vec::new();
        // SAFETY: the list is live for the lifetime of `self`.
        unsafe {
            let mut plugin = (self.symbols.pluginlist_get_first)(self.list);
            while !plugin.is_null() {
                out.push(plugin);
                plugin = (self.symbols.pluginlist_get_next)(self.list);
            }
        }
        out
    }

    fn into_raw(self) -> *mut CplPluginList {
        let list = self.list;
        std::mem::forget(self);
        list
    }
}

impl Drop for PluginList<'_> {
    fn drop(&mut self) {
        // SAFETY: the list was created by `pluginlist_new` and is released once.
        unsafe { (self.symbols.pluginlist_delete)(self.list) };
    }
}

/// # Safety
/// `plugin` must be a live plugin from a list populated through `symbols`.
unsafe fn plugin_name(symbols: &CplSymbols, plugin: *const CplPlugin) -> Option<String> {
    // SAFETY: plugin is live per the caller contract.
    unsafe { borrowed_string((symbols.plugin_get_name)(plugin)) }
}

/// # Safety
/// `plugin` must be a live plugin from a list populated through `symbols`.
unsafe fn run_plugin_hook(
    getter: crate::core::cpl::sys::PluginFuncGetter,
    plugin: *mut CplPlugin,
) -> Option<i32> {
    // SAFETY: plugin is live per the caller contract.
    unsafe { getter(plugin).map(|hook| hook(plugin)) }
}

/// Binds to the first recipe named `name` and runs its initializer.
pub fn find_plugin(handle: &LibraryHandle, name: &str) -> Result<Recipe, Error> {
    let symbols = handle.symbols();
    let list = PluginList::populate(handle)?;
    let plugin = list
        .plugins()
        .into_iter()
        // SAFETY: every candidate comes from the live list.
        .find(|plugin| unsafe { plugin_name(symbols, *plugin) }.as_deref() == Some(name))
        .ok_or_else(|| {
            Error::new(ErrorKind::RecipeNotFound)
                .with_message(format!("recipe '{name}' not found"))
                .with_path(handle.label())
        })?;

    // SAFETY: the plugin belongs to the live list.
    let status = unsafe { run_plugin_hook(symbols.plugin_get_init, plugin) };
    if let Some(code) = status.filter(|code| *code != 0) {
        return Err(Error::new(ErrorKind::Initialization)
            .with_message(format!("recipe '{name}' initializer returned {code}")));
    }

    let mut recipe = Recipe {
        handle: handle.clone(),
        list: list.into_raw(),
        plugin,
        frame_config: None,
    };
    recipe.frame_config = recipe.load_frame_config()?;
    tracing::debug!(recipe = %name, module = %handle.label(), "bound recipe");
    Ok(recipe)
}

/// Lists every recipe a module exposes, initializing each only long enough to read it.
pub fn list_plugins(handle: &LibraryHandle) -> Result<Vec<RecipeSummary>, Error> {
    let symbols = handle.symbols();
    let list = PluginList::populate(handle)?;
    let mut out = Vec::new();
    for plugin in list.plugins() {
        // SAFETY: the plugin belongs to the live list; init and deinit are paired.
        unsafe {
            run_plugin_hook(symbols.plugin_get_init, plugin);
            out.push(summary(symbols, plugin));
            run_plugin_hook(symbols.plugin_get_deinit, plugin);
        }
    }
    Ok(out)
}

/// # Safety
/// `plugin` must be a live plugin from a list populated through `symbols`.
unsafe fn summary(symbols: &CplSymbols, plugin: *mut CplPlugin) -> RecipeSummary {
    // SAFETY: plugin is live per the caller contract.
    unsafe {
        RecipeSummary {
            name: plugin_name(symbols, plugin).unwrap_or_default(),
            version: (symbols.plugin_get_version)(plugin).into(),
            version_string: owned_version_string(symbols, plugin),
            synopsis: borrowed_string((symbols.plugin_get_synopsis)(plugin)).unwrap_or_default(),
        }
    }
}

/// # Safety
/// `plugin` must be a live plugin from a list populated through `symbols`.
unsafe fn owned_version_string(symbols: &CplSymbols, plugin: *mut CplPlugin) -> String {
    // SAFETY: the returned string is owned by the caller and released with `cpl_free`.
    unsafe {
        let raw = (symbols.plugin_get_version_string)(plugin);
        let text = borrowed_string(raw).unwrap_or_default();
        if !raw.is_null() {
            (symbols.free)(raw.cast());
        }
        text
    }
}

impl LibraryHandle {
    pub fn find_plugin(&self, name: &str) -> Result<Recipe, Error> {
        find_plugin(self, name)
    }

    pub fn list_plugins(&self) -> Result<Vec<RecipeSummary>, Error> {
        list_plugins(self)
    }
}

impl Recipe {
    fn text(&self, getter: crate::core::cpl::sys::PluginStrFn) -> Option<String> {
        // SAFETY: the plugin stays live until `self` is dropped.
        unsafe { borrowed_string(getter(self.plugin)) }
    }

    pub fn library(&self) -> &LibraryHandle {
        &self.handle
    }

    pub fn name(&self) -> String {
        self.text(self.handle.symbols().plugin_get_name)
            .unwrap_or_default()
    }

    pub fn synopsis(&self) -> Option<String> {
        self.text(self.handle.symbols().plugin_get_synopsis)
    }

    pub fn description(&self) -> Option<String> {
        self.text(self.handle.symbols().plugin_get_description)
    }

    pub fn author(&self) -> Option<String> {
        self.text(self.handle.symbols().plugin_get_author)
    }

    pub fn email(&self) -> Option<String> {
        self.text(self.handle.symbols().plugin_get_email)
    }

    pub fn copyright(&self) -> Option<String> {
        self.text(self.handle.symbols().plugin_get_copyright)
    }

    pub fn version(&self) -> u64 {
        // SAFETY: the plugin stays live until `self` is dropped.
        unsafe { (self.handle.symbols().plugin_get_version)(self.plugin) }.into()
    }

    pub fn version_string(&self) -> String {
        // SAFETY: the plugin stays live until `self` is dropped.
        unsafe { owned_version_string(self.handle.symbols(), self.plugin) }
    }

    pub fn summary(&self) -> RecipeSummary {
        // SAFETY: the plugin stays live until `self` is dropped.
        unsafe { summary(self.handle.symbols(), self.plugin) }
    }

    /// Snapshot of the recipe's current parameter schema.
    pub fn parameters(&self) -> Vec<ParameterDescriptor> {
        // SAFETY: the parameter list belongs to the initialized plugin.
        unsafe {
            read_parameters(
                self.handle.symbols(),
                self.handle.type_tags(),
                (*self.recipe_ptr()).parameters,
            )
        }
    }

    /// Declared frame configuration, or `None` when the module has no configuration hook.
    pub fn frame_config(&self) -> Option<&[FrameConfig]> {
        self.frame_config.as_deref()
    }

    pub(crate) fn recipe_ptr(&self) -> *mut CplRecipe {
        self.plugin.cast::<CplRecipe>()
    }

    pub(crate) fn plugin_ptr(&self) -> *mut CplPlugin {
        self.plugin
    }

    pub(crate) fn list_ptr(&self) -> *mut CplPluginList {
        self.list
    }

    fn load_frame_config(&self) -> Result<Option<Vec<FrameConfig>>, Error> {
        let symbols = self.handle.symbols();
        let Some(hook) = symbols.get_recipeconfig else {
            return Ok(None);
        };
        // SAFETY: the hook receives the initialized recipe it was declared for.
        let config = unsafe { hook(self.recipe_ptr()) };
        if config.is_null() {
            return Ok(None);
        }
        // SAFETY: config was just produced by the module's hook and is not freed by us.
        unsafe { read_frame_config(symbols, config) }
            .map(Some)
            .map_err(|err| err.with_path(self.handle.label()))
    }
}

impl Drop for Recipe {
    fn drop(&mut self) {
        if self.plugin.is_null() {
            return;
        }
        let symbols = self.handle.symbols();
        // SAFETY: the plugin was initialized in `find_plugin` and is torn down exactly once.
        unsafe {
            let recipe = self.recipe_ptr();
            (symbols.frameset_delete)((*recipe).frames);
            (*recipe).frames = ptr::null_mut();
            run_plugin_hook(symbols.plugin_get_deinit, self.plugin);
            (symbols.pluginlist_delete)(self.list);
        }
        self.plugin = ptr::null_mut();
        self.list = ptr::null_mut();
    }
}
