//! Purpose: Bind the CPL runtime's exported functions into one typed capability table.
//! Exports: `SymbolSource`, `DynamicModule`, `CplSymbols`.
//! Role: The only place where untyped loader addresses become typed function pointers.
//! Invariants: Every required symbol resolves or the whole bind fails with `IncompleteAbi`.
//! Invariants: Optional symbols are recorded as `None` and never fail a bind.
//! Invariants: Alias lists are tried in order; the first name is the canonical one.

use std::ffi::CStr;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};

use super::sys::*;
use crate::core::error::{Error, ErrorKind};

/// Resolves exported symbol names to addresses.
///
/// Production code resolves through the dynamic loader; tests can back this
/// with a table of in-process functions.
pub trait SymbolSource: Send + Sync {
    fn resolve(&self, name: &CStr) -> Option<*const c_void>;
}

/// A shared object opened through the platform dynamic loader.
pub struct DynamicModule {
    path: PathBuf,
    library: libloading::Library,
}

impl DynamicModule {
    pub fn open(path: &Path) -> Result<Self, Error> {
        // SAFETY: opening a module runs its initializers; recipe modules are trusted plugins.
        let library = unsafe { libloading::Library::new(path) }.map_err(|err| {
            Error::new(ErrorKind::ModuleNotFound)
                .with_message("cannot open shared library")
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolSource for DynamicModule {
    fn resolve(&self, name: &CStr) -> Option<*const c_void> {
        // SAFETY: the address is only reinterpreted through the signatures declared in `sys`.
        let symbol = unsafe {
            self.library
                .get::<*const c_void>(name.to_bytes_with_nul())
                .ok()?
        };
        let address = *symbol;
        (!address.is_null()).then_some(address)
    }
}

fn resolve_as<T: Copy>(source: &dyn SymbolSource, names: &[&CStr]) -> Option<T> {
    debug_assert_eq!(size_of::<T>(), size_of::<*const c_void>());
    let address = names.iter().find_map(|name| source.resolve(name))?;
    // SAFETY: T is always one of the `extern "C" fn` pointer aliases from `sys`.
    Some(unsafe { std::mem::transmute_copy::<*const c_void, T>(&address) })
}

macro_rules! cpl_symbols {
    (
        required { $( $field:ident : $ty:ty = [ $( $name:literal ),+ ] ; )* }
        optional { $( $ofield:ident : $oty:ty = [ $( $oname:literal ),+ ] ; )* }
    ) => {
        /// Typed function pointers for one CPL runtime build.
        #[derive(Clone, Copy)]
        pub struct CplSymbols {
            $( pub $field: $ty, )*
            $( pub $ofield: Option<$oty>, )*
        }

        impl CplSymbols {
            /// Canonical names of every symbol a module must export.
            pub const REQUIRED: &'static [&'static CStr] = &[ $( [ $( $name ),+ ][0], )* ];

            /// Canonical names of the symbols that may be absent.
            pub const OPTIONAL: &'static [&'static CStr] = &[ $( [ $( $oname ),+ ][0], )* ];

            pub fn bind(source: &dyn SymbolSource) -> Result<Self, Error> {
                let mut missing: Vec<&'static CStr> = Vec::new();
                $(
                    let $field: Option<$ty> = resolve_as(source, &[ $( $name ),+ ]);
                    if $field.is_none() {
                        missing.push([ $( $name ),+ ][0]);
                    }
                )*
                match ( $( $field, )* ) {
                    ( $( Some($field), )* ) => Ok(Self {
                        $( $field, )*
                        $( $ofield: resolve_as(source, &[ $( $oname ),+ ]), )*
                    }),
                    _ => Err(incomplete_abi(&missing)),
                }
            }

            /// Availability of each optional capability, by canonical symbol name.
            pub fn optional_capabilities(&self) -> Vec<(&'static str, bool)> {
                vec![ $( (
                    [ $( $oname ),+ ][0].to_str().unwrap_or_default(),
                    self.$ofield.is_some(),
                ), )* ]
            }
        }
    };
}

fn incomplete_abi(missing: &[&CStr]) -> Error {
    let names = missing
        .iter()
        .map(|name| name.to_string_lossy())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::IncompleteAbi)
        .with_message(format!("missing required symbols: {names}"))
        .with_hint("The module was built against a CPL release this runner has no mapping for.")
}

cpl_symbols! {
    required {
        init: InitFn = [c"cpl_init"];
        end: VoidFn = [c"cpl_end"];
        get_description: DescriptionFn = [c"cpl_get_description"];
        version_get_major: UintFn = [c"cpl_version_get_major"];
        version_get_minor: UintFn = [c"cpl_version_get_minor"];
        version_get_micro: UintFn = [c"cpl_version_get_micro"];
        version_get_version: StrFn = [c"cpl_version_get_version"];
        memory_dump: VoidFn = [c"cpl_memory_dump"];
        memory_is_empty: IntFn = [c"cpl_memory_is_empty"];
        free: FreeFn = [c"cpl_free"];

        plugin_get_author: PluginStrFn = [c"cpl_plugin_get_author"];
        plugin_get_copyright: PluginStrFn = [c"cpl_plugin_get_copyright"];
        plugin_get_deinit: PluginFuncGetter = [c"cpl_plugin_get_deinit"];
        plugin_get_description: PluginStrFn = [c"cpl_plugin_get_description"];
        plugin_get_email: PluginStrFn = [c"cpl_plugin_get_email"];
        plugin_get_exec: PluginFuncGetter = [c"cpl_plugin_get_exec"];
        plugin_get_init: PluginFuncGetter = [c"cpl_plugin_get_init"];
        plugin_get_name: PluginStrFn = [c"cpl_plugin_get_name"];
        plugin_get_synopsis: PluginStrFn = [c"cpl_plugin_get_synopsis"];
        plugin_get_version: PluginVersionFn = [c"cpl_plugin_get_version"];
        plugin_get_version_string: PluginOwnedStrFn = [c"cpl_plugin_get_version_string"];
        pluginlist_delete: PluginListDeleteFn = [c"cpl_pluginlist_delete"];
        pluginlist_find: PluginListFindFn = [c"cpl_pluginlist_find"];
        pluginlist_get_first: PluginListIterFn = [c"cpl_pluginlist_get_first"];
        pluginlist_get_next: PluginListIterFn = [c"cpl_pluginlist_get_next"];
        pluginlist_new: PluginListNewFn = [c"cpl_pluginlist_new"];

        dfs_update_product_header: FramesetStatusFn = [c"cpl_dfs_update_product_header"];

        msg_error: MsgErrorFn = [c"cpl_msg_error"];
        error_get_code: IntFn = [c"cpl_error_get_code"];
        error_get_file: StrFn = [c"cpl_error_get_file"];
        error_get_function: StrFn = [c"cpl_error_get_function"];
        error_get_line: UintFn = [c"cpl_error_get_line"];
        error_get_message: StrFn = [c"cpl_error_get_message"];
        error_reset: VoidFn = [c"cpl_error_reset"];
        error_set_message_macro: ErrorSetMessageFn = [c"cpl_error_set_message_macro"];
        errorstate_dump: ErrorStateDumpFn = [c"cpl_errorstate_dump"];
        errorstate_get: IntFn = [c"cpl_errorstate_get"];

        frame_get_filename: FrameGetStrFn = [c"cpl_frame_get_filename"];
        frame_get_group: FrameGetGroupFn = [c"cpl_frame_get_group"];
        frame_get_tag: FrameGetStrFn = [c"cpl_frame_get_tag"];
        frame_new: FrameNewFn = [c"cpl_frame_new"];
        frame_set_filename: FrameSetStrFn = [c"cpl_frame_set_filename"];
        frame_set_tag: FrameSetStrFn = [c"cpl_frame_set_tag"];
        frameset_delete: FramesetDeleteFn = [c"cpl_frameset_delete"];
        frameset_get_position: FramesetGetPositionFn =
            [c"cpl_frameset_get_position", c"cpl_frameset_get_frame"];
        frameset_get_size: FramesetGetSizeFn = [c"cpl_frameset_get_size"];
        frameset_insert: FramesetInsertFn = [c"cpl_frameset_insert"];
        frameset_new: FramesetNewFn = [c"cpl_frameset_new"];

        msg_set_level: MsgSetLevelFn = [c"cpl_msg_set_level"];
        msg_set_log_level: MsgSetLogLevelFn = [c"cpl_msg_set_log_level"];
        msg_set_log_name: MsgSetLogNameFn = [c"cpl_msg_set_log_name"];
        msg_stop_log: MsgStopLogFn = [c"cpl_msg_stop_log"];

        parameter_get_alias: ParamAliasFn = [c"cpl_parameter_get_alias"];
        parameter_get_class: ParamClassFn = [c"cpl_parameter_get_class"];
        parameter_get_context: ParamStrFn = [c"cpl_parameter_get_context"];
        parameter_get_default_bool: ParamIntFn = [c"cpl_parameter_get_default_bool"];
        parameter_get_default_double: ParamDoubleFn = [c"cpl_parameter_get_default_double"];
        parameter_get_default_int: ParamIntFn = [c"cpl_parameter_get_default_int"];
        parameter_get_default_string: ParamStrFn = [c"cpl_parameter_get_default_string"];
        parameter_get_enum_double: ParamEnumDoubleFn = [c"cpl_parameter_get_enum_double"];
        parameter_get_enum_int: ParamEnumIntFn = [c"cpl_parameter_get_enum_int"];
        parameter_get_enum_size: ParamIntFn = [c"cpl_parameter_get_enum_size"];
        parameter_get_enum_string: ParamEnumStrFn = [c"cpl_parameter_get_enum_string"];
        parameter_get_help: ParamStrFn = [c"cpl_parameter_get_help"];
        parameter_get_name: ParamStrFn = [c"cpl_parameter_get_name"];
        parameter_get_range_max_double: ParamDoubleFn = [c"cpl_parameter_get_range_max_double"];
        parameter_get_range_max_int: ParamIntFn = [c"cpl_parameter_get_range_max_int"];
        parameter_get_range_min_double: ParamDoubleFn = [c"cpl_parameter_get_range_min_double"];
        parameter_get_range_min_int: ParamIntFn = [c"cpl_parameter_get_range_min_int"];
        parameter_get_type: ParamTypeFn = [c"cpl_parameter_get_type"];
        parameter_is_enabled: ParamEnabledFn = [c"cpl_parameter_is_enabled"];
        parameter_set_bool: ParamSetIntFn = [c"cpl_parameter_set_bool"];
        parameter_set_double: ParamSetDoubleFn = [c"cpl_parameter_set_double"];
        parameter_set_int: ParamSetIntFn = [c"cpl_parameter_set_int"];
        parameter_set_string: ParamSetStrFn = [c"cpl_parameter_set_string"];
        parameterlist_delete: ParamListDeleteFn = [c"cpl_parameterlist_delete"];
        parameterlist_find: ParamListFindFn = [c"cpl_parameterlist_find"];
        parameterlist_get_first: ParamListIterFn = [c"cpl_parameterlist_get_first"];
        parameterlist_get_next: ParamListIterFn = [c"cpl_parameterlist_get_next"];
        parameterlist_get_size: ParamListSizeFn = [c"cpl_parameterlist_get_size"];

        recipeconfig_get_inputs: RecipeConfigTagListFn = [c"cpl_recipeconfig_get_inputs"];
        recipeconfig_get_max_count: RecipeConfigCountFn = [c"cpl_recipeconfig_get_max_count"];
        recipeconfig_get_min_count: RecipeConfigCountFn = [c"cpl_recipeconfig_get_min_count"];
        recipeconfig_get_outputs: RecipeConfigTagListFn = [c"cpl_recipeconfig_get_outputs"];
        recipeconfig_get_tags: RecipeConfigListFn = [c"cpl_recipeconfig_get_tags"];
    }
    optional {
        dfs_sign_products: SignProductsFn = [c"cpl_dfs_sign_products"];
        get_recipeconfig: RecipeConfigHookFn = [c"muse_processing_get_recipeconfig"];
        frame_set_group: FrameSetGroupFn = [c"cpl_frame_set_group"];
    }
}
