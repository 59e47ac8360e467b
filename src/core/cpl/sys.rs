// Raw C ABI of the CPL runtime: plugin structs, opaque handles, function pointer shapes, constants.
use std::os::raw::{c_char, c_double, c_int, c_longlong, c_uint, c_ulong, c_void};

pub type CplErrorCode = c_int;
pub type CplErrorState = c_int;
pub type CplBoolean = c_int;
pub type CplFrameGroup = c_int;
pub type CplParameterMode = c_int;
pub type CplParameterClass = c_int;
pub type CplType = c_int;
pub type CplMsgSeverity = c_int;
pub type CplSize = c_longlong;

pub type CplPluginList = c_void;
pub type CplFrameset = c_void;
pub type CplFrame = c_void;
pub type CplParameter = c_void;
pub type CplParameterList = c_void;
pub type CplRecipeConfig = c_void;

pub type CplPluginFunc = Option<unsafe extern "C" fn(*mut CplPlugin) -> c_int>;

#[repr(C)]
pub struct CplPlugin {
    pub api: c_uint,
    pub version: c_ulong,
    pub type_: c_ulong,
    pub name: *const c_char,
    pub synopsis: *const c_char,
    pub description: *const c_char,
    pub author: *const c_char,
    pub email: *const c_char,
    pub copyright: *const c_char,
    pub initialize: CplPluginFunc,
    pub execute: CplPluginFunc,
    pub deinitialize: CplPluginFunc,
}

#[repr(C)]
pub struct CplRecipe {
    pub interface: CplPlugin,
    pub parameters: *mut CplParameterList,
    pub frames: *mut CplFrameset,
}

pub type ErrorDumpCallback = unsafe extern "C" fn(c_uint, c_uint, c_uint);

pub type PluginGetInfoFn = unsafe extern "C" fn(*mut CplPluginList) -> c_int;
pub type RecipeConfigHookFn = unsafe extern "C" fn(*mut CplRecipe) -> *mut CplRecipeConfig;

pub type InitFn = unsafe extern "C" fn(c_uint);
pub type VoidFn = unsafe extern "C" fn();
pub type UintFn = unsafe extern "C" fn() -> c_uint;
pub type IntFn = unsafe extern "C" fn() -> c_int;
pub type StrFn = unsafe extern "C" fn() -> *const c_char;
pub type DescriptionFn = unsafe extern "C" fn(c_uint) -> *const c_char;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

pub type PluginStrFn = unsafe extern "C" fn(*const CplPlugin) -> *const c_char;
pub type PluginOwnedStrFn = unsafe extern "C" fn(*const CplPlugin) -> *mut c_char;
pub type PluginFuncGetter = unsafe extern "C" fn(*const CplPlugin) -> CplPluginFunc;
pub type PluginVersionFn = unsafe extern "C" fn(*const CplPlugin) -> c_ulong;

pub type PluginListNewFn = unsafe extern "C" fn() -> *mut CplPluginList;
pub type PluginListDeleteFn = unsafe extern "C" fn(*mut CplPluginList);
pub type PluginListFindFn =
    unsafe extern "C" fn(*mut CplPluginList, *const c_char) -> *mut CplPlugin;
pub type PluginListIterFn = unsafe extern "C" fn(*mut CplPluginList) -> *mut CplPlugin;

pub type FramesetStatusFn = unsafe extern "C" fn(*mut CplFrameset) -> CplErrorCode;
pub type SignProductsFn = unsafe extern "C" fn(*const CplFrameset, c_uint) -> CplErrorCode;

/// `cpl_msg_error(component, format, ...)`; called with a single `%s` argument.
pub type MsgErrorFn = unsafe extern "C" fn(*const c_char, *const c_char, ...);
/// `cpl_error_set_message_macro(function, code, file, line, format, ...)`.
pub type ErrorSetMessageFn = unsafe extern "C" fn(
    *const c_char,
    CplErrorCode,
    *const c_char,
    c_uint,
    *const c_char,
    ...
) -> CplErrorCode;
pub type ErrorStateDumpFn =
    unsafe extern "C" fn(CplErrorState, CplBoolean, Option<ErrorDumpCallback>);

pub type FrameNewFn = unsafe extern "C" fn() -> *mut CplFrame;
pub type FrameDeleteFn = unsafe extern "C" fn(*mut CplFrame);
pub type FrameGetStrFn = unsafe extern "C" fn(*const CplFrame) -> *const c_char;
pub type FrameGetGroupFn = unsafe extern "C" fn(*const CplFrame) -> CplFrameGroup;
pub type FrameSetStrFn = unsafe extern "C" fn(*mut CplFrame, *const c_char) -> CplErrorCode;
pub type FrameSetGroupFn = unsafe extern "C" fn(*mut CplFrame, CplFrameGroup) -> CplErrorCode;

pub type FramesetNewFn = unsafe extern "C" fn() -> *mut CplFrameset;
pub type FramesetDeleteFn = unsafe extern "C" fn(*mut CplFrameset);
pub type FramesetGetSizeFn = unsafe extern "C" fn(*const CplFrameset) -> CplSize;
pub type FramesetGetPositionFn = unsafe extern "C" fn(*mut CplFrameset, CplSize) -> *mut CplFrame;
pub type FramesetInsertFn = unsafe extern "C" fn(*mut CplFrameset, *mut CplFrame) -> CplErrorCode;

pub type MsgSetLevelFn = unsafe extern "C" fn(CplMsgSeverity);
pub type MsgSetLogLevelFn = unsafe extern "C" fn(CplMsgSeverity) -> CplErrorCode;
pub type MsgSetLogNameFn = unsafe extern "C" fn(*const c_char) -> CplErrorCode;
pub type MsgStopLogFn = unsafe extern "C" fn() -> CplErrorCode;

pub type ParamStrFn = unsafe extern "C" fn(*const CplParameter) -> *const c_char;
pub type ParamAliasFn = unsafe extern "C" fn(*const CplParameter, CplParameterMode) -> *const c_char;
pub type ParamClassFn = unsafe extern "C" fn(*const CplParameter) -> CplParameterClass;
pub type ParamTypeFn = unsafe extern "C" fn(*const CplParameter) -> CplType;
pub type ParamIntFn = unsafe extern "C" fn(*const CplParameter) -> c_int;
pub type ParamDoubleFn = unsafe extern "C" fn(*const CplParameter) -> c_double;
pub type ParamEnumIntFn = unsafe extern "C" fn(*const CplParameter, c_int) -> c_int;
pub type ParamEnumDoubleFn = unsafe extern "C" fn(*const CplParameter, c_int) -> c_double;
pub type ParamEnumStrFn = unsafe extern "C" fn(*const CplParameter, c_int) -> *const c_char;
pub type ParamEnabledFn = unsafe extern "C" fn(*const CplParameter, CplParameterMode) -> c_int;
pub type ParamSetIntFn = unsafe extern "C" fn(*mut CplParameter, c_int) -> CplErrorCode;
pub type ParamSetDoubleFn = unsafe extern "C" fn(*mut CplParameter, c_double) -> CplErrorCode;
pub type ParamSetStrFn = unsafe extern "C" fn(*mut CplParameter, *const c_char) -> CplErrorCode;

pub type ParamListDeleteFn = unsafe extern "C" fn(*mut CplParameterList);
pub type ParamListFindFn =
    unsafe extern "C" fn(*mut CplParameterList, *const c_char) -> *mut CplParameter;
pub type ParamListIterFn = unsafe extern "C" fn(*mut CplParameterList) -> *mut CplParameter;
pub type ParamListSizeFn = unsafe extern "C" fn(*const CplParameterList) -> CplSize;

pub type RecipeConfigListFn = unsafe extern "C" fn(*const CplRecipeConfig) -> *mut *mut c_char;
pub type RecipeConfigTagListFn =
    unsafe extern "C" fn(*const CplRecipeConfig, *const c_char) -> *mut *mut c_char;
pub type RecipeConfigCountFn =
    unsafe extern "C" fn(*const CplRecipeConfig, *const c_char, *const c_char) -> CplSize;

pub const CPL_INIT_DEFAULT: c_uint = 0;
pub const CPL_DESCRIPTION_DEFAULT: c_uint = 0;

pub const CPL_MSG_DEBUG: CplMsgSeverity = 0;
pub const CPL_MSG_INFO: CplMsgSeverity = 1;
pub const CPL_MSG_WARNING: CplMsgSeverity = 2;
pub const CPL_MSG_ERROR: CplMsgSeverity = 3;
pub const CPL_MSG_OFF: CplMsgSeverity = 4;

pub const CPL_FALSE: CplBoolean = 0;

pub const CPL_ERROR_NONE: CplErrorCode = 0;
pub const CPL_ERROR_FILE_NOT_CREATED: CplErrorCode = 8;

pub const CPL_FRAME_GROUP_NONE: CplFrameGroup = 0;
pub const CPL_FRAME_GROUP_RAW: CplFrameGroup = 1;
pub const CPL_FRAME_GROUP_CALIB: CplFrameGroup = 2;
pub const CPL_FRAME_GROUP_PRODUCT: CplFrameGroup = 3;

pub const CPL_PARAMETER_CLASS_RANGE: CplParameterClass = 1 << 2;
pub const CPL_PARAMETER_CLASS_ENUM: CplParameterClass = 1 << 3;

pub const CPL_PARAMETER_MODE_CLI: CplParameterMode = 1 << 0;
pub const CPL_PARAMETER_MODE_ENV: CplParameterMode = 1 << 1;
pub const CPL_PARAMETER_MODE_CFG: CplParameterMode = 1 << 2;

pub const CPL_DFS_SIGNATURE_DATAMD5: c_uint = 1 << 0;
pub const CPL_DFS_SIGNATURE_CHECKSUM: c_uint = 1 << 1;

