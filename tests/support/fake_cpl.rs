// In-process stand-in for a CPL runtime plus the `rtest` recipe module.
//
// State lives in thread-locals so parallel tests stay isolated and a forked worker
// inherits exactly the state of the test that spawned it. The variadic CPL entry
// points are defined with their fixed arguments only; that matches the calling
// convention on x86-64 and aarch64 Linux.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io::Write;
use std::os::raw::{c_char, c_double, c_int, c_longlong, c_uint, c_ulong, c_void};
use std::path::PathBuf;
use std::ptr;

use cplrun::api::{CplVersion, ParamType, SymbolSource, TypeTags};
use cplrun::core::cpl::sys::{CplPlugin, CplPluginFunc, CplRecipe, ErrorDumpCallback};

pub const CPL_ERROR_ILLEGAL_INPUT: c_int = 13;
pub const FRAME_GROUP_PRODUCT: c_int = 3;
const CLASS_VALUE: c_int = 1 << 1;
const CLASS_RANGE: c_int = 1 << 2;
const CLASS_ENUM: c_int = 1 << 3;
const MODE_CLI: c_int = 1 << 0;

struct FakeError {
    code: c_int,
    line: c_uint,
    message: CString,
    file: CString,
    function: CString,
}

struct Runtime {
    version: (c_uint, c_uint, c_uint),
    version_string: CString,
    init_calls: u32,
    errors: Vec<FakeError>,
    current: Option<usize>,
    leaked: bool,
    malformed_config: bool,
    log_file: Option<PathBuf>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            version: (7, 2, 0),
            version_string: c"7.2.0".to_owned(),
            init_calls: 0,
            errors: Vec::new(),
            current: None,
            leaked: false,
            malformed_config: false,
            log_file: None,
        }
    }
}

thread_local! {
    static RUNTIME: RefCell<Runtime> = RefCell::new(Runtime::default());
}

pub fn set_version(major: u32, minor: u32, micro: u32) {
    RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        rt.version = (major, minor, micro);
        rt.version_string = CString::new(format!("{major}.{minor}.{micro}")).expect("cstring");
    });
}

pub fn init_calls() -> u32 {
    RUNTIME.with(|rt| rt.borrow().init_calls)
}

pub fn set_malformed_config(malformed: bool) {
    RUNTIME.with(|rt| rt.borrow_mut().malformed_config = malformed);
}

fn current_tags() -> TypeTags {
    let (major, minor, micro) = RUNTIME.with(|rt| rt.borrow().version);
    TypeTags::for_version(CplVersion::new(major, minor, micro))
}

fn push_error(code: c_int, line: c_uint, message: &str, file: &str, function: &str) {
    let cstring = |text: &str| CString::new(text.replace('\0', "")).expect("cstring");
    RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        rt.errors.push(FakeError {
            code,
            line,
            message: cstring(message),
            file: cstring(file),
            function: cstring(function),
        });
        rt.current = None;
    });
}

/// Reads a field of the error being dumped, or of the newest error.
fn with_current_error<T>(default: T, read: impl FnOnce(&FakeError) -> T) -> T {
    RUNTIME.with(|rt| {
        let rt = rt.borrow();
        let index = rt.current.or_else(|| rt.errors.len().checked_sub(1));
        index.and_then(|i| rt.errors.get(i)).map(read).unwrap_or(default)
    })
}

unsafe fn text<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        return "";
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("")
}

fn strdup(value: &CStr) -> *mut c_char {
    unsafe { libc::strdup(value.as_ptr()) }
}

fn string_list(values: &[&CStr]) -> *mut *mut c_char {
    unsafe {
        let list = libc::calloc(values.len() + 1, size_of::<*mut c_char>()).cast::<*mut c_char>();
        for (i, value) in values.iter().enumerate() {
            *list.add(i) = strdup(value);
        }
        list
    }
}

// ---- library ----

unsafe extern "C" fn cpl_init(_mode: c_uint) {
    RUNTIME.with(|rt| rt.borrow_mut().init_calls += 1);
}
unsafe extern "C" fn cpl_end() {}
unsafe extern "C" fn cpl_get_description(_flags: c_uint) -> *const c_char {
    c"fake CPL runtime".as_ptr()
}
unsafe extern "C" fn cpl_version_get_major() -> c_uint {
    RUNTIME.with(|rt| rt.borrow().version.0)
}
unsafe extern "C" fn cpl_version_get_minor() -> c_uint {
    RUNTIME.with(|rt| rt.borrow().version.1)
}
unsafe extern "C" fn cpl_version_get_micro() -> c_uint {
    RUNTIME.with(|rt| rt.borrow().version.2)
}
unsafe extern "C" fn cpl_version_get_version() -> *const c_char {
    RUNTIME.with(|rt| rt.borrow().version_string.as_ptr())
}
unsafe extern "C" fn cpl_memory_dump() {}
unsafe extern "C" fn cpl_memory_is_empty() -> c_int {
    RUNTIME.with(|rt| if rt.borrow().leaked { 0 } else { 1 })
}
unsafe extern "C" fn cpl_free(ptr: *mut c_void) {
    unsafe { libc::free(ptr) }
}

// ---- errors and messages ----

unsafe extern "C" fn cpl_error_get_code() -> c_int {
    with_current_error(0, |e| e.code)
}
unsafe extern "C" fn cpl_error_get_line() -> c_uint {
    with_current_error(0, |e| e.line)
}
unsafe extern "C" fn cpl_error_get_message() -> *const c_char {
    with_current_error(c"".as_ptr(), |e| e.message.as_ptr())
}
unsafe extern "C" fn cpl_error_get_file() -> *const c_char {
    with_current_error(c"".as_ptr(), |e| e.file.as_ptr())
}
unsafe extern "C" fn cpl_error_get_function() -> *const c_char {
    with_current_error(c"".as_ptr(), |e| e.function.as_ptr())
}
unsafe extern "C" fn cpl_error_reset() {
    RUNTIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        rt.errors.clear();
        rt.current = None;
    });
}
unsafe extern "C" fn cpl_error_set_message_macro(
    function: *const c_char,
    code: c_int,
    file: *const c_char,
    line: c_uint,
    format: *const c_char,
) -> c_int {
    unsafe { push_error(code, line, text(format), text(file), text(function)) };
    code
}
unsafe extern "C" fn cpl_errorstate_get() -> c_int {
    RUNTIME.with(|rt| rt.borrow().errors.len() as c_int)
}
unsafe extern "C" fn cpl_errorstate_dump(
    prestate: c_int,
    _reverse: c_int,
    callback: Option<ErrorDumpCallback>,
) {
    let Some(callback) = callback else {
        return;
    };
    let last = RUNTIME.with(|rt| rt.borrow().errors.len());
    let first = usize::try_from(prestate).unwrap_or(0);
    for index in first..last {
        RUNTIME.with(|rt| rt.borrow_mut().current = Some(index));
        unsafe { callback(index as c_uint + 1, first as c_uint + 1, last as c_uint) };
    }
    RUNTIME.with(|rt| rt.borrow_mut().current = None);
}
unsafe extern "C" fn cpl_msg_error(_component: *const c_char, _format: *const c_char) {}
unsafe extern "C" fn cpl_msg_set_level(_level: c_int) {}
unsafe extern "C" fn cpl_msg_set_log_level(_level: c_int) -> c_int {
    0
}
unsafe extern "C" fn cpl_msg_set_log_name(name: *const c_char) -> c_int {
    let path = PathBuf::from(unsafe { text(name) });
    RUNTIME.with(|rt| rt.borrow_mut().log_file = Some(path));
    0
}

/// Appends raw lines to the log file named through `cpl_msg_set_log_name`.
fn write_log(lines: &[&str]) {
    let Some(path) = RUNTIME.with(|rt| rt.borrow().log_file.clone()) else {
        return;
    };
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        for line in lines {
            let _ = writeln!(file, "{line}");
        }
    }
}
unsafe extern "C" fn cpl_msg_stop_log() -> c_int {
    0
}

// ---- frames ----

struct FakeFrame {
    tag: CString,
    filename: CString,
    group: c_int,
}

#[derive(Default)]
struct FakeFrameset {
    frames: Vec<*mut FakeFrame>,
}

unsafe extern "C" fn cpl_frame_new() -> *mut c_void {
    Box::into_raw(Box::new(FakeFrame {
        tag: CString::default(),
        filename: CString::default(),
        group: 0,
    }))
    .cast()
}
unsafe extern "C" fn cpl_frame_set_tag(frame: *mut c_void, tag: *const c_char) -> c_int {
    unsafe { (*frame.cast::<FakeFrame>()).tag = CStr::from_ptr(tag).to_owned() };
    0
}
unsafe extern "C" fn cpl_frame_set_filename(frame: *mut c_void, name: *const c_char) -> c_int {
    unsafe { (*frame.cast::<FakeFrame>()).filename = CStr::from_ptr(name).to_owned() };
    0
}
unsafe extern "C" fn cpl_frame_set_group(frame: *mut c_void, group: c_int) -> c_int {
    unsafe { (*frame.cast::<FakeFrame>()).group = group };
    0
}
unsafe extern "C" fn cpl_frame_get_tag(frame: *const c_void) -> *const c_char {
    unsafe { (*frame.cast::<FakeFrame>()).tag.as_ptr() }
}
unsafe extern "C" fn cpl_frame_get_filename(frame: *const c_void) -> *const c_char {
    unsafe { (*frame.cast::<FakeFrame>()).filename.as_ptr() }
}
unsafe extern "C" fn cpl_frame_get_group(frame: *const c_void) -> c_int {
    unsafe { (*frame.cast::<FakeFrame>()).group }
}
unsafe extern "C" fn cpl_frameset_new() -> *mut c_void {
    Box::into_raw(Box::new(FakeFrameset::default())).cast()
}
unsafe extern "C" fn cpl_frameset_delete(set: *mut c_void) {
    if set.is_null() {
        return;
    }
    let set = unsafe { Box::from_raw(set.cast::<FakeFrameset>()) };
    for frame in set.frames {
        drop(unsafe { Box::from_raw(frame) });
    }
}
unsafe extern "C" fn cpl_frameset_insert(set: *mut c_void, frame: *mut c_void) -> c_int {
    unsafe { (*set.cast::<FakeFrameset>()).frames.push(frame.cast()) };
    0
}
unsafe extern "C" fn cpl_frameset_get_size(set: *const c_void) -> c_longlong {
    unsafe { (*set.cast::<FakeFrameset>()).frames.len() as c_longlong }
}
unsafe extern "C" fn cpl_frameset_get_position(set: *mut c_void, position: c_longlong) -> *mut c_void {
    let frames = unsafe { &(*set.cast::<FakeFrameset>()).frames };
    usize::try_from(position)
        .ok()
        .and_then(|i| frames.get(i))
        .map(|frame| frame.cast())
        .unwrap_or(ptr::null_mut())
}
unsafe extern "C" fn cpl_dfs_update_product_header(_set: *mut c_void) -> c_int {
    0
}
unsafe extern "C" fn cpl_dfs_sign_products(_set: *const c_void, _flags: c_uint) -> c_int {
    0
}

// ---- parameters ----

#[derive(Clone)]
enum FakeValue {
    Bool(bool),
    Int(c_int),
    Double(c_double),
    Str(Option<CString>),
}

struct FakeParam {
    name: CString,
    alias: CString,
    context: CString,
    help: CString,
    kind: ParamType,
    class: c_int,
    default: FakeValue,
    current: FakeValue,
    range: (c_double, c_double),
    choices: Vec<FakeValue>,
    cli_enabled: bool,
}

impl FakeParam {
    fn new(short: &str, kind: ParamType, default: FakeValue) -> Self {
        let cstring = |text: String| CString::new(text).expect("cstring");
        Self {
            name: cstring(format!("iiinstrument.rtest.{short}")),
            alias: cstring(short.to_string()),
            context: cstring("iiinstrument.rtest".to_string()),
            help: cstring(format!("{short} for testing")),
            kind,
            class: CLASS_VALUE,
            current: default.clone(),
            default,
            range: (0.0, 0.0),
            choices: Vec::new(),
            cli_enabled: true,
        }
    }

    fn with_range(mut self, min: c_double, max: c_double) -> Self {
        self.class = CLASS_RANGE;
        self.range = (min, max);
        self
    }

    fn with_choices(mut self, choices: &[&CStr]) -> Self {
        self.class = CLASS_ENUM;
        self.choices = choices
            .iter()
            .map(|choice| FakeValue::Str(Some((*choice).to_owned())))
            .collect();
        self
    }

    fn disabled(mut self) -> Self {
        self.cli_enabled = false;
        self
    }

    fn string(&self) -> String {
        match &self.current {
            FakeValue::Str(Some(value)) => value.to_string_lossy().into_owned(),
            FakeValue::Str(None) => String::new(),
            FakeValue::Bool(value) => value.to_string(),
            FakeValue::Int(value) => value.to_string(),
            FakeValue::Double(value) => value.to_string(),
        }
    }
}

#[derive(Default)]
struct FakeParamList {
    params: Vec<*mut FakeParam>,
    cursor: usize,
}

impl FakeParamList {
    fn find(&self, short: &str) -> Option<&FakeParam> {
        self.params
            .iter()
            .map(|par| unsafe { &**par })
            .find(|par| par.alias.to_str() == Ok(short))
    }
}

fn param<'a>(par: *const c_void) -> &'a FakeParam {
    unsafe { &*par.cast::<FakeParam>() }
}

fn param_mut<'a>(par: *mut c_void) -> &'a mut FakeParam {
    unsafe { &mut *par.cast::<FakeParam>() }
}

unsafe extern "C" fn cpl_parameter_get_name(par: *const c_void) -> *const c_char {
    param(par).name.as_ptr()
}
unsafe extern "C" fn cpl_parameter_get_alias(par: *const c_void, mode: c_int) -> *const c_char {
    if mode == MODE_CLI {
        param(par).alias.as_ptr()
    } else {
        ptr::null()
    }
}
unsafe extern "C" fn cpl_parameter_get_context(par: *const c_void) -> *const c_char {
    param(par).context.as_ptr()
}
unsafe extern "C" fn cpl_parameter_get_help(par: *const c_void) -> *const c_char {
    param(par).help.as_ptr()
}
unsafe extern "C" fn cpl_parameter_get_class(par: *const c_void) -> c_int {
    param(par).class
}
unsafe extern "C" fn cpl_parameter_get_type(par: *const c_void) -> c_int {
    current_tags().tag(param(par).kind)
}
unsafe extern "C" fn cpl_parameter_get_default_bool(par: *const c_void) -> c_int {
    match param(par).default {
        FakeValue::Bool(value) => value as c_int,
        _ => 0,
    }
}
unsafe extern "C" fn cpl_parameter_get_default_int(par: *const c_void) -> c_int {
    match param(par).default {
        FakeValue::Int(value) => value,
        _ => 0,
    }
}
unsafe extern "C" fn cpl_parameter_get_default_double(par: *const c_void) -> c_double {
    match param(par).default {
        FakeValue::Double(value) => value,
        _ => 0.0,
    }
}
unsafe extern "C" fn cpl_parameter_get_default_string(par: *const c_void) -> *const c_char {
    match &param(par).default {
        FakeValue::Str(Some(value)) => value.as_ptr(),
        _ => ptr::null(),
    }
}
unsafe extern "C" fn cpl_parameter_get_range_min_int(par: *const c_void) -> c_int {
    param(par).range.0 as c_int
}
unsafe extern "C" fn cpl_parameter_get_range_max_int(par: *const c_void) -> c_int {
    param(par).range.1 as c_int
}
unsafe extern "C" fn cpl_parameter_get_range_min_double(par: *const c_void) -> c_double {
    param(par).range.0
}
unsafe extern "C" fn cpl_parameter_get_range_max_double(par: *const c_void) -> c_double {
    param(par).range.1
}
unsafe extern "C" fn cpl_parameter_get_enum_size(par: *const c_void) -> c_int {
    param(par).choices.len() as c_int
}
unsafe extern "C" fn cpl_parameter_get_enum_int(par: *const c_void, i: c_int) -> c_int {
    match param(par).choices.get(i as usize) {
        Some(FakeValue::Int(value)) => *value,
        _ => 0,
    }
}
unsafe extern "C" fn cpl_parameter_get_enum_double(par: *const c_void, i: c_int) -> c_double {
    match param(par).choices.get(i as usize) {
        Some(FakeValue::Double(value)) => *value,
        _ => 0.0,
    }
}
unsafe extern "C" fn cpl_parameter_get_enum_string(par: *const c_void, i: c_int) -> *const c_char {
    match param(par).choices.get(i as usize) {
        Some(FakeValue::Str(Some(value))) => value.as_ptr(),
        _ => ptr::null(),
    }
}
unsafe extern "C" fn cpl_parameter_is_enabled(par: *const c_void, mode: c_int) -> c_int {
    if mode == MODE_CLI {
        param(par).cli_enabled as c_int
    } else {
        1
    }
}
unsafe extern "C" fn cpl_parameter_set_bool(par: *mut c_void, value: c_int) -> c_int {
    param_mut(par).current = FakeValue::Bool(value != 0);
    0
}
unsafe extern "C" fn cpl_parameter_set_int(par: *mut c_void, value: c_int) -> c_int {
    param_mut(par).current = FakeValue::Int(value);
    0
}
unsafe extern "C" fn cpl_parameter_set_double(par: *mut c_void, value: c_double) -> c_int {
    param_mut(par).current = FakeValue::Double(value);
    0
}
unsafe extern "C" fn cpl_parameter_set_string(par: *mut c_void, value: *const c_char) -> c_int {
    let par = param_mut(par);
    let value = unsafe { CStr::from_ptr(value) }.to_owned();
    if par.class == CLASS_ENUM
        && !par
            .choices
            .iter()
            .any(|choice| matches!(choice, FakeValue::Str(Some(c)) if *c == value))
    {
        push_error(
            CPL_ERROR_ILLEGAL_INPUT,
            0,
            "value not in enumeration",
            "cpl_parameter.c",
            "cpl_parameter_set_string",
        );
        return CPL_ERROR_ILLEGAL_INPUT;
    }
    par.current = FakeValue::Str(Some(value));
    0
}

unsafe extern "C" fn cpl_parameterlist_delete(list: *mut c_void) {
    if list.is_null() {
        return;
    }
    let list = unsafe { Box::from_raw(list.cast::<FakeParamList>()) };
    for par in list.params {
        drop(unsafe { Box::from_raw(par) });
    }
}
unsafe extern "C" fn cpl_parameterlist_find(list: *mut c_void, name: *const c_char) -> *mut c_void {
    let list = unsafe { &*list.cast::<FakeParamList>() };
    let name = unsafe { CStr::from_ptr(name) };
    list.params
        .iter()
        .copied()
        .find(|par| unsafe { (**par).name.as_c_str() } == name)
        .map(|par| par.cast())
        .unwrap_or(ptr::null_mut())
}
unsafe extern "C" fn cpl_parameterlist_get_first(list: *mut c_void) -> *mut c_void {
    let list = unsafe { &mut *list.cast::<FakeParamList>() };
    list.cursor = 1;
    list.params.first().map(|par| par.cast()).unwrap_or(ptr::null_mut())
}
unsafe extern "C" fn cpl_parameterlist_get_next(list: *mut c_void) -> *mut c_void {
    let list = unsafe { &mut *list.cast::<FakeParamList>() };
    let next = list.params.get(list.cursor).map(|par| par.cast());
    list.cursor += 1;
    next.unwrap_or(ptr::null_mut())
}
unsafe extern "C" fn cpl_parameterlist_get_size(list: *const c_void) -> c_longlong {
    unsafe { (*list.cast::<FakeParamList>()).params.len() as c_longlong }
}

// ---- plugins ----

#[derive(Default)]
struct FakePluginList {
    plugins: Vec<*mut CplRecipe>,
    cursor: usize,
}

unsafe extern "C" fn cpl_pluginlist_new() -> *mut c_void {
    Box::into_raw(Box::new(FakePluginList::default())).cast()
}
unsafe extern "C" fn cpl_pluginlist_delete(list: *mut c_void) {
    if list.is_null() {
        return;
    }
    let list = unsafe { Box::from_raw(list.cast::<FakePluginList>()) };
    for plugin in list.plugins {
        drop(unsafe { Box::from_raw(plugin) });
    }
}
unsafe extern "C" fn cpl_pluginlist_find(list: *mut c_void, name: *const c_char) -> *mut c_void {
    let list = unsafe { &*list.cast::<FakePluginList>() };
    let name = unsafe { CStr::from_ptr(name) };
    list.plugins
        .iter()
        .copied()
        .find(|plugin| unsafe { CStr::from_ptr((**plugin).interface.name) } == name)
        .map(|plugin| plugin.cast())
        .unwrap_or(ptr::null_mut())
}
unsafe extern "C" fn cpl_pluginlist_get_first(list: *mut c_void) -> *mut CplPlugin {
    let list = unsafe { &mut *list.cast::<FakePluginList>() };
    list.cursor = 1;
    list.plugins.first().map(|p| p.cast()).unwrap_or(ptr::null_mut())
}
unsafe extern "C" fn cpl_pluginlist_get_next(list: *mut c_void) -> *mut CplPlugin {
    let list = unsafe { &mut *list.cast::<FakePluginList>() };
    let next = list.plugins.get(list.cursor).map(|p| p.cast());
    list.cursor += 1;
    next.unwrap_or(ptr::null_mut())
}

unsafe extern "C" fn cpl_plugin_get_name(plugin: *const CplPlugin) -> *const c_char {
    unsafe { (*plugin).name }
}
unsafe extern "C" fn cpl_plugin_get_synopsis(plugin: *const CplPlugin) -> *const c_char {
    unsafe { (*plugin).synopsis }
}
unsafe extern "C" fn cpl_plugin_get_description(plugin: *const CplPlugin) -> *const c_char {
    unsafe { (*plugin).description }
}
unsafe extern "C" fn cpl_plugin_get_author(plugin: *const CplPlugin) -> *const c_char {
    unsafe { (*plugin).author }
}
unsafe extern "C" fn cpl_plugin_get_email(plugin: *const CplPlugin) -> *const c_char {
    unsafe { (*plugin).email }
}
unsafe extern "C" fn cpl_plugin_get_copyright(plugin: *const CplPlugin) -> *const c_char {
    unsafe { (*plugin).copyright }
}
unsafe extern "C" fn cpl_plugin_get_version(plugin: *const CplPlugin) -> c_ulong {
    unsafe { (*plugin).version }
}
unsafe extern "C" fn cpl_plugin_get_version_string(plugin: *const CplPlugin) -> *mut c_char {
    let version = unsafe { (*plugin).version };
    let text = CString::new(format!(
        "{}.{}.{}",
        version / 10000,
        version / 100 % 100,
        version % 100
    ))
    .expect("cstring");
    strdup(&text)
}
unsafe extern "C" fn cpl_plugin_get_init(plugin: *const CplPlugin) -> CplPluginFunc {
    unsafe { (*plugin).initialize }
}
unsafe extern "C" fn cpl_plugin_get_exec(plugin: *const CplPlugin) -> CplPluginFunc {
    unsafe { (*plugin).execute }
}
unsafe extern "C" fn cpl_plugin_get_deinit(plugin: *const CplPlugin) -> CplPluginFunc {
    unsafe { (*plugin).deinitialize }
}

fn new_recipe(
    name: &'static CStr,
    synopsis: &'static CStr,
    version: c_ulong,
    initialize: CplPluginFunc,
    execute: CplPluginFunc,
) -> *mut CplRecipe {
    Box::into_raw(Box::new(CplRecipe {
        interface: CplPlugin {
            api: 1,
            version,
            type_: 1 << 1,
            name: name.as_ptr(),
            synopsis: synopsis.as_ptr(),
            description: c"Recipe used by the cplrun test suite.".as_ptr(),
            author: c"Test Author".as_ptr(),
            email: c"test@example.org".as_ptr(),
            copyright: c"GPL".as_ptr(),
            initialize,
            execute,
            deinitialize: Some(recipe_destroy),
        },
        parameters: ptr::null_mut(),
        frames: ptr::null_mut(),
    }))
}

unsafe extern "C" fn cpl_plugin_get_info(list: *mut c_void) -> c_int {
    let list = unsafe { &mut *list.cast::<FakePluginList>() };
    list.plugins.push(new_recipe(
        c"rtest",
        c"Recipe to test CPL frameworks",
        10203,
        Some(rtest_create),
        Some(rtest_exec),
    ));
    list.plugins.push(new_recipe(
        c"rtest_other",
        c"Recipe without parameters",
        10000,
        Some(empty_create),
        Some(empty_exec),
    ));
    list.plugins.push(new_recipe(
        c"rtest",
        c"Shadowed duplicate",
        99999,
        Some(empty_create),
        Some(empty_exec),
    ));
    0
}

fn rtest_parameters() -> FakeParamList {
    let string = |value: Option<&CStr>| FakeValue::Str(value.map(CStr::to_owned));
    let params = vec![
        FakeParam::new("stropt", ParamType::String, string(None)),
        FakeParam::new("boolopt", ParamType::Bool, FakeValue::Bool(true)),
        FakeParam::new("floatopt", ParamType::Double, FakeValue::Double(0.1)),
        FakeParam::new("intopt", ParamType::Int, FakeValue::Int(2)),
        FakeParam::new("enumopt", ParamType::String, string(Some(c"first")))
            .with_choices(&[c"first", c"second"]),
        FakeParam::new("rangeopt", ParamType::Double, FakeValue::Double(0.1)).with_range(-0.5, 0.5),
        FakeParam::new("crashing", ParamType::String, string(Some(c"no")))
            .with_choices(&[c"no", c"segfault"]),
        FakeParam::new("memleak", ParamType::Bool, FakeValue::Bool(false)),
        FakeParam::new("disabled", ParamType::Double, FakeValue::Double(-0.1)).disabled(),
    ];
    FakeParamList {
        params: params.into_iter().map(|par| Box::into_raw(Box::new(par))).collect(),
        cursor: 0,
    }
}

unsafe extern "C" fn rtest_create(plugin: *mut CplPlugin) -> c_int {
    let recipe = plugin.cast::<CplRecipe>();
    unsafe { (*recipe).parameters = Box::into_raw(Box::new(rtest_parameters())).cast() };
    0
}

unsafe extern "C" fn empty_create(plugin: *mut CplPlugin) -> c_int {
    let recipe = plugin.cast::<CplRecipe>();
    unsafe { (*recipe).parameters = Box::into_raw(Box::new(FakeParamList::default())).cast() };
    0
}

unsafe extern "C" fn recipe_destroy(plugin: *mut CplPlugin) -> c_int {
    let recipe = plugin.cast::<CplRecipe>();
    unsafe {
        cpl_parameterlist_delete((*recipe).parameters);
        (*recipe).parameters = ptr::null_mut();
    }
    0
}

unsafe extern "C" fn empty_exec(_plugin: *mut CplPlugin) -> c_int {
    0
}

/// Writes `rtest.fits` describing its inputs and registers it as a `PROD` product.
unsafe extern "C" fn rtest_exec(plugin: *mut CplPlugin) -> c_int {
    let recipe = plugin.cast::<CplRecipe>();
    let params = unsafe { &*(*recipe).parameters.cast::<FakeParamList>() };
    let value = |short: &str| params.find(short).map(FakeParam::string).unwrap_or_default();

    if value("crashing") == "segfault" {
        unsafe { libc::raise(libc::SIGSEGV) };
    }
    if value("memleak") == "true" {
        RUNTIME.with(|rt| rt.borrow_mut().leaked = true);
    }

    let mut lines: Vec<String> = params
        .params
        .iter()
        .map(|par| {
            let par = unsafe { &**par };
            format!("{}={}", par.alias.to_string_lossy(), par.string())
        })
        .collect();
    lines.push(format!(
        "TESTENV={}",
        std::env::var("TESTENV").unwrap_or_default()
    ));
    let frames = unsafe { &mut *(*recipe).frames.cast::<FakeFrameset>() };
    for frame in &frames.frames {
        let frame = unsafe { &**frame };
        lines.push(format!(
            "frame {} {}",
            frame.tag.to_string_lossy(),
            frame.filename.to_string_lossy()
        ));
    }
    if std::fs::write("rtest.fits", lines.join("\n") + "\n").is_err() {
        push_error(8, 7, "cannot write product", "rtest.c", "rtest_exec");
        return 8;
    }

    write_log(&[
        "12:00:00 [ INFO  ] rtest_exec: [tid=000] wrote rtest.fits",
        "12:00:01 [WARNING] rtest_exec: no calibration supplied",
        "    using built-in defaults",
    ]);

    if value("stropt") == "fail" {
        write_log(&["12:00:02 [ ERROR ] rtest_exec: [tid=000] illegal input"]);
        push_error(CPL_ERROR_ILLEGAL_INPUT, 42, "illegal input", "rtest.c", "rtest_exec");
        return CPL_ERROR_ILLEGAL_INPUT;
    }

    frames.frames.push(Box::into_raw(Box::new(FakeFrame {
        tag: c"PROD".to_owned(),
        filename: c"rtest.fits".to_owned(),
        group: FRAME_GROUP_PRODUCT,
    })));
    0
}

// ---- frame configuration hook ----

static CONFIG_MARKER: u8 = 0;

unsafe extern "C" fn muse_processing_get_recipeconfig(recipe: *mut CplRecipe) -> *mut c_void {
    let name = unsafe { CStr::from_ptr((*recipe).interface.name) };
    if name != c"rtest" {
        return ptr::null_mut();
    }
    ptr::addr_of!(CONFIG_MARKER).cast_mut().cast()
}
unsafe extern "C" fn cpl_recipeconfig_get_tags(_config: *const c_void) -> *mut *mut c_char {
    if RUNTIME.with(|rt| rt.borrow().malformed_config) {
        return ptr::null_mut();
    }
    string_list(&[c"RRRECIPE_DOCATG_RAW"])
}
unsafe extern "C" fn cpl_recipeconfig_get_inputs(
    _config: *const c_void,
    _tag: *const c_char,
) -> *mut *mut c_char {
    string_list(&[c"MASTER_BIAS", c"BADPIX_TABLE"])
}
unsafe extern "C" fn cpl_recipeconfig_get_outputs(
    _config: *const c_void,
    _tag: *const c_char,
) -> *mut *mut c_char {
    string_list(&[c"PROD"])
}
unsafe extern "C" fn cpl_recipeconfig_get_min_count(
    _config: *const c_void,
    _tag: *const c_char,
    input: *const c_char,
) -> c_longlong {
    match unsafe { text(input) } {
        "RRRECIPE_DOCATG_RAW" | "MASTER_BIAS" => 1,
        _ => -1,
    }
}
unsafe extern "C" fn cpl_recipeconfig_get_max_count(
    _config: *const c_void,
    _tag: *const c_char,
    input: *const c_char,
) -> c_longlong {
    match unsafe { text(input) } {
        "MASTER_BIAS" => 1,
        _ => -1,
    }
}

// ---- symbol source ----

fn entries() -> Vec<(&'static CStr, usize)> {
    vec![
        (c"cpl_init", cpl_init as *const () as usize),
        (c"cpl_end", cpl_end as *const () as usize),
        (c"cpl_get_description", cpl_get_description as *const () as usize),
        (c"cpl_version_get_major", cpl_version_get_major as *const () as usize),
        (c"cpl_version_get_minor", cpl_version_get_minor as *const () as usize),
        (c"cpl_version_get_micro", cpl_version_get_micro as *const () as usize),
        (c"cpl_version_get_version", cpl_version_get_version as *const () as usize),
        (c"cpl_memory_dump", cpl_memory_dump as *const () as usize),
        (c"cpl_memory_is_empty", cpl_memory_is_empty as *const () as usize),
        (c"cpl_free", cpl_free as *const () as usize),
        (c"cpl_plugin_get_author", cpl_plugin_get_author as *const () as usize),
        (c"cpl_plugin_get_copyright", cpl_plugin_get_copyright as *const () as usize),
        (c"cpl_plugin_get_deinit", cpl_plugin_get_deinit as *const () as usize),
        (c"cpl_plugin_get_description", cpl_plugin_get_description as *const () as usize),
        (c"cpl_plugin_get_email", cpl_plugin_get_email as *const () as usize),
        (c"cpl_plugin_get_exec", cpl_plugin_get_exec as *const () as usize),
        (c"cpl_plugin_get_init", cpl_plugin_get_init as *const () as usize),
        (c"cpl_plugin_get_name", cpl_plugin_get_name as *const () as usize),
        (c"cpl_plugin_get_synopsis", cpl_plugin_get_synopsis as *const () as usize),
        (c"cpl_plugin_get_version", cpl_plugin_get_version as *const () as usize),
        (c"cpl_plugin_get_version_string", cpl_plugin_get_version_string as *const () as usize),
        (c"cpl_plugin_get_info", cpl_plugin_get_info as *const () as usize),
        (c"cpl_pluginlist_delete", cpl_pluginlist_delete as *const () as usize),
        (c"cpl_pluginlist_find", cpl_pluginlist_find as *const () as usize),
        (c"cpl_pluginlist_get_first", cpl_pluginlist_get_first as *const () as usize),
        (c"cpl_pluginlist_get_next", cpl_pluginlist_get_next as *const () as usize),
        (c"cpl_pluginlist_new", cpl_pluginlist_new as *const () as usize),
        (c"cpl_dfs_update_product_header", cpl_dfs_update_product_header as *const () as usize),
        (c"cpl_dfs_sign_products", cpl_dfs_sign_products as *const () as usize),
        (c"cpl_msg_error", cpl_msg_error as *const () as usize),
        (c"cpl_error_get_code", cpl_error_get_code as *const () as usize),
        (c"cpl_error_get_file", cpl_error_get_file as *const () as usize),
        (c"cpl_error_get_function", cpl_error_get_function as *const () as usize),
        (c"cpl_error_get_line", cpl_error_get_line as *const () as usize),
        (c"cpl_error_get_message", cpl_error_get_message as *const () as usize),
        (c"cpl_error_reset", cpl_error_reset as *const () as usize),
        (c"cpl_error_set_message_macro", cpl_error_set_message_macro as *const () as usize),
        (c"cpl_errorstate_dump", cpl_errorstate_dump as *const () as usize),
        (c"cpl_errorstate_get", cpl_errorstate_get as *const () as usize),
        (c"cpl_frame_get_filename", cpl_frame_get_filename as *const () as usize),
        (c"cpl_frame_get_group", cpl_frame_get_group as *const () as usize),
        (c"cpl_frame_get_tag", cpl_frame_get_tag as *const () as usize),
        (c"cpl_frame_new", cpl_frame_new as *const () as usize),
        (c"cpl_frame_set_filename", cpl_frame_set_filename as *const () as usize),
        (c"cpl_frame_set_tag", cpl_frame_set_tag as *const () as usize),
        (c"cpl_frame_set_group", cpl_frame_set_group as *const () as usize),
        (c"cpl_frameset_delete", cpl_frameset_delete as *const () as usize),
        (c"cpl_frameset_get_position", cpl_frameset_get_position as *const () as usize),
        (c"cpl_frameset_get_size", cpl_frameset_get_size as *const () as usize),
        (c"cpl_frameset_insert", cpl_frameset_insert as *const () as usize),
        (c"cpl_frameset_new", cpl_frameset_new as *const () as usize),
        (c"cpl_msg_set_level", cpl_msg_set_level as *const () as usize),
        (c"cpl_msg_set_log_level", cpl_msg_set_log_level as *const () as usize),
        (c"cpl_msg_set_log_name", cpl_msg_set_log_name as *const () as usize),
        (c"cpl_msg_stop_log", cpl_msg_stop_log as *const () as usize),
        (c"cpl_parameter_get_alias", cpl_parameter_get_alias as *const () as usize),
        (c"cpl_parameter_get_class", cpl_parameter_get_class as *const () as usize),
        (c"cpl_parameter_get_context", cpl_parameter_get_context as *const () as usize),
        (c"cpl_parameter_get_default_bool", cpl_parameter_get_default_bool as *const () as usize),
        (c"cpl_parameter_get_default_double", cpl_parameter_get_default_double as *const () as usize),
        (c"cpl_parameter_get_default_int", cpl_parameter_get_default_int as *const () as usize),
        (c"cpl_parameter_get_default_string", cpl_parameter_get_default_string as *const () as usize),
        (c"cpl_parameter_get_enum_double", cpl_parameter_get_enum_double as *const () as usize),
        (c"cpl_parameter_get_enum_int", cpl_parameter_get_enum_int as *const () as usize),
        (c"cpl_parameter_get_enum_size", cpl_parameter_get_enum_size as *const () as usize),
        (c"cpl_parameter_get_enum_string", cpl_parameter_get_enum_string as *const () as usize),
        (c"cpl_parameter_get_help", cpl_parameter_get_help as *const () as usize),
        (c"cpl_parameter_get_name", cpl_parameter_get_name as *const () as usize),
        (c"cpl_parameter_get_range_max_double", cpl_parameter_get_range_max_double as *const () as usize),
        (c"cpl_parameter_get_range_max_int", cpl_parameter_get_range_max_int as *const () as usize),
        (c"cpl_parameter_get_range_min_double", cpl_parameter_get_range_min_double as *const () as usize),
        (c"cpl_parameter_get_range_min_int", cpl_parameter_get_range_min_int as *const () as usize),
        (c"cpl_parameter_get_type", cpl_parameter_get_type as *const () as usize),
        (c"cpl_parameter_is_enabled", cpl_parameter_is_enabled as *const () as usize),
        (c"cpl_parameter_set_bool", cpl_parameter_set_bool as *const () as usize),
        (c"cpl_parameter_set_double", cpl_parameter_set_double as *const () as usize),
        (c"cpl_parameter_set_int", cpl_parameter_set_int as *const () as usize),
        (c"cpl_parameter_set_string", cpl_parameter_set_string as *const () as usize),
        (c"cpl_parameterlist_delete", cpl_parameterlist_delete as *const () as usize),
        (c"cpl_parameterlist_find", cpl_parameterlist_find as *const () as usize),
        (c"cpl_parameterlist_get_first", cpl_parameterlist_get_first as *const () as usize),
        (c"cpl_parameterlist_get_next", cpl_parameterlist_get_next as *const () as usize),
        (c"cpl_parameterlist_get_size", cpl_parameterlist_get_size as *const () as usize),
        (c"cpl_recipeconfig_get_inputs", cpl_recipeconfig_get_inputs as *const () as usize),
        (c"cpl_recipeconfig_get_max_count", cpl_recipeconfig_get_max_count as *const () as usize),
        (c"cpl_recipeconfig_get_min_count", cpl_recipeconfig_get_min_count as *const () as usize),
        (c"cpl_recipeconfig_get_outputs", cpl_recipeconfig_get_outputs as *const () as usize),
        (c"cpl_recipeconfig_get_tags", cpl_recipeconfig_get_tags as *const () as usize),
        (c"muse_processing_get_recipeconfig", muse_processing_get_recipeconfig as *const () as usize),
    ]
}

/// Symbol table over the fake runtime, editable per test.
pub struct FakeSource {
    symbols: HashMap<CString, usize>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            symbols: entries()
                .into_iter()
                .map(|(name, address)| (name.to_owned(), address))
                .collect(),
        }
    }

    pub fn without(mut self, name: &CStr) -> Self {
        self.symbols.remove(name);
        self
    }

    pub fn renamed(mut self, from: &CStr, to: &CStr) -> Self {
        if let Some(address) = self.symbols.remove(from) {
            self.symbols.insert(to.to_owned(), address);
        }
        self
    }
}

impl SymbolSource for FakeSource {
    fn resolve(&self, name: &CStr) -> Option<*const c_void> {
        self.symbols
            .get(name)
            .map(|address| *address as *const c_void)
    }
}
