// CPL runtime binding: raw ABI in `sys`, typed capability table in `symbols`.
// All FFI address handling is confined to this module; callers go through `CplSymbols`.
pub mod symbols;
pub mod sys;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

pub use symbols::{CplSymbols, DynamicModule, SymbolSource};

/// Copies a borrowed C string, returning `None` for null.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for the call.
pub(crate) unsafe fn borrowed_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Builds a C string, cutting the input at the first interior NUL.
pub(crate) fn to_cstring(value: &str) -> CString {
    let bytes = value.as_bytes();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    CString::new(&bytes[..end]).unwrap_or_default()
}
