//! Purpose: Read a recipe's parameter schema and apply caller overrides through the C runtime.
//! Exports: `ParamType`, `ParamValue`, `ParamConstraint`, `ParamModes`, `ParameterDescriptor`.
//! Role: Parameter half of the registry walker and the harness `prepare` step.
//! Invariants: Type dispatch always goes through the owning handle's `TypeTags`.
//! Invariants: Overrides with an unknown name or mismatched type are ignored, never fatal.
//! Invariants: A null string default resets to the empty string.

use std::os::raw::{c_int, c_void};

use serde::Serialize;

use crate::core::cpl::sys::{
    CPL_PARAMETER_CLASS_ENUM, CPL_PARAMETER_CLASS_RANGE, CPL_PARAMETER_MODE_CFG,
    CPL_PARAMETER_MODE_CLI, CPL_PARAMETER_MODE_ENV, CplParameterList,
};
use crate::core::cpl::{CplSymbols, borrowed_string, to_cstring};
use crate::core::error::{Error, ErrorKind};
use crate::core::version::TypeTags;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    Double,
    String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::Double => "double",
            ParamType::String => "string",
        }
    }
}

impl ParamValue {
    pub fn value_type(&self) -> ParamType {
        match self {
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Double(_) => ParamType::Double,
            ParamValue::String(_) => ParamType::String,
        }
    }

    /// Parses command-line text as a value of `value_type`.
    pub fn parse_as(text: &str, value_type: ParamType) -> Result<ParamValue, Error> {
        let invalid = || {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid {} value '{text}'", value_type.as_str()))
        };
        match value_type {
            ParamType::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "no" | "0" => Ok(ParamValue::Bool(false)),
                _ => Err(invalid()),
            },
            ParamType::Int => text
                .trim()
                .parse()
                .map(ParamValue::Int)
                .map_err(|_| invalid()),
            ParamType::Double => text
                .trim()
                .parse()
                .map(ParamValue::Double)
                .map_err(|_| invalid()),
            ParamType::String => Ok(ParamValue::String(text.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamConstraint {
    Range { min: ParamValue, max: ParamValue },
    Enum(Vec<ParamValue>),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ParamModes {
    pub cli: bool,
    pub env: bool,
    pub cfg: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub alias: Option<String>,
    pub context: Option<String>,
    pub help: Option<String>,
    pub value_type: Option<ParamType>,
    pub default: Option<ParamValue>,
    pub constraint: Option<ParamConstraint>,
    pub enabled: ParamModes,
}

/// Walks the parameter list in declaration order.
///
/// # Safety
/// `list` must be the live parameter list of a recipe initialized by `symbols`.
unsafe fn each_parameter(
    symbols: &CplSymbols,
    list: *mut CplParameterList,
    mut visit: impl FnMut(*mut c_void),
) {
    if list.is_null() {
        return;
    }
    // SAFETY: list is live per the caller contract.
    let mut par = unsafe { (symbols.parameterlist_get_first)(list) };
    while !par.is_null() {
        visit(par);
        // SAFETY: as above; the list cursor is advanced by the runtime.
        par = unsafe { (symbols.parameterlist_get_next)(list) };
    }
}

/// # Safety
/// `par` must be a live parameter owned by a recipe initialized by `symbols`.
unsafe fn read_default(
    symbols: &CplSymbols,
    value_type: ParamType,
    par: *const c_void,
) -> ParamValue {
    // SAFETY: par is live per the caller contract.
    unsafe {
        match value_type {
            ParamType::Bool => ParamValue::Bool((symbols.parameter_get_default_bool)(par) != 0),
            ParamType::Int => ParamValue::Int((symbols.parameter_get_default_int)(par).into()),
            ParamType::Double => ParamValue::Double((symbols.parameter_get_default_double)(par)),
            ParamType::String => ParamValue::String(
                borrowed_string((symbols.parameter_get_default_string)(par)).unwrap_or_default(),
            ),
        }
    }
}

/// # Safety
/// `par` must be a live parameter owned by a recipe initialized by `symbols`.
unsafe fn read_constraint(
    symbols: &CplSymbols,
    value_type: ParamType,
    par: *const c_void,
) -> Option<ParamConstraint> {
    // SAFETY: par is live per the caller contract.
    unsafe {
        let class = (symbols.parameter_get_class)(par);
        if class == CPL_PARAMETER_CLASS_RANGE {
            return match value_type {
                ParamType::Int => Some(ParamConstraint::Range {
                    min: ParamValue::Int((symbols.parameter_get_range_min_int)(par).into()),
                    max: ParamValue::Int((symbols.parameter_get_range_max_int)(par).into()),
                }),
                ParamType::Double => Some(ParamConstraint::Range {
                    min: ParamValue::Double((symbols.parameter_get_range_min_double)(par)),
                    max: ParamValue::Double((symbols.parameter_get_range_max_double)(par)),
                }),
                _ => None,
            };
        }
        if class == CPL_PARAMETER_CLASS_ENUM {
            let size = (symbols.parameter_get_enum_size)(par).max(0);
            let values = (0..size)
                .filter_map(|i: c_int| match value_type {
                    ParamType::Int => Some(ParamValue::Int((symbols.parameter_get_enum_int)(par, i).into())),
                    ParamType::Double => {
                        Some(ParamValue::Double((symbols.parameter_get_enum_double)(par, i)))
                    }
                    ParamType::String => {
                        borrowed_string((symbols.parameter_get_enum_string)(par, i))
                            .map(ParamValue::String)
                    }
                    ParamType::Bool => None,
                })
                .collect();
            return Some(ParamConstraint::Enum(values));
        }
        None
    }
}

/// Snapshots every parameter of a live parameter list.
///
/// # Safety
/// `list` must be the live parameter list of a recipe initialized by `symbols`.
pub(crate) unsafe fn read_parameters(
    symbols: &CplSymbols,
    tags: &TypeTags,
    list: *mut CplParameterList,
) -> Vec<ParameterDescriptor> {
    let mut out = Vec::new();
    // SAFETY: list is live per the caller contract; each `par` comes from it.
    unsafe {
        each_parameter(symbols, list, |par| {
            let name = borrowed_string((symbols.parameter_get_name)(par)).unwrap_or_default();
            let raw_type = (symbols.parameter_get_type)(par);
            let value_type = tags.param_type(raw_type);
            if value_type.is_none() {
                tracing::warn!(parameter = %name, raw_type, "parameter has an unrecognized type tag");
            }
            out.push(ParameterDescriptor {
                alias: borrowed_string((symbols.parameter_get_alias)(par, CPL_PARAMETER_MODE_CLI)),
                context: borrowed_string((symbols.parameter_get_context)(par)),
                help: borrowed_string((symbols.parameter_get_help)(par)),
                value_type,
                default: value_type.map(|ty| read_default(symbols, ty, par)),
                constraint: value_type.and_then(|ty| read_constraint(symbols, ty, par)),
                enabled: ParamModes {
                    cli: (symbols.parameter_is_enabled)(par, CPL_PARAMETER_MODE_CLI) != 0,
                    env: (symbols.parameter_is_enabled)(par, CPL_PARAMETER_MODE_ENV) != 0,
                    cfg: (symbols.parameter_is_enabled)(par, CPL_PARAMETER_MODE_CFG) != 0,
                },
                name,
            });
        });
    }
    out
}

/// Resets every parameter to its declared default.
///
/// # Safety
/// `list` must be the live parameter list of a recipe initialized by `symbols`.
pub(crate) unsafe fn reset_to_defaults(
    symbols: &CplSymbols,
    tags: &TypeTags,
    list: *mut CplParameterList,
) {
    // SAFETY: list is live per the caller contract; each `par` comes from it.
    unsafe {
        each_parameter(symbols, list, |par| {
            match tags.param_type((symbols.parameter_get_type)(par)) {
                Some(ParamType::String) => {
                    let default = (symbols.parameter_get_default_string)(par);
                    let default = if default.is_null() { c"".as_ptr() } else { default };
                    (symbols.parameter_set_string)(par, default);
                }
                Some(ParamType::Int) => {
                    (symbols.parameter_set_int)(par, (symbols.parameter_get_default_int)(par));
                }
                Some(ParamType::Double) => {
                    (symbols.parameter_set_double)(
                        par,
                        (symbols.parameter_get_default_double)(par),
                    );
                }
                Some(ParamType::Bool) => {
                    (symbols.parameter_set_bool)(par, (symbols.parameter_get_default_bool)(par));
                }
                None => {}
            }
        });
    }
}

/// Finds a parameter by full name, then by command-line alias.
///
/// # Safety
/// `list` must be the live parameter list of a recipe initialized by `symbols`.
unsafe fn find_parameter(
    symbols: &CplSymbols,
    list: *mut CplParameterList,
    name: &str,
) -> *mut c_void {
    let c_name = to_cstring(name);
    // SAFETY: list is live per the caller contract.
    let found = unsafe { (symbols.parameterlist_find)(list, c_name.as_ptr()) };
    if !found.is_null() {
        return found;
    }
    let mut by_alias: *mut c_void = std::ptr::null_mut();
    // SAFETY: as above.
    unsafe {
        each_parameter(symbols, list, |par| {
            if by_alias.is_null()
                && borrowed_string((symbols.parameter_get_alias)(par, CPL_PARAMETER_MODE_CLI))
                    .as_deref()
                    == Some(name)
            {
                by_alias = par;
            }
        });
    }
    by_alias
}

/// Applies overrides whose value type matches the declared parameter type.
///
/// # Safety
/// `list` must be the live parameter list of a recipe initialized by `symbols`.
pub(crate) unsafe fn apply_overrides(
    symbols: &CplSymbols,
    tags: &TypeTags,
    list: *mut CplParameterList,
    overrides: &[(String, ParamValue)],
) {
    if list.is_null() {
        return;
    }
    for (name, value) in overrides {
        // SAFETY: list is live per the caller contract.
        let par = unsafe { find_parameter(symbols, list, name) };
        if par.is_null() {
            tracing::debug!(parameter = %name, "ignoring override for unknown parameter");
            continue;
        }
        // SAFETY: par was just returned by the runtime for this list.
        let declared = tags.param_type(unsafe { (symbols.parameter_get_type)(par) });
        // SAFETY: as above.
        unsafe {
            match (declared, value) {
                (Some(ParamType::String), ParamValue::String(text)) => {
                    let text = to_cstring(text);
                    (symbols.parameter_set_string)(par, text.as_ptr());
                }
                (Some(ParamType::Int), ParamValue::Int(number)) => match c_int::try_from(*number) {
                    Ok(number) => {
                        (symbols.parameter_set_int)(par, number);
                    }
                    Err(_) => {
                        tracing::debug!(parameter = %name, number, "ignoring out-of-range int override");
                    }
                },
                (Some(ParamType::Double), ParamValue::Double(number)) => {
                    (symbols.parameter_set_double)(par, *number);
                }
                (Some(ParamType::Bool), ParamValue::Bool(flag)) => {
                    (symbols.parameter_set_bool)(par, c_int::from(*flag));
                }
                _ => {
                    tracing::debug!(
                        parameter = %name,
                        declared = ?declared,
                        supplied = ?value.value_type(),
                        "ignoring override with mismatched type"
                    );
                }
            }
        }
    }
}
