// Frames, framesets, and declared frame-tag configuration of a recipe.
use std::os::raw::{c_char, c_void};
use std::path::PathBuf;

use serde::Serialize;

use crate::core::cpl::sys::{
    CPL_FRAME_GROUP_CALIB, CPL_FRAME_GROUP_NONE, CPL_FRAME_GROUP_PRODUCT, CPL_FRAME_GROUP_RAW,
    CplFrameGroup, CplFrameset, CplRecipeConfig,
};
use crate::core::cpl::{CplSymbols, borrowed_string, to_cstring};
use crate::core::envelope::ProducedFrame;
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameGroup {
    #[default]
    None,
    Raw,
    Calib,
    Product,
}

impl FrameGroup {
    pub fn to_raw(self) -> CplFrameGroup {
        match self {
            FrameGroup::None => CPL_FRAME_GROUP_NONE,
            FrameGroup::Raw => CPL_FRAME_GROUP_RAW,
            FrameGroup::Calib => CPL_FRAME_GROUP_CALIB,
            FrameGroup::Product => CPL_FRAME_GROUP_PRODUCT,
        }
    }

    pub fn from_raw(raw: CplFrameGroup) -> FrameGroup {
        match raw {
            CPL_FRAME_GROUP_RAW => FrameGroup::Raw,
            CPL_FRAME_GROUP_CALIB => FrameGroup::Calib,
            CPL_FRAME_GROUP_PRODUCT => FrameGroup::Product,
            _ => FrameGroup::None,
        }
    }

    pub fn parse(text: &str) -> Option<FrameGroup> {
        match text.to_ascii_lowercase().as_str() {
            "none" => Some(FrameGroup::None),
            "raw" => Some(FrameGroup::Raw),
            "calib" => Some(FrameGroup::Calib),
            "product" => Some(FrameGroup::Product),
            _ => None,
        }
    }
}

/// One tagged input artifact supplied to an execution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Frame {
    pub tag: String,
    pub filename: PathBuf,
    pub group: FrameGroup,
}

impl Frame {
    pub fn new(tag: impl Into<String>, filename: impl Into<PathBuf>) -> Self {
        Self {
            tag: tag.into(),
            filename: filename.into(),
            group: FrameGroup::None,
        }
    }

    pub fn with_group(mut self, group: FrameGroup) -> Self {
        self.group = group;
        self
    }
}

/// Compatible input tag and its allowed multiplicity; `None` means unspecified.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub min: Option<u32>,
    pub max: Option<u32>,
}

/// Declared configuration for one raw input tag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FrameConfig {
    pub input: TagCount,
    pub calibrations: Vec<TagCount>,
    pub outputs: Vec<String>,
}

/// Builds a fresh frameset holding `frames` in order.
///
/// # Safety
/// `symbols` must belong to an initialized runtime.
pub(crate) unsafe fn build_frameset(symbols: &CplSymbols, frames: &[Frame]) -> *mut CplFrameset {
    // SAFETY: every pointer handed to the runtime is either fresh from it or a live CString.
    unsafe {
        let set = (symbols.frameset_new)();
        for frame in frames {
            let item = (symbols.frame_new)();
            let filename = to_cstring(&frame.filename.to_string_lossy());
            let tag = to_cstring(&frame.tag);
            (symbols.frame_set_filename)(item, filename.as_ptr());
            (symbols.frame_set_tag)(item, tag.as_ptr());
            if let Some(set_group) = symbols.frame_set_group {
                set_group(item, frame.group.to_raw());
            }
            (symbols.frameset_insert)(set, item);
        }
        set
    }
}

/// Lists the product frames of `set` in processing order.
///
/// # Safety
/// `set` must be a live frameset of the runtime bound by `symbols`.
pub(crate) unsafe fn product_frames(
    symbols: &CplSymbols,
    set: *mut CplFrameset,
) -> Vec<ProducedFrame> {
    if set.is_null() {
        return Vec::new();
    }
    // SAFETY: set is live per the caller contract; frames are borrowed from it.
    unsafe {
        let size = (symbols.frameset_get_size)(set);
        (0..size.max(0))
            .filter_map(|position| {
                let frame = (symbols.frameset_get_position)(set, position);
                if frame.is_null()
                    || (symbols.frame_get_group)(frame) != CPL_FRAME_GROUP_PRODUCT
                {
                    return None;
                }
                Some(ProducedFrame {
                    tag: borrowed_string((symbols.frame_get_tag)(frame)).unwrap_or_default(),
                    filename: borrowed_string((symbols.frame_get_filename)(frame))
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Takes ownership of a runtime-allocated, NULL-terminated string array.
///
/// # Safety
/// `list` must be null or a `cpl_free`-owned array of `cpl_free`-owned strings.
unsafe fn take_string_list(symbols: &CplSymbols, list: *mut *mut c_char) -> Option<Vec<String>> {
    if list.is_null() {
        return None;
    }
    let mut out = Vec::new();
    // SAFETY: the array is NULL-terminated and every entry is released exactly once.
    unsafe {
        let mut cursor = list;
        while !(*cursor).is_null() {
            out.push(borrowed_string(*cursor).unwrap_or_default());
            (symbols.free)((*cursor).cast::<c_void>());
            cursor = cursor.add(1);
        }
        (symbols.free)(list.cast::<c_void>());
    }
    Some(out)
}

fn multiplicity(count: i64) -> Option<u32> {
    u32::try_from(count).ok()
}

/// Reads the declared frame configuration from a recipe configuration object.
///
/// # Safety
/// `config` must be a live recipe configuration returned by the module's hook.
pub(crate) unsafe fn read_frame_config(
    symbols: &CplSymbols,
    config: *const CplRecipeConfig,
) -> Result<Vec<FrameConfig>, Error> {
    // SAFETY: config is live per the caller contract; every list is released by `take_string_list`.
    unsafe {
        let tags = take_string_list(symbols, (symbols.recipeconfig_get_tags)(config)).ok_or_else(
            || {
                Error::new(ErrorKind::MalformedConfig)
                    .with_message("recipe configuration declares no tag list")
            },
        )?;
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let c_tag = to_cstring(&tag);
            let count = |input: &std::ffi::CStr| TagCountRaw {
                min: (symbols.recipeconfig_get_min_count)(config, c_tag.as_ptr(), input.as_ptr()),
                max: (symbols.recipeconfig_get_max_count)(config, c_tag.as_ptr(), input.as_ptr()),
            };
            let own = count(c_tag.as_c_str());
            let inputs = take_string_list(
                symbols,
                (symbols.recipeconfig_get_inputs)(config, c_tag.as_ptr()),
            )
            .unwrap_or_default();
            let calibrations = inputs
                .into_iter()
                .map(|input| {
                    let raw = count(to_cstring(&input).as_c_str());
                    TagCount {
                        tag: input,
                        min: multiplicity(raw.min),
                        max: multiplicity(raw.max),
                    }
                })
                .collect();
            let outputs = take_string_list(
                symbols,
                (symbols.recipeconfig_get_outputs)(config, c_tag.as_ptr()),
            )
            .unwrap_or_default();
            out.push(FrameConfig {
                input: TagCount {
                    tag,
                    min: multiplicity(own.min),
                    max: multiplicity(own.max),
                },
                calibrations,
                outputs,
            });
        }
        Ok(out)
    }
}

struct TagCountRaw {
    min: i64,
    max: i64,
}
