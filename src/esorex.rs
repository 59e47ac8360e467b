//! Purpose: Read esorex-compatible `esorex.rc` settings and `.sof` frame lists.
//! Exports: `RcConfig`, `load_rc`, `parse_rc`, `load_sof`, `parse_sof`, `default_rc_path`.
//! Role: Host configuration for the CLI; nothing in `core` depends on it.
//! Invariants: Default rc path remains `~/.esorex/esorex.rc`.
//! Invariants: Relative sof filenames resolve against the sof file's directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};
use crate::core::frames::{Frame, FrameGroup};

const RECIPE_DIR_KEY: &str = "esorex.caller.recipe-dir";
const MSG_LEVEL_KEY: &str = "esorex.caller.msg-level";
const LOG_LEVEL_KEY: &str = "esorex.caller.log-level";
const LOG_FILE_KEY: &str = "esorex.caller.log-file";
const OUTPUT_DIR_KEY: &str = "esorex.caller.output-dir";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RcConfig {
    pub recipe_dirs: Vec<PathBuf>,
    pub msg_level: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    /// Remaining `key=value` pairs, candidates for recipe parameters.
    pub recipe_params: Vec<(String, String)>,
}

impl RcConfig {
    /// Parameter settings whose dotted key names `recipe` as one of its segments.
    pub fn params_for(&self, recipe: &str) -> Vec<(String, String)> {
        self.recipe_params
            .iter()
            .filter(|(key, _)| key.split('.').any(|segment| segment == recipe))
            .cloned()
            .collect()
    }
}

pub fn default_rc_path() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".esorex").join("esorex.rc")
}

pub fn load_rc(path: &Path) -> Result<RcConfig, Error> {
    let text = read_text(path)?;
    Ok(parse_rc(&text))
}

pub fn parse_rc(text: &str) -> RcConfig {
    let mut config = RcConfig::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        match key {
            RECIPE_DIR_KEY => {
                config.recipe_dirs = value
                    .split(':')
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            MSG_LEVEL_KEY => config.msg_level = Some(value.to_string()),
            LOG_LEVEL_KEY => config.log_level = Some(value.to_string()),
            LOG_FILE_KEY => config.log_file = Some(PathBuf::from(value)),
            OUTPUT_DIR_KEY => config.output_dir = Some(PathBuf::from(value)),
            _ => config.recipe_params.push((key.to_string(), value.to_string())),
        }
    }
    config
}

pub fn load_sof(path: &Path) -> Result<Vec<Frame>, Error> {
    let text = read_text(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_sof(&text, base).map_err(|err| err.with_path(path))
}

/// Parses `filename tag [group]` lines.
pub fn parse_sof(text: &str, base: &Path) -> Result<Vec<Frame>, Error> {
    let mut frames = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(filename), Some(tag)) = (fields.next(), fields.next()) else {
            return Err(sof_error(index, "expected 'filename tag [group]'"));
        };
        let group = match fields.next() {
            None => FrameGroup::None,
            Some(text) => FrameGroup::parse(text)
                .ok_or_else(|| sof_error(index, &format!("unknown frame group '{text}'")))?,
        };
        if fields.next().is_some() {
            return Err(sof_error(index, "too many fields"));
        }
        let filename = Path::new(filename);
        let filename = if filename.is_absolute() {
            filename.to_path_buf()
        } else {
            base.join(filename)
        };
        frames.push(Frame::new(tag, filename).with_group(group));
    }
    Ok(frames)
}

fn sof_error(index: usize, detail: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("malformed sof line {}: {detail}", index + 1))
        .with_hint("Each line is 'filename tag [group]'; group is raw, calib, product, or none.")
}

fn read_text(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read configuration file")
            .with_path(path)
            .with_source(err)
    })
}
