//! Purpose: Find recipe modules on a search path and pick the one providing a recipe.
//! Exports: `RecipeSearch`, `FoundRecipe`.
//! Role: Module discovery for the CLI; loads candidates through a shared registry.
//! Invariants: Modules that fail to load are skipped, never fatal to a search.
//! Invariants: A requested version wins; otherwise the highest recipe version wins.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::library::LibraryRegistry;
use crate::core::recipe::list_plugins;

/// One recipe as found in one module on the search path.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FoundRecipe {
    pub name: String,
    pub version: u64,
    pub version_string: String,
    pub synopsis: String,
    pub module: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct RecipeSearch {
    dirs: Vec<PathBuf>,
}

impl RecipeSearch {
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dirs: dirs.into_iter().collect(),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Every `*.so` below the search directories, in a stable order.
    pub fn modules(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for dir in &self.dirs {
            collect_modules(dir, &mut out);
        }
        out
    }

    pub fn recipes(&self, registry: &LibraryRegistry) -> Vec<FoundRecipe> {
        let mut out = Vec::new();
        for module in self.modules() {
            let summaries = registry
                .load(&module)
                .and_then(|handle| list_plugins(&handle));
            match summaries {
                Ok(summaries) => out.extend(summaries.into_iter().map(|summary| FoundRecipe {
                    name: summary.name,
                    version: summary.version,
                    version_string: summary.version_string,
                    synopsis: summary.synopsis,
                    module: module.clone(),
                })),
                Err(err) => {
                    tracing::debug!(module = %module.display(), error = %err, "skipping module");
                }
            }
        }
        out
    }

    /// Module providing `name`, preferring `version` (number or version string) when given.
    pub fn locate(
        &self,
        registry: &LibraryRegistry,
        name: &str,
        version: Option<&str>,
    ) -> Result<FoundRecipe, Error> {
        let candidates: Vec<FoundRecipe> = self
            .recipes(registry)
            .into_iter()
            .filter(|found| found.name == name)
            .collect();
        let requested = version.and_then(|wanted| {
            candidates
                .iter()
                .find(|found| found.version.to_string() == wanted || found.version_string == wanted)
        });
        if let Some(found) = requested {
            return Ok(found.clone());
        }
        candidates
            .into_iter()
            .max_by_key(|found| found.version)
            .ok_or_else(|| {
                Error::new(ErrorKind::RecipeNotFound)
                    .with_message(format!("recipe '{name}' not found on the search path"))
                    .with_hint("Add the pipeline's plugin directory with --recipe-dir.")
            })
    }
}

fn collect_modules(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        tracing::debug!(dir = %dir.display(), "skipping unreadable recipe directory");
        return;
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|entry| entry.ok()).map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_modules(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "so") {
            out.push(path);
        }
    }
}
