//! Feature-module discovery and per-module dex handling.
//!
//! A feature module is an asset directory carrying its own `metadata.txt`.
//! Discovery only reads metadata; the module's storage layout is selected
//! lazily, on first unpack, because selection probes the extracted tree.

use anyhow::{bail, ensure, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::{RepackOptions, RunContext, METADATA_FILE, SECONDARY_DEX_DIR};
use crate::pack::dex_mode::DexStorageMode;
use crate::pack::metadata::DexMetadata;

/// One discovered feature module.
#[derive(Debug, Deserialize, Serialize)]
pub struct ApplicationModule {
    name: String,
    /// Asset directory holding the module's `metadata.txt`, relative to the
    /// archive root.
    module_dir: PathBuf,
    /// Top-level split directory for split archives, relative to the root.
    split_root: Option<PathBuf>,
    dependencies: Vec<String>,
    canary_prefix: Option<String>,
    mode: Option<DexStorageMode>,
}

/// Sidecar written next to each module's dex directory so the optimizer can
/// see module identity, dependencies and dex files without re-walking the
/// extracted archive.
#[derive(Serialize)]
struct ModuleDescriptor<'a> {
    id: &'a str,
    requires: &'a [String],
    files: Vec<String>,
}

impl ApplicationModule {
    /// Finds every feature module in the extracted tree, sorted by module
    /// directory for a deterministic processing order. The shared secondary
    /// store directory also carries a `metadata.txt` and must not be
    /// mistaken for a module.
    pub fn discover(root: &Path, is_split: bool) -> Result<Vec<Self>> {
        let mut modules = vec![];
        if is_split {
            for entry in
                fs::read_dir(root).with_context(|| format!("Reading `{}`", root.display()))?
            {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let split_rel = PathBuf::from(entry.file_name());
                scan_assets(root, &split_rel.join("assets"), true, &mut modules)?;
            }
        } else {
            scan_assets(root, Path::new("assets"), false, &mut modules)?;
        }
        modules.sort_by(|a, b| a.module_dir.cmp(&b.module_dir));
        Ok(modules)
    }

    fn from_metadata(module_dir: PathBuf, is_split: bool, metadata_path: &Path) -> Result<Self> {
        let meta = DexMetadata::parse(metadata_path)?;
        let dir_name = module_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("Module directory `{}` has no name", module_dir.display()))?;
        let name = meta.store_id.clone().unwrap_or(dir_name);
        // In a split archive a module may ship as its own split, named after
        // the module, with the dexes at that split's root.
        let split_root = is_split.then(|| PathBuf::from(&name));
        let canary_prefix = recover_canary_prefix(&meta)
            .with_context(|| format!("Reading canaries of module `{name}`"))?;
        Ok(Self {
            name,
            module_dir,
            split_root,
            dependencies: meta.dependencies,
            canary_prefix,
            mode: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn storage_mode(&mut self, root: &Path) -> Result<DexStorageMode> {
        if let Some(mode) = &self.mode {
            return Ok(mode.clone());
        }
        let mode = DexStorageMode::detect_module(
            root,
            &self.name,
            &self.module_dir,
            self.split_root.as_deref(),
            self.canary_prefix.clone(),
            self.dependencies.clone(),
        )?;
        log::info!("Module `{}` stores dexes as {}", self.name, mode.name());
        self.mode = Some(mode.clone());
        Ok(mode)
    }

    /// Relocates the module's dexes into `<dex_root>/<name>/` and writes the
    /// module descriptor beside it.
    pub fn unpack(&mut self, root: &Path, dex_root: &Path, ctx: &mut RunContext) -> Result<()> {
        let mode = self.storage_mode(root)?;
        let module_dex_dir = dex_root.join(&self.name);
        let files = mode
            .unpack(root, &module_dex_dir, ctx)
            .with_context(|| format!("Unpacking module `{}`", self.name))?;
        self.write_descriptor(dex_root, &files)?;
        Ok(())
    }

    /// Moves the optimizer's output for this module back into its on-disk
    /// layout and removes the descriptor.
    pub fn repackage(
        &mut self,
        root: &Path,
        dex_root: &Path,
        opts: &RepackOptions,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let mode = self.storage_mode(root)?;
        let module_dex_dir = dex_root.join(&self.name);
        ensure!(
            module_dex_dir.is_dir(),
            "Optimizer output is missing the directory for module `{}`",
            self.name
        );
        mode.repackage(root, &module_dex_dir, opts, ctx)
            .with_context(|| format!("Repackaging module `{}`", self.name))?;
        let descriptor = dex_root.join(format!("{}.json", self.name));
        if descriptor.is_file() {
            fs::remove_file(&descriptor)?;
        }
        Ok(())
    }

    fn write_descriptor(&self, dex_root: &Path, files: &[PathBuf]) -> Result<()> {
        let files = files
            .iter()
            .map(|path| {
                path.strip_prefix(dex_root)
                    .map(|rel| rel.to_string_lossy().into_owned())
                    .with_context(|| format!("`{}` escapes the dex directory", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        let descriptor = ModuleDescriptor {
            id: &self.name,
            requires: &self.dependencies,
            files,
        };
        let path = dex_root.join(format!("{}.json", self.name));
        let json = serde_json::to_string_pretty(&descriptor)?;
        fs::write(&path, json).with_context(|| format!("Writing `{}`", path.display()))
    }
}

fn scan_assets(
    root: &Path,
    assets_rel: &Path,
    is_split: bool,
    out: &mut Vec<ApplicationModule>,
) -> Result<()> {
    let shared_store = Path::new(SECONDARY_DEX_DIR)
        .file_name()
        .unwrap_or_default()
        .to_os_string();
    let assets_abs = root.join(assets_rel);
    if !assets_abs.is_dir() {
        return Ok(());
    }
    for entry in
        fs::read_dir(&assets_abs).with_context(|| format!("Reading `{}`", assets_abs.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() || entry.file_name() == shared_store {
            continue;
        }
        let metadata_path = entry.path().join(METADATA_FILE);
        if !metadata_path.is_file() {
            continue;
        }
        out.push(ApplicationModule::from_metadata(
            assets_rel.join(entry.file_name()),
            is_split,
            &metadata_path,
        )?);
    }
    Ok(())
}

/// Recovers the canary class prefix from the module's recorded entries. The
/// prefix may itself contain dots, so the two-digit index and the `Canary`
/// suffix anchor the parse.
fn recover_canary_prefix(meta: &DexMetadata) -> Result<Option<String>> {
    let Some(entry) = meta.entries.first() else {
        return Ok(None);
    };
    let pattern = Regex::new(r"^([A-Za-z_][A-Za-z0-9_$.]*)\.dex\d{2}\.Canary$")
        .context("Compiling canary pattern")?;
    let Some(captures) = pattern.captures(&entry.canary) else {
        bail!("Malformed canary descriptor `{}`", entry.canary);
    };
    Ok(Some(captures[1].to_string()))
}
