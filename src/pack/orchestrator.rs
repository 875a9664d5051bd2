//! End-to-end unpack/repackage orchestration.
//!
//! [`UnpackOrchestrator`] configures one run; [`UnpackSession`] is the live
//! state between unpack and repackage, while an external optimizer rewrites
//! the dex files laid out under the dex directory.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use zip::CompressionMethod;

use crate::core::config::{
    RepackOptions, RunContext, BUNDLE_CONFIG_FILE, FIXED_DOS_DATE, FIXED_DOS_TIME,
};
use crate::pack::archive::ArchiveContainer;
use crate::pack::dex_mode::DexStorageMode;
use crate::pack::module::ApplicationModule;
use crate::pack::native_libs::{self, StagedLibs};
use crate::pack::zip_patch;

/// Session state file written by [`UnpackSession::save`] at the extracted
/// root, removed again before the final repack.
const STATE_FILE: &str = "repack-state.json";

#[derive(Deserialize, Serialize)]
struct SessionState {
    is_split: bool,
    dex_dir: PathBuf,
    mode: DexStorageMode,
    modules: Vec<ApplicationModule>,
    /// Per-entry compression method, `stored` or `deflated`.
    methods: BTreeMap<String, String>,
    staged_dirs: Vec<PathBuf>,
}

/// Configuration for one unpack run.
pub struct UnpackOrchestrator {
    input: PathBuf,
    work_dir: PathBuf,
    dex_dir: PathBuf,
    split_override: Option<bool>,
    xz_binary: Option<PathBuf>,
}

impl UnpackOrchestrator {
    pub fn new(input: PathBuf, work_dir: PathBuf, dex_dir: PathBuf) -> Self {
        Self {
            input,
            work_dir,
            dex_dir,
            split_override: None,
            xz_binary: None,
        }
    }

    /// Forces the split/flat decision instead of probing for
    /// `BundleConfig.pb` at the extracted root.
    pub fn split_override(mut self, is_split: Option<bool>) -> Self {
        self.split_override = is_split;
        self
    }

    pub fn xz_binary(mut self, path: Option<PathBuf>) -> Self {
        self.xz_binary = path;
        self
    }

    /// Extracts the archive, selects storage layouts, relocates every dex
    /// into the dex directory and stages native libraries.
    pub fn unpack(self) -> Result<UnpackSession> {
        let mut ctx = RunContext::with_xz_binary(self.xz_binary);
        let container = ArchiveContainer::extract(&self.input, &self.work_dir)?;
        let root = container.work_dir().to_path_buf();

        let is_split = match self.split_override {
            Some(is_split) => is_split,
            None => root.join(BUNDLE_CONFIG_FILE).is_file(),
        };
        let mode = DexStorageMode::detect_top_level(&root, is_split)?;
        log::info!(
            "`{}` unpacked as a {} archive storing dexes as {}",
            self.input.display(),
            if is_split { "split" } else { "flat" },
            mode.name()
        );

        match fs::create_dir(&self.dex_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                bail!(
                    "Dex directory `{}` already exists; refusing to mix runs",
                    self.dex_dir.display()
                );
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Creating `{}`", self.dex_dir.display()));
            }
        }

        let files = mode.unpack(&root, &self.dex_dir, &mut ctx)?;
        log::debug!("Relocated {} top-level dex files", files.len());

        let mut modules = ApplicationModule::discover(&root, is_split)?;
        for module in &mut modules {
            module.unpack(&root, &self.dex_dir, &mut ctx)?;
        }

        let staged = native_libs::stage(&root, &mut ctx)?;

        Ok(UnpackSession {
            container,
            mode,
            modules,
            staged,
            ctx,
            dex_dir: self.dex_dir,
            is_split,
        })
    }
}

/// Live state between unpack and repackage.
#[derive(Debug)]
pub struct UnpackSession {
    container: ArchiveContainer,
    mode: DexStorageMode,
    modules: Vec<ApplicationModule>,
    staged: StagedLibs,
    ctx: RunContext,
    dex_dir: PathBuf,
    is_split: bool,
}

impl UnpackSession {
    pub fn dex_dir(&self) -> &Path {
        &self.dex_dir
    }

    pub fn is_split(&self) -> bool {
        self.is_split
    }

    pub fn mode_name(&self) -> &'static str {
        self.mode.name()
    }

    pub fn staged_libraries(&self) -> &[PathBuf] {
        self.staged.files()
    }

    /// The run context, for callers that rename entries between unpack and
    /// repackage and need the original compression methods preserved.
    pub fn context_mut(&mut self) -> &mut RunContext {
        &mut self.ctx
    }

    /// Writes the session to `repack-state.json` at the extracted root and
    /// disarms the staging cleanup, so a separate process can pick the
    /// session up with [`load`](Self::load) after the optimizer ran.
    pub fn save(self) -> Result<()> {
        let methods = self
            .container
            .methods()
            .iter()
            .map(|(name, method)| {
                let method = match method {
                    CompressionMethod::Stored => "stored",
                    _ => "deflated",
                };
                (name.clone(), method.to_string())
            })
            .collect();
        let state_path = self.container.work_dir().join(STATE_FILE);
        let state = SessionState {
            is_split: self.is_split,
            dex_dir: self.dex_dir,
            mode: self.mode,
            modules: self.modules,
            methods,
            staged_dirs: self.staged.into_scratch_dirs(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        fs::write(&state_path, json)
            .with_context(|| format!("Writing `{}`", state_path.display()))?;
        Ok(())
    }

    /// Restores a session saved by [`save`](Self::save).
    pub fn load(work_dir: &Path, xz_binary: Option<PathBuf>) -> Result<Self> {
        let state_path = work_dir.join(STATE_FILE);
        let json = fs::read_to_string(&state_path).with_context(|| {
            format!(
                "Reading `{}`; was this working directory produced by unpack?",
                state_path.display()
            )
        })?;
        let state: SessionState = serde_json::from_str(&json)
            .with_context(|| format!("Parsing `{}`", state_path.display()))?;

        let mut methods = HashMap::new();
        for (name, method) in state.methods {
            let method = match method.as_str() {
                "stored" => CompressionMethod::Stored,
                "deflated" => CompressionMethod::Deflated,
                other => bail!("Unknown compression method `{other}` for entry `{name}`"),
            };
            methods.insert(name, method);
        }

        Ok(Self {
            container: ArchiveContainer::from_parts(work_dir.to_path_buf(), methods),
            mode: state.mode,
            modules: state.modules,
            staged: StagedLibs::adopt(state.staged_dirs),
            ctx: RunContext::with_xz_binary(xz_binary),
            dex_dir: state.dex_dir,
            is_split: state.is_split,
        })
    }

    /// Moves the optimizer's output back into the archive layouts, removes
    /// staged scratch files and writes the final archive to `output`.
    pub fn repackage(mut self, output: &Path, opts: &RepackOptions) -> Result<()> {
        let root = self.container.work_dir().to_path_buf();
        for module in &mut self.modules {
            module.repackage(&root, &self.dex_dir, opts, &mut self.ctx)?;
        }
        let meta = self
            .mode
            .repackage(&root, &self.dex_dir, opts, &mut self.ctx)?;
        log::info!(
            "Repackaged {} top-level secondary dex files",
            meta.entries.len()
        );

        self.staged.cleanup()?;
        let state_path = root.join(STATE_FILE);
        if state_path.is_file() {
            fs::remove_file(&state_path)?;
        }
        self.container.repack(output, &self.ctx.renames)?;
        if opts.reset_timestamps {
            zip_patch::normalize_timestamps(output, FIXED_DOS_TIME, FIXED_DOS_DATE)?;
        }
        Ok(())
    }
}
