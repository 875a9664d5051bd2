//! Secondary-dex storage layouts: detection, unpack and repackage.
//!
//! Build tooling has accumulated several mutually incompatible on-disk
//! layouts for secondary dexes. Exactly one layout is selected per storage
//! unit (the top-level archive, or one feature module) by trying detection
//! predicates in a fixed priority order; the shared primary-dex and
//! loose-secondary behavior lives in free functions over the common
//! [`Layout`] fields rather than in the variants themselves.

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::{
    RepackOptions, RunContext, METADATA_FILE, SECONDARY_DEX_DIR, SECONDARY_STORE_NAME,
};
use crate::pack::archive::{extract_dex_jar, write_dex_jar};
use crate::pack::metadata::DexMetadata;
use crate::pack::xz::{self, XzCheck};

/// Common fields of every storage layout. All directories are relative to
/// the extracted archive root.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Layout {
    /// Directory holding the primary `<dex_prefix>.dex`.
    pub primary_dir: PathBuf,
    /// Directory holding the secondary dex payloads.
    pub secondary_dir: PathBuf,
    /// Directory holding `metadata.txt` (differs from `secondary_dir` only
    /// for the root-relative layout).
    pub metadata_dir: PathBuf,
    pub dex_prefix: String,
    pub canary_prefix: String,
    /// Base name of the concatenated xzs blob.
    pub store_name: String,
    pub store_id: Option<String>,
    pub dependencies: Vec<String>,
    pub is_root_relative: bool,
}

impl Layout {
    pub fn top_level(is_split: bool) -> Self {
        let base: PathBuf = if is_split { "base".into() } else { PathBuf::new() };
        Self {
            primary_dir: base.clone(),
            secondary_dir: base.join(SECONDARY_DEX_DIR),
            metadata_dir: base.join(SECONDARY_DEX_DIR),
            dex_prefix: "classes".into(),
            canary_prefix: SECONDARY_STORE_NAME.into(),
            store_name: SECONDARY_STORE_NAME.into(),
            store_id: None,
            dependencies: vec![],
            is_root_relative: false,
        }
    }

    pub fn primary_dex(&self, root: &Path) -> PathBuf {
        root.join(&self.primary_dir)
            .join(format!("{}.dex", self.dex_prefix))
    }

    pub fn secondary_name(&self, index: usize) -> String {
        format!("{}{index}.dex", self.dex_prefix)
    }

    pub fn secondary_path(&self, root: &Path, index: usize) -> PathBuf {
        root.join(&self.secondary_dir).join(self.secondary_name(index))
    }

    pub fn metadata_path(&self, root: &Path) -> PathBuf {
        root.join(&self.metadata_dir).join(METADATA_FILE)
    }

    pub fn xzs_blob(&self, root: &Path) -> PathBuf {
        root.join(&self.secondary_dir)
            .join(format!("{}.dex.jar.xzs", self.store_name))
    }

    /// Canary descriptor for `<dex_prefix><index>.dex`: the two-digit number
    /// is the 1-based dex-file index minus one, so `classes2.dex` maps to
    /// `<canary_prefix>.dex01.Canary`.
    pub fn canary_descriptor(&self, index: usize) -> String {
        format!("{}.dex{:02}.Canary", self.canary_prefix, index - 1)
    }
}

/// One storage layout per historically-accumulated packaging scheme.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum DexStorageMode {
    /// Secondary dexes individually jar-wrapped, byte-concatenated and
    /// compressed into one `<store>.dex.jar.xzs` blob.
    XzsConcatenated(Layout),
    /// One `classes<N>.dex.jar` per secondary dex under the secondary dir.
    SubdirJar(Layout),
    /// Module-only: loose dexes under the module's `dex/` subdirectory.
    ModuleLocal(Layout),
    /// Module-only: loose `classes*.dex` colocated with the module metadata
    /// (or at the split root for split-archive layouts).
    Api21Native(Layout),
    /// Loose `classes<N>.dex` beside the primary dex. Top-level fallback.
    RootRelative(Layout),
}

impl DexStorageMode {
    pub fn layout(&self) -> &Layout {
        match self {
            Self::XzsConcatenated(layout)
            | Self::SubdirJar(layout)
            | Self::ModuleLocal(layout)
            | Self::Api21Native(layout)
            | Self::RootRelative(layout) => layout,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::XzsConcatenated(_) => "xzs-concatenated-secondary",
            Self::SubdirJar(_) => "subdir-jar-secondary",
            Self::ModuleLocal(_) => "module-local-secondary",
            Self::Api21Native(_) => "api21-native-module-secondary",
            Self::RootRelative(_) => "root-relative-secondary",
        }
    }

    /// Selects the layout of the top-level storage unit. Detection is total:
    /// the root-relative fallback always matches, and a missing primary dex
    /// only surfaces at unpack time.
    pub fn detect_top_level(root: &Path, is_split: bool) -> Result<Self> {
        let layout = Layout::top_level(is_split);
        if layout.xzs_blob(root).is_file() {
            return Ok(Self::XzsConcatenated(layout));
        }
        if dir_contains_suffix(&root.join(&layout.secondary_dir), ".dex.jar")? {
            return Ok(Self::SubdirJar(layout));
        }
        let mut layout = layout;
        layout.secondary_dir = layout.primary_dir.clone();
        layout.is_root_relative = true;
        Ok(Self::RootRelative(layout))
    }

    /// Selects the layout of one feature module, trying the historical
    /// shapes in their fixed order. Archives from different build tooling
    /// may satisfy more than one predicate; the order decides. Unlike the
    /// top level there is no unconditional fallback: a module matching
    /// nothing is a caller error.
    pub fn detect_module(
        root: &Path,
        name: &str,
        module_dir: &Path,
        split_root: Option<&Path>,
        canary_prefix: Option<String>,
        dependencies: Vec<String>,
    ) -> Result<Self> {
        let base = Layout {
            primary_dir: module_dir.to_path_buf(),
            secondary_dir: module_dir.to_path_buf(),
            metadata_dir: module_dir.to_path_buf(),
            dex_prefix: name.to_string(),
            canary_prefix: canary_prefix.unwrap_or_else(|| name.to_string()),
            store_name: name.to_string(),
            store_id: Some(name.to_string()),
            dependencies,
            is_root_relative: false,
        };

        // 1. Concatenated xzs blob in the module's asset directory.
        if base.xzs_blob(root).is_file() {
            return Ok(Self::XzsConcatenated(base));
        }

        // 2. Module-local `dex/` subdirectory with loose classes*.dex.
        let mut local = base.clone();
        local.primary_dir = module_dir.join("dex");
        local.secondary_dir = local.primary_dir.clone();
        local.dex_prefix = "classes".into();
        if local.primary_dex(root).is_file() {
            return Ok(Self::ModuleLocal(local));
        }

        // 3. Split-archive native: loose classes*.dex at the split root.
        if let Some(split_root) = split_root {
            let mut split = base.clone();
            split.primary_dir = split_root.to_path_buf();
            split.secondary_dir = split_root.to_path_buf();
            split.dex_prefix = "classes".into();
            if split.primary_dex(root).is_file() {
                return Ok(Self::Api21Native(split));
            }
        }

        // 4. Native module: classes*.dex colocated with metadata.txt.
        let mut native = base.clone();
        native.dex_prefix = "classes".into();
        if native.primary_dex(root).is_file() {
            return Ok(Self::Api21Native(native));
        }

        // 5. Module-level root-relative: `<name>.dex` beside metadata.txt.
        let mut loose = base;
        loose.is_root_relative = true;
        if loose.primary_dex(root).is_file() {
            return Ok(Self::RootRelative(loose));
        }

        bail!(
            "No dex storage layout matches module `{name}` at `{}`",
            module_dir.display()
        );
    }

    /// Relocates the unit's primary and secondary dexes into `dex_dir`,
    /// decompressing and un-concatenating as the layout requires. Returns
    /// the relocated files in dex-index order, primary first.
    pub fn unpack(
        &self,
        root: &Path,
        dex_dir: &Path,
        ctx: &mut RunContext,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dex_dir)
            .with_context(|| format!("Creating dex directory `{}`", dex_dir.display()))?;
        match self {
            Self::RootRelative(layout) | Self::ModuleLocal(layout) | Self::Api21Native(layout) => {
                unpack_loose(root, layout, dex_dir)
            }
            Self::SubdirJar(layout) => unpack_subdir_jars(root, layout, dex_dir),
            Self::XzsConcatenated(layout) => unpack_xzs(root, layout, dex_dir, ctx),
        }
    }

    /// Inverse of [`unpack`](Self::unpack): discovers the optimizer's output
    /// dexes by sequential numeric suffix starting at 2 (the first missing
    /// index terminates discovery), re-wraps each into the layout's on-disk
    /// shape and writes the unit's `metadata.txt`.
    pub fn repackage(
        &self,
        root: &Path,
        dex_dir: &Path,
        opts: &RepackOptions,
        ctx: &mut RunContext,
    ) -> Result<DexMetadata> {
        let layout = self.layout();
        let mut meta = DexMetadata::new(
            layout.store_id.clone(),
            layout.dependencies.clone(),
            layout.is_root_relative,
        );
        meta.has_locators = opts.have_locators;
        meta.locator_store_id = opts.locator_store_id;

        repackage_primary(root, layout, dex_dir)?;
        match self {
            Self::RootRelative(_) | Self::ModuleLocal(_) | Self::Api21Native(_) => {
                repackage_loose(root, layout, dex_dir, &mut meta)?;
            }
            Self::SubdirJar(_) => repackage_subdir_jars(root, layout, dex_dir, &mut meta)?,
            Self::XzsConcatenated(_) => {
                repackage_xzs(root, layout, dex_dir, &mut meta, opts, ctx)?;
            }
        }

        if !meta.entries.is_empty() {
            fs::create_dir_all(root.join(&layout.metadata_dir))?;
            meta.write(&layout.metadata_path(root))?;
        } else {
            // A leftover metadata.txt from before the optimizer ran would
            // advertise secondaries that no longer exist.
            let stale = layout.metadata_path(root);
            if stale.is_file() {
                fs::remove_file(&stale)
                    .with_context(|| format!("Removing stale `{}`", stale.display()))?;
            }
        }
        Ok(meta)
    }
}

fn unpack_primary(root: &Path, layout: &Layout, dex_dir: &Path) -> Result<PathBuf> {
    let src = layout.primary_dex(root);
    ensure!(
        src.is_file(),
        "Primary dex `{}` is missing; not a valid application archive",
        src.display()
    );
    let dest = dex_dir.join(format!("{}.dex", layout.dex_prefix));
    move_file(&src, &dest)?;
    Ok(dest)
}

fn repackage_primary(root: &Path, layout: &Layout, dex_dir: &Path) -> Result<()> {
    let flat = dex_dir.join(format!("{}.dex", layout.dex_prefix));
    let src = if flat.is_file() {
        flat
    } else {
        match single_dex_in(&dex_dir.join("dex0"))? {
            Some(src) => src,
            None => bail!(
                "Optimizer output has no primary dex under `{}`",
                dex_dir.display()
            ),
        }
    };
    let dest = layout.primary_dex(root);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    move_file(&src, &dest)
}

fn unpack_loose(root: &Path, layout: &Layout, dex_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![unpack_primary(root, layout, dex_dir)?];
    let mut index = 2;
    loop {
        let src = layout.secondary_path(root, index);
        if !src.is_file() {
            break;
        }
        let dest = dex_dir.join(layout.secondary_name(index));
        move_file(&src, &dest)?;
        files.push(dest);
        index += 1;
    }
    Ok(files)
}

fn repackage_loose(
    root: &Path,
    layout: &Layout,
    dex_dir: &Path,
    meta: &mut DexMetadata,
) -> Result<()> {
    let mut index = 2;
    while let Some(src) = find_secondary_dex(dex_dir, layout, index)? {
        let dest = layout.secondary_path(root, index);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        meta.add_dex(&src, layout.secondary_name(index), layout.canary_descriptor(index))?;
        move_file(&src, &dest)?;
        index += 1;
    }
    Ok(())
}

fn unpack_subdir_jars(root: &Path, layout: &Layout, dex_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![unpack_primary(root, layout, dex_dir)?];
    let secondary_dir = root.join(&layout.secondary_dir);
    let mut index = 2;
    loop {
        let jar = secondary_dir.join(format!("{}.jar", layout.secondary_name(index)));
        if !jar.is_file() {
            break;
        }
        let dest = dex_dir.join(layout.secondary_name(index));
        let jar_bytes =
            fs::read(&jar).with_context(|| format!("Reading `{}`", jar.display()))?;
        extract_dex_jar(&jar_bytes, &dest)
            .with_context(|| format!("Unwrapping `{}`", jar.display()))?;
        fs::remove_file(&jar)?;
        let sidecar = secondary_dir.join(format!("{}.jar.meta", layout.secondary_name(index)));
        if sidecar.is_file() {
            fs::remove_file(&sidecar)?;
        }
        files.push(dest);
        index += 1;
    }
    Ok(files)
}

fn repackage_subdir_jars(
    root: &Path,
    layout: &Layout,
    dex_dir: &Path,
    meta: &mut DexMetadata,
) -> Result<()> {
    let secondary_dir = root.join(&layout.secondary_dir);
    let mut index = 2;
    while let Some(src) = find_secondary_dex(dex_dir, layout, index)? {
        fs::create_dir_all(&secondary_dir)?;
        let name = layout.secondary_name(index);
        let jar = secondary_dir.join(format!("{name}.jar"));
        meta.add_dex(&src, name, layout.canary_descriptor(index))?;
        write_dex_jar(&src, &jar)?;
        fs::remove_file(&src)?;
        index += 1;
    }
    Ok(())
}

struct JarSizes {
    jar: u64,
    dex: u64,
}

/// Parses a `jar:<N> dex:<M>` size sidecar line.
fn parse_meta_sizes(line: &str) -> Result<JarSizes> {
    let mut jar = None;
    let mut dex = None;
    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix("jar:") {
            jar = Some(value.parse::<u64>().with_context(|| format!("Invalid jar size `{value}`"))?);
        } else if let Some(value) = token.strip_prefix("dex:") {
            dex = Some(value.parse::<u64>().with_context(|| format!("Invalid dex size `{value}`"))?);
        }
    }
    match (jar, dex) {
        (Some(jar), Some(dex)) => Ok(JarSizes { jar, dex }),
        _ => bail!("Malformed size sidecar line `{line}`"),
    }
}

/// Unpacks the concatenated-then-compressed scheme: decompress the blob,
/// slice it back into jars following the ordered jar list and the recorded
/// per-jar sizes, and unwrap each jar's dex. Any size mismatch means the
/// packaging is corrupt and is fatal.
fn unpack_xzs(
    root: &Path,
    layout: &Layout,
    dex_dir: &Path,
    ctx: &mut RunContext,
) -> Result<Vec<PathBuf>> {
    let mut files = vec![unpack_primary(root, layout, dex_dir)?];
    let secondary_dir = root.join(&layout.secondary_dir);
    let blob = layout.xzs_blob(root);
    let meta = DexMetadata::parse(&layout.metadata_path(root))
        .context("An xzs store requires the ordered jar list in metadata.txt")?;

    let concatenated = blob.with_extension("");
    xz::decompress(&blob, &concatenated, ctx)?;
    let blob_bytes = fs::read(&concatenated)
        .with_context(|| format!("Reading `{}`", concatenated.display()))?;

    let mut sizes = Vec::with_capacity(meta.entries.len());
    for entry in &meta.entries {
        let sidecar = secondary_dir.join(format!("{}.meta", entry.file_name));
        let line = fs::read_to_string(&sidecar).with_context(|| {
            format!(
                "Missing size sidecar `{}` for `{}`",
                sidecar.display(),
                entry.file_name
            )
        })?;
        sizes.push(
            parse_meta_sizes(&line)
                .with_context(|| format!("Parsing `{}`", sidecar.display()))?,
        );
    }

    let total: u64 = sizes.iter().map(|s| s.jar).sum();
    ensure!(
        total == blob_bytes.len() as u64,
        "Concatenated blob `{}` is {} bytes but its sidecars account for {total}",
        blob.display(),
        blob_bytes.len()
    );

    let mut offset = 0usize;
    for (position, (entry, size)) in meta.entries.iter().zip(&sizes).enumerate() {
        let end = offset + size.jar as usize;
        let jar_bytes = &blob_bytes[offset..end];
        let index = position + 2;
        let dest = dex_dir.join(layout.secondary_name(index));
        extract_dex_jar(jar_bytes, &dest)
            .with_context(|| format!("Unwrapping `{}`", entry.file_name))?;
        let dex_len = fs::metadata(&dest)?.len();
        ensure!(
            dex_len == size.dex,
            "`{}` decoded to {dex_len} bytes but its sidecar recorded {}",
            entry.file_name,
            size.dex
        );
        files.push(dest);
        offset = end;
    }

    // Housekeeping files are re-created at repackage time.
    fs::remove_file(&concatenated)?;
    fs::remove_file(&blob)?;
    for entry in &meta.entries {
        fs::remove_file(secondary_dir.join(format!("{}.meta", entry.file_name)))?;
    }
    Ok(files)
}

fn repackage_xzs(
    root: &Path,
    layout: &Layout,
    dex_dir: &Path,
    meta: &mut DexMetadata,
    opts: &RepackOptions,
    ctx: &mut RunContext,
) -> Result<()> {
    let secondary_dir = root.join(&layout.secondary_dir);
    let mut concatenated: Vec<u8> = vec![];
    let mut total: u64 = 0;
    let mut index = 2;
    while let Some(src) = find_secondary_dex(dex_dir, layout, index)? {
        fs::create_dir_all(&secondary_dir)?;
        let name = layout.secondary_name(index);
        let jar = secondary_dir.join(format!("{name}.jar"));
        write_dex_jar(&src, &jar)?;
        let jar_bytes = fs::read(&jar)?;
        let dex_len = fs::metadata(&src)?.len();
        fs::write(
            secondary_dir.join(format!("{name}.meta")),
            format!("jar:{} dex:{dex_len}\n", jar_bytes.len()),
        )?;
        meta.add_dex(&src, name, layout.canary_descriptor(index))?;
        total += jar_bytes.len() as u64;
        concatenated.extend_from_slice(&jar_bytes);
        fs::remove_file(&jar)?;
        fs::remove_file(&src)?;
        index += 1;
    }
    if meta.entries.is_empty() {
        return Ok(());
    }
    ensure!(
        total == concatenated.len() as u64,
        "Concatenation produced {} bytes, sidecars account for {total}",
        concatenated.len()
    );

    let concat_path = secondary_dir.join(format!("{}.dex.jar", layout.store_name));
    fs::write(&concat_path, &concatenated)?;
    let level = if opts.fast { 0 } else { 9 | xz::PRESET_EXTREME };
    xz::compress(&concat_path, &layout.xzs_blob(root), level, 0, XzCheck::Crc32, ctx)?;
    fs::remove_file(&concat_path)?;
    Ok(())
}

/// Locates the optimizer's output dex for one index: the flat
/// `<prefix><index>.dex` shape first, then the one-dex-per-`dex<i>/`
/// subdirectory contract. `None` terminates discovery (a gap is the normal
/// end condition, not an error).
fn find_secondary_dex(dex_dir: &Path, layout: &Layout, index: usize) -> Result<Option<PathBuf>> {
    let flat = dex_dir.join(layout.secondary_name(index));
    if flat.is_file() {
        return Ok(Some(flat));
    }
    single_dex_in(&dex_dir.join(format!("dex{}", index - 1)))
}

/// The optimizer's one-dex-per-subdirectory shape: `dex<i>/` holding exactly
/// one `classes*.dex`.
fn single_dex_in(subdir: &Path) -> Result<Option<PathBuf>> {
    if !subdir.is_dir() {
        return Ok(None);
    }
    let mut dexes: Vec<PathBuf> = fs::read_dir(subdir)
        .with_context(|| format!("Reading `{}`", subdir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "dex"))
        .collect();
    if dexes.len() == 1 {
        return Ok(dexes.pop());
    }
    ensure!(
        dexes.is_empty(),
        "`{}` must contain exactly one dex file, found {}",
        subdir.display(),
        dexes.len()
    );
    Ok(None)
}

fn dir_contains_suffix(dir: &Path, suffix: &str) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("Reading `{}`", dir.display()))? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(suffix) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    // Cross-device fallback.
    fs::copy(src, dest)
        .with_context(|| format!("Moving `{}` to `{}`", src.display(), dest.display()))?;
    fs::remove_file(src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn should_select_root_relative_for_plain_archives() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("classes.dex"), b"primary");

        let mode = DexStorageMode::detect_top_level(dir.path(), false).unwrap();
        assert!(matches!(mode, DexStorageMode::RootRelative(_)));
    }

    #[test]
    fn should_prefer_xzs_over_subdir_jars() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("classes.dex"), b"primary");
        let secondary = dir.path().join(SECONDARY_DEX_DIR);
        write(&secondary.join("classes2.dex.jar"), b"jar");
        write(&secondary.join("secondary.dex.jar.xzs"), b"blob");

        let mode = DexStorageMode::detect_top_level(dir.path(), false).unwrap();
        assert!(matches!(mode, DexStorageMode::XzsConcatenated(_)));
    }

    #[test]
    fn should_select_subdir_jars_when_present() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("classes.dex"), b"primary");
        write(
            &dir.path().join(SECONDARY_DEX_DIR).join("classes2.dex.jar"),
            b"jar",
        );

        let mode = DexStorageMode::detect_top_level(dir.path(), false).unwrap();
        assert!(matches!(mode, DexStorageMode::SubdirJar(_)));
    }

    #[test]
    fn should_number_canaries_from_dex_index_minus_one() {
        let layout = Layout::top_level(false);
        assert_eq!(layout.canary_descriptor(2), "secondary.dex01.Canary");
        assert_eq!(layout.canary_descriptor(11), "secondary.dex10.Canary");
    }

    #[test]
    fn should_round_trip_root_relative_unit() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        write(&root.join("classes.dex"), b"primary");
        write(&root.join("classes2.dex"), b"secondary two");
        write(&root.join("classes3.dex"), b"secondary three");
        let dex_dir = dir.path().join("dex");

        let mode = DexStorageMode::detect_top_level(&root, false).unwrap();
        let mut ctx = RunContext::new();
        let files = mode.unpack(&root, &dex_dir, &mut ctx).unwrap();
        assert_eq!(files.len(), 3);
        assert!(!root.join("classes.dex").exists());
        assert!(dex_dir.join("classes3.dex").is_file());

        let meta = mode
            .repackage(&root, &dex_dir, &RepackOptions::default(), &mut ctx)
            .unwrap();
        assert_eq!(meta.entries.len(), 2);
        assert!(meta.is_root_relative);
        assert_eq!(meta.entries[0].canary, "secondary.dex01.Canary");
        assert_eq!(fs::read(root.join("classes2.dex")).unwrap(), b"secondary two");
        let written = DexMetadata::parse(&root.join(SECONDARY_DEX_DIR).join(METADATA_FILE)).unwrap();
        assert_eq!(written, meta);
    }

    #[test]
    fn should_not_write_metadata_for_zero_secondaries() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        write(&root.join("classes.dex"), b"primary");
        let dex_dir = dir.path().join("dex");

        let mode = DexStorageMode::detect_top_level(&root, false).unwrap();
        let mut ctx = RunContext::new();
        mode.unpack(&root, &dex_dir, &mut ctx).unwrap();
        let meta = mode
            .repackage(&root, &dex_dir, &RepackOptions::default(), &mut ctx)
            .unwrap();
        assert!(meta.entries.is_empty());
        assert!(!root.join(SECONDARY_DEX_DIR).join(METADATA_FILE).exists());
    }

    #[test]
    fn should_remove_stale_metadata_when_all_secondaries_are_dropped() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        write(&root.join("classes.dex"), b"primary");
        write(&root.join("classes2.dex"), b"secondary");
        write(
            &root.join(SECONDARY_DEX_DIR).join(METADATA_FILE),
            b".root_relative\nclasses2.dex da39a3ee5e6b4b0d3255bfef95601890afd80709 secondary.dex01.Canary\n",
        );
        let dex_dir = dir.path().join("dex");

        let mode = DexStorageMode::detect_top_level(&root, false).unwrap();
        let mut ctx = RunContext::new();
        mode.unpack(&root, &dex_dir, &mut ctx).unwrap();
        // The optimizer merged everything into the primary dex.
        fs::remove_file(dex_dir.join("classes2.dex")).unwrap();

        let meta = mode
            .repackage(&root, &dex_dir, &RepackOptions::default(), &mut ctx)
            .unwrap();
        assert!(meta.entries.is_empty());
        assert!(!root.join(SECONDARY_DEX_DIR).join(METADATA_FILE).exists());
        assert!(!root.join("classes2.dex").exists());
    }

    #[test]
    fn should_round_trip_subdir_jar_unit() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let dex_dir = dir.path().join("dex");
        write(&dex_dir.join("classes.dex"), b"primary");
        write(&dex_dir.join("classes2.dex"), b"secondary two");
        fs::create_dir_all(&root).unwrap();

        let mode = DexStorageMode::SubdirJar(Layout::top_level(false));
        let mut ctx = RunContext::new();
        mode.repackage(&root, &dex_dir, &RepackOptions::default(), &mut ctx)
            .unwrap();
        assert!(root
            .join(SECONDARY_DEX_DIR)
            .join("classes2.dex.jar")
            .is_file());

        let detected = DexStorageMode::detect_top_level(&root, false).unwrap();
        assert!(matches!(detected, DexStorageMode::SubdirJar(_)));
        let dex_dir2 = dir.path().join("dex2");
        let files = detected.unpack(&root, &dex_dir2, &mut ctx).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read(dex_dir2.join("classes2.dex")).unwrap(), b"secondary two");
        // Jar wrappers are housekeeping and must be gone after unpack.
        assert!(!root.join(SECONDARY_DEX_DIR).join("classes2.dex.jar").exists());
    }

    #[test]
    fn should_round_trip_xzs_unit_and_hold_size_invariant() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let dex_dir = dir.path().join("dex");
        write(&dex_dir.join("classes.dex"), b"primary");
        write(&dex_dir.join("classes2.dex"), &vec![0xAA; 100]);
        write(&dex_dir.join("classes3.dex"), &vec![0xBB; 200]);
        write(&dex_dir.join("classes4.dex"), &vec![0xCC; 150]);
        fs::create_dir_all(&root).unwrap();

        let mode = DexStorageMode::XzsConcatenated(Layout::top_level(false));
        let mut ctx = RunContext::new();
        let opts = RepackOptions {
            fast: true,
            ..RepackOptions::default()
        };
        let meta = mode.repackage(&root, &dex_dir, &opts, &mut ctx).unwrap();
        assert_eq!(meta.entries.len(), 3);
        let secondary = root.join(SECONDARY_DEX_DIR);
        assert!(secondary.join("secondary.dex.jar.xzs").is_file());

        // The sidecars must account for the concatenated blob exactly.
        let mut sidecar_total = 0u64;
        for entry in &meta.entries {
            let line = fs::read_to_string(secondary.join(format!("{}.meta", entry.file_name)))
                .unwrap();
            sidecar_total += parse_meta_sizes(&line).unwrap().jar;
        }
        let blob = secondary.join("secondary.dex.jar.xzs");
        let concatenated = dir.path().join("concat");
        xz::decompress(&blob, &concatenated, &mut ctx).unwrap();
        assert_eq!(sidecar_total, fs::metadata(&concatenated).unwrap().len());

        let detected = DexStorageMode::detect_top_level(&root, false).unwrap();
        assert!(matches!(detected, DexStorageMode::XzsConcatenated(_)));
        let dex_dir2 = dir.path().join("dex2");
        let files = detected.unpack(&root, &dex_dir2, &mut ctx).unwrap();
        assert_eq!(files.len(), 4);
        assert_eq!(fs::read(dex_dir2.join("classes2.dex")).unwrap(), vec![0xAA; 100]);
        assert_eq!(fs::read(dex_dir2.join("classes4.dex")).unwrap(), vec![0xCC; 150]);
    }

    #[test]
    fn should_reject_xzs_blob_with_size_mismatch() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let dex_dir = dir.path().join("dex");
        write(&dex_dir.join("classes.dex"), b"primary");
        write(&dex_dir.join("classes2.dex"), &vec![0xAA; 64]);
        fs::create_dir_all(&root).unwrap();

        let mode = DexStorageMode::XzsConcatenated(Layout::top_level(false));
        let mut ctx = RunContext::new();
        let opts = RepackOptions {
            fast: true,
            ..RepackOptions::default()
        };
        mode.repackage(&root, &dex_dir, &opts, &mut ctx).unwrap();

        // Corrupt the recorded jar size.
        let sidecar = root.join(SECONDARY_DEX_DIR).join("classes2.dex.meta");
        let line = fs::read_to_string(&sidecar).unwrap();
        let dex_part = line.split_whitespace().nth(1).unwrap().to_string();
        fs::write(&sidecar, format!("jar:1 {dex_part}\n")).unwrap();

        let dex_dir2 = dir.path().join("dex2");
        let err = mode.unpack(&root, &dex_dir2, &mut ctx).unwrap_err();
        assert!(err.to_string().contains("account for"));
    }

    #[test]
    fn should_discover_dexes_in_optimizer_subdir_layout() {
        let dir = tempdir().unwrap();
        let dex_dir = dir.path().join("dex");
        write(&dex_dir.join("dex1").join("classes2.dex"), b"from subdir");
        let layout = Layout::top_level(false);

        let found = find_secondary_dex(&dex_dir, &layout, 2).unwrap().unwrap();
        assert_eq!(fs::read(found).unwrap(), b"from subdir");
        assert!(find_secondary_dex(&dex_dir, &layout, 3).unwrap().is_none());
    }

    #[test]
    fn should_repackage_from_optimizer_subdir_layout() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let dex_dir = dir.path().join("dex");
        write(&dex_dir.join("dex0").join("classes.dex"), b"primary");
        write(&dex_dir.join("dex1").join("classes2.dex"), b"secondary");
        fs::create_dir_all(&root).unwrap();

        let mut layout = Layout::top_level(false);
        layout.secondary_dir = layout.primary_dir.clone();
        layout.is_root_relative = true;
        let mode = DexStorageMode::RootRelative(layout);
        let mut ctx = RunContext::new();
        let meta = mode
            .repackage(&root, &dex_dir, &RepackOptions::default(), &mut ctx)
            .unwrap();
        assert_eq!(meta.entries.len(), 1);
        assert_eq!(fs::read(root.join("classes.dex")).unwrap(), b"primary");
        assert_eq!(fs::read(root.join("classes2.dex")).unwrap(), b"secondary");
    }

    #[test]
    fn should_stop_discovery_at_first_gap() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let dex_dir = dir.path().join("dex");
        write(&dex_dir.join("classes.dex"), b"primary");
        write(&dex_dir.join("classes2.dex"), b"two");
        // classes3.dex missing, classes4.dex present: 4 must be ignored.
        write(&dex_dir.join("classes4.dex"), b"four");
        fs::create_dir_all(&root).unwrap();

        let mut layout = Layout::top_level(false);
        layout.secondary_dir = layout.primary_dir.clone();
        layout.is_root_relative = true;
        let mode = DexStorageMode::RootRelative(layout);
        let mut ctx = RunContext::new();
        let meta = mode
            .repackage(&root, &dex_dir, &RepackOptions::default(), &mut ctx)
            .unwrap();
        assert_eq!(meta.entries.len(), 1);
    }

    #[test]
    fn should_try_module_shapes_in_fixed_order() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let module_dir = Path::new("assets/feature_camera");

        // Nothing present: fatal.
        fs::create_dir_all(root.join(module_dir)).unwrap();
        assert!(DexStorageMode::detect_module(
            root,
            "feature_camera",
            module_dir,
            None,
            None,
            vec![]
        )
        .is_err());

        // Loose module dex: root-relative fallback for modules.
        write(&root.join(module_dir).join("feature_camera.dex"), b"dex");
        let mode = DexStorageMode::detect_module(
            root,
            "feature_camera",
            module_dir,
            None,
            None,
            vec![],
        )
        .unwrap();
        assert!(matches!(mode, DexStorageMode::RootRelative(_)));

        // Colocated classes.dex takes precedence over the loose shape.
        write(&root.join(module_dir).join("classes.dex"), b"dex");
        let mode = DexStorageMode::detect_module(
            root,
            "feature_camera",
            module_dir,
            None,
            None,
            vec![],
        )
        .unwrap();
        assert!(matches!(mode, DexStorageMode::Api21Native(_)));

        // A dex/ subdirectory outranks both.
        write(&root.join(module_dir).join("dex/classes.dex"), b"dex");
        let mode = DexStorageMode::detect_module(
            root,
            "feature_camera",
            module_dir,
            None,
            None,
            vec![],
        )
        .unwrap();
        assert!(matches!(mode, DexStorageMode::ModuleLocal(_)));

        // The xzs blob outranks everything.
        write(
            &root.join(module_dir).join("feature_camera.dex.jar.xzs"),
            b"blob",
        );
        let mode = DexStorageMode::detect_module(
            root,
            "feature_camera",
            module_dir,
            None,
            None,
            vec![],
        )
        .unwrap();
        assert!(matches!(mode, DexStorageMode::XzsConcatenated(_)));
    }
}
