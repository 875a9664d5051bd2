//! Archive extraction and deterministic repacking.
//!
//! `extract` records each entry's compression method keyed by its in-archive
//! path so `repack` can restore it byte-for-byte reproducibly: signature
//! files are stripped, the tree is walked with sorted names, and every entry
//! is written with its original method (falling back to the caller's rename
//! map, then to DEFLATED).

use anyhow::{bail, ensure, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Owns the extraction working directory for the duration of one run.
#[derive(Debug)]
pub struct ArchiveContainer {
    work_dir: PathBuf,
    /// Compression method per in-archive path, captured at extraction time.
    methods: HashMap<String, CompressionMethod>,
}

impl ArchiveContainer {
    /// Extracts `input` into `work_dir`, capturing per-entry compression
    /// methods and failing fast on case-colliding entry paths (file systems
    /// that fold case would silently merge them and corrupt the dex view).
    pub fn extract(input: &Path, work_dir: &Path) -> Result<Self> {
        match fs::create_dir(work_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                bail!(
                    "Working directory `{}` already exists; refusing to extract over it",
                    work_dir.display()
                );
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Creating `{}`", work_dir.display()));
            }
        }

        let file =
            File::open(input).with_context(|| format!("Opening `{}`", input.display()))?;
        let mut archive = ZipArchive::new(file)
            .with_context(|| format!("Reading zip structure of `{}`", input.display()))?;

        let mut methods = HashMap::new();
        let mut by_lowercase: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut file_entries = 0usize;
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            let name = entry.name().to_string();
            if !entry.is_dir() {
                file_entries += 1;
                let method = match entry.compression() {
                    CompressionMethod::Stored => CompressionMethod::Stored,
                    CompressionMethod::Deflated => CompressionMethod::Deflated,
                    other => bail!(
                        "Entry `{name}` uses unsupported compression method {other}"
                    ),
                };
                methods.insert(name.clone(), method);
            }
            by_lowercase.entry(name.to_lowercase()).or_default().push(name);
        }

        let collisions: Vec<&Vec<String>> = by_lowercase
            .values()
            .filter(|names| names.len() > 1)
            .collect();
        if !collisions.is_empty() {
            let listing = collisions
                .iter()
                .map(|names| names.join(" <-> "))
                .collect::<Vec<_>>()
                .join("; ");
            bail!(
                "`{}` contains entries that collide on case-insensitive file systems: {listing}",
                input.display()
            );
        }

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                bail!(
                    "Entry `{}` escapes the extraction directory",
                    entry.name()
                );
            };
            let dest = work_dir.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&dest)?;
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)
                .with_context(|| format!("Creating `{}`", dest.display()))?;
            io::copy(&mut entry, &mut out)
                .with_context(|| format!("Extracting `{}`", entry.name()))?;
        }

        // Corroborates the collision check above by counting the distinct
        // files that actually landed on disk; a shortfall means the file
        // system merged paths the central directory listed separately.
        let mut on_disk = 0usize;
        for entry in WalkDir::new(work_dir) {
            if entry?.file_type().is_file() {
                on_disk += 1;
            }
        }
        ensure!(
            on_disk == file_entries,
            "Extraction produced {on_disk} files on disk but the archive lists {file_entries} entries"
        );

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            methods,
        })
    }

    /// Rebuilds a container from a previously captured method table, for
    /// repacking in a process that did not perform the extraction.
    pub fn from_parts(work_dir: PathBuf, methods: HashMap<String, CompressionMethod>) -> Self {
        Self { work_dir, methods }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn methods(&self) -> &HashMap<String, CompressionMethod> {
        &self.methods
    }

    #[cfg(test)]
    pub fn method_of(&self, name: &str) -> Option<CompressionMethod> {
        self.methods.get(name).copied()
    }

    /// Re-zips the working tree into `output`. Signature files under
    /// `META-INF/` are stripped; directory and file names are visited in
    /// sorted order so the output is byte deterministic.
    pub fn repack(&self, output: &Path, renames: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = ZipWriter::new(
            File::create(output).with_context(|| format!("Creating `{}`", output.display()))?,
        );
        self.add_tree(&mut writer, &self.work_dir, Path::new(""), renames)?;
        writer.finish()?;
        Ok(())
    }

    fn add_tree(
        &self,
        writer: &mut ZipWriter<File>,
        dir: &Path,
        prefix: &Path,
        renames: &HashMap<String, String>,
    ) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("Reading directory `{}`", dir.display()))?
            .collect::<io::Result<_>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let name = entry.file_name();
            let source = dir.join(&name);
            let in_archive = prefix.join(&name);
            if in_archive == Path::new("META-INF") {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.add_tree(writer, &source, &in_archive, renames)?;
            } else if file_type.is_file() {
                let zip_name = zip_entry_name(&in_archive);
                let method = self.method_for(&zip_name, renames);
                let mut input = File::open(&source)
                    .with_context(|| format!("Opening `{}`", source.display()))?;
                writer.start_file(
                    zip_name,
                    FileOptions::default().compression_method(method),
                )?;
                io::copy(&mut input, writer)?;
            }
        }
        Ok(())
    }

    fn method_for(&self, zip_name: &str, renames: &HashMap<String, String>) -> CompressionMethod {
        if let Some(method) = self.methods.get(zip_name) {
            return *method;
        }
        if let Some(original) = renames.get(zip_name) {
            if let Some(method) = self.methods.get(original) {
                return *method;
            }
        }
        CompressionMethod::Deflated
    }
}

fn zip_entry_name(path: &Path) -> String {
    path.iter()
        .map(|segment| segment.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Reads a single named entry out of an archive without extracting the rest.
pub fn read_zip_entry(archive: &Path, name: &str) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(archive)?)?;
    let mut entry = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Wraps a single dex payload into a jar-shaped zip with one `classes.dex`
/// entry, the shape the runtime's secondary dex loaders expect.
pub fn write_dex_jar(dex: &Path, jar: &Path) -> Result<()> {
    let mut writer = ZipWriter::new(
        File::create(jar).with_context(|| format!("Creating `{}`", jar.display()))?,
    );
    writer.start_file(
        "classes.dex",
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    let mut input = File::open(dex).with_context(|| format!("Opening `{}`", dex.display()))?;
    io::copy(&mut input, &mut writer)?;
    writer.finish()?;
    Ok(())
}

/// Extracts the `classes.dex` payload of a dex jar to `dest`.
pub fn extract_dex_jar(jar_bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(io::Cursor::new(jar_bytes))
        .context("Reading dex jar wrapper")?;
    let mut entry = archive
        .by_name("classes.dex")
        .context("Dex jar wrapper has no `classes.dex` entry")?;
    let mut out =
        File::create(dest).with_context(|| format!("Creating `{}`", dest.display()))?;
    io::copy(&mut entry, &mut out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn build_archive(path: &Path, entries: &[(&str, CompressionMethod, &[u8])]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, method, data) in entries {
            writer
                .start_file(*name, FileOptions::default().compression_method(*method))
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn should_preserve_compression_methods_across_round_trip() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        build_archive(
            &input,
            &[
                ("classes.dex", CompressionMethod::Deflated, b"dex bytes"),
                ("assets/raw.bin", CompressionMethod::Stored, b"raw bytes"),
                ("META-INF/CERT.SF", CompressionMethod::Deflated, b"signature"),
            ],
        );

        let work = dir.path().join("work");
        let container = ArchiveContainer::extract(&input, &work).unwrap();
        assert_eq!(
            container.method_of("assets/raw.bin"),
            Some(CompressionMethod::Stored)
        );

        let output = dir.path().join("out.apk");
        container.repack(&output, &HashMap::new()).unwrap();

        let mut archive = ZipArchive::new(File::open(&output).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["assets/raw.bin", "classes.dex"]);
        assert_eq!(
            archive.by_name("assets/raw.bin").unwrap().compression(),
            CompressionMethod::Stored
        );
        assert_eq!(
            archive.by_name("classes.dex").unwrap().compression(),
            CompressionMethod::Deflated
        );
        assert_eq!(read_zip_entry(&output, "classes.dex").unwrap(), b"dex bytes");
    }

    #[test]
    fn should_reject_case_colliding_entries() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        build_archive(
            &input,
            &[
                ("Foo.txt", CompressionMethod::Stored, b"a"),
                ("foo.txt", CompressionMethod::Stored, b"b"),
            ],
        );

        let err = ArchiveContainer::extract(&input, &dir.path().join("work")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Foo.txt") && message.contains("foo.txt"));
    }

    #[test]
    fn should_count_only_files_against_the_entry_list() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        let mut writer = ZipWriter::new(File::create(&input).unwrap());
        // Explicit directory entries must not skew the on-disk count.
        writer.add_directory("assets/", FileOptions::default()).unwrap();
        writer
            .start_file("assets/raw.bin", FileOptions::default())
            .unwrap();
        writer.write_all(b"raw").unwrap();
        writer.finish().unwrap();

        let container = ArchiveContainer::extract(&input, &dir.path().join("work")).unwrap();
        assert_eq!(
            container.method_of("assets/raw.bin"),
            Some(CompressionMethod::Deflated)
        );
    }

    #[test]
    fn should_refuse_existing_work_dir() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        build_archive(&input, &[("a.txt", CompressionMethod::Stored, b"a")]);
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();

        let err = ArchiveContainer::extract(&input, &work).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn should_use_rename_map_for_unknown_entries() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        build_archive(
            &input,
            &[("assets/old-name.bin", CompressionMethod::Stored, b"raw")],
        );
        let work = dir.path().join("work");
        let container = ArchiveContainer::extract(&input, &work).unwrap();
        fs::rename(
            work.join("assets/old-name.bin"),
            work.join("assets/new-name.bin"),
        )
        .unwrap();

        let mut renames = HashMap::new();
        renames.insert("assets/new-name.bin".to_string(), "assets/old-name.bin".to_string());
        let output = dir.path().join("out.apk");
        container.repack(&output, &renames).unwrap();

        let mut archive = ZipArchive::new(File::open(&output).unwrap()).unwrap();
        assert_eq!(
            archive.by_name("assets/new-name.bin").unwrap().compression(),
            CompressionMethod::Stored
        );
    }

    #[test]
    fn should_round_trip_dex_jar_wrappers() {
        let dir = tempdir().unwrap();
        let dex = dir.path().join("classes2.dex");
        fs::write(&dex, b"secondary dex").unwrap();
        let jar = dir.path().join("classes2.dex.jar");
        write_dex_jar(&dex, &jar).unwrap();

        let out = dir.path().join("unwrapped.dex");
        extract_dex_jar(&fs::read(&jar).unwrap(), &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"secondary dex");
    }
}
