//! The `metadata.txt` sidecar recording ordered secondary-dex entries for
//! one storage unit (the top-level archive or one feature module).
//!
//! The format is line oriented: dot-directives first, then one
//! `<file> <sha1> <canary>` entry per secondary dex, in dex-index order.
//! Reader and writer are exact inverses.

use anyhow::{bail, Context, Result};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// One secondary dex: file name, SHA-1 of its contents, canary descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexMetadataEntry {
    pub file_name: String,
    pub sha1: String,
    pub canary: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DexMetadata {
    pub store_id: Option<String>,
    pub dependencies: Vec<String>,
    pub has_locators: bool,
    pub is_root_relative: bool,
    pub locator_store_id: u32,
    pub superpack_file_count: u32,
    pub entries: Vec<DexMetadataEntry>,
}

impl DexMetadata {
    pub fn new(
        store_id: Option<String>,
        dependencies: Vec<String>,
        is_root_relative: bool,
    ) -> Self {
        Self {
            store_id,
            dependencies,
            is_root_relative,
            ..Self::default()
        }
    }

    pub fn parse(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading `{}`", path.display()))?;
        Self::parse_str(&content).with_context(|| format!("Parsing `{}`", path.display()))
    }

    pub fn parse_str(content: &str) -> Result<Self> {
        let mut meta = Self::default();
        for (lineno, line) in content.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let Some(first) = fields.next() else {
                continue;
            };
            match first {
                ".id" => {
                    meta.store_id = Some(
                        fields
                            .next()
                            .with_context(|| format!("`.id` missing value on line {}", lineno + 1))?
                            .to_string(),
                    );
                }
                ".requires" => {
                    meta.dependencies.push(
                        fields
                            .next()
                            .with_context(|| {
                                format!("`.requires` missing value on line {}", lineno + 1)
                            })?
                            .to_string(),
                    );
                }
                ".locators" => meta.has_locators = true,
                ".root_relative" => meta.is_root_relative = true,
                ".locator_id" => {
                    let value = fields.next().with_context(|| {
                        format!("`.locator_id` missing value on line {}", lineno + 1)
                    })?;
                    meta.locator_store_id = value
                        .parse()
                        .with_context(|| format!("Invalid `.locator_id` value `{value}`"))?;
                }
                ".superpack_files" => {
                    let value = fields.next().with_context(|| {
                        format!("`.superpack_files` missing value on line {}", lineno + 1)
                    })?;
                    meta.superpack_file_count = value
                        .parse()
                        .with_context(|| format!("Invalid `.superpack_files` value `{value}`"))?;
                }
                directive if directive.starts_with('.') => {
                    bail!("Unknown directive `{directive}` on line {}", lineno + 1);
                }
                file_name => {
                    let (Some(sha1), Some(canary)) = (fields.next(), fields.next()) else {
                        bail!("Malformed dex entry on line {}: `{line}`", lineno + 1);
                    };
                    meta.entries.push(DexMetadataEntry {
                        file_name: file_name.to_string(),
                        sha1: sha1.to_string(),
                        canary: canary.to_string(),
                    });
                }
            }
        }
        Ok(meta)
    }

    /// Appends an entry for `dex`, hashing its contents.
    pub fn add_dex(&mut self, dex: &Path, file_name: String, canary: String) -> Result<()> {
        let sha1 = sha1_of_file(dex)?;
        self.entries.push(DexMetadataEntry {
            file_name,
            sha1,
            canary,
        });
        Ok(())
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.store_id {
            out.push_str(&format!(".id {id}\n"));
        }
        for dep in &self.dependencies {
            out.push_str(&format!(".requires {dep}\n"));
        }
        if self.is_root_relative {
            out.push_str(".root_relative\n");
        }
        if self.has_locators {
            out.push_str(".locators\n");
        }
        if self.locator_store_id > 0 {
            out.push_str(&format!(".locator_id {}\n", self.locator_store_id));
        }
        if self.superpack_file_count > 0 {
            out.push_str(&format!(".superpack_files {}\n", self.superpack_file_count));
        }
        for entry in &self.entries {
            out.push_str(&format!(
                "{} {} {}\n",
                entry.file_name, entry.sha1, entry.canary
            ));
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.serialize())
            .with_context(|| format!("Writing `{}`", path.display()))
    }
}

/// Lowercase hex SHA-1 of a file's contents, streamed in 64 KiB chunks.
pub fn sha1_of_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Opening `{}`", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Hashing `{}`", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
