//! In-place normalization of zip timestamps for deterministic output.
//!
//! Rewrites only the 2-byte DOS time and date fields in every local file
//! header and its matching central-directory entry; no entry payload is
//! decompressed or re-deflated. Single-disk, 32-bit-offset archives only;
//! anything larger is rejected rather than silently truncated.

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_DIR_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;

/// Fixed size of the end-of-central-directory record, excluding the comment.
const EOCD_SIZE: u64 = 22;
/// Fixed size of one central-directory file header, excluding the
/// variable-length name/extra/comment that follow it.
const CENTRAL_HEADER_SIZE: u64 = 46;

/// Patches every entry of the archive at `path` to the given DOS date/time.
pub fn normalize_timestamps(path: &Path, dos_time: u16, dos_date: u16) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Opening `{}`", path.display()))?;

    let file_length = file.seek(SeekFrom::End(0))?;
    ensure!(
        file_length <= u32::MAX as u64,
        "`{}` is larger than 4 GiB; 64-bit archives are not supported",
        path.display()
    );

    let eocd_start = find_eocd_start(&mut file)
        .with_context(|| format!("Locating end of central directory in `{}`", path.display()))?;

    file.seek(SeekFrom::Start(eocd_start + 4))?;
    let disk_number = file.read_u16::<LittleEndian>()?;
    let cd_start_disk = file.read_u16::<LittleEndian>()?;
    let _entries_on_disk = file.read_u16::<LittleEndian>()?;
    let total_entries = file.read_u16::<LittleEndian>()?;
    let _cd_size = file.read_u32::<LittleEndian>()?;
    let cd_offset = file.read_u32::<LittleEndian>()?;

    ensure!(
        disk_number == 0 && cd_start_disk == 0,
        "`{}` spans multiple disks; unsupported",
        path.display()
    );
    ensure!(
        total_entries != u16::MAX && cd_offset != u32::MAX,
        "`{}` uses zip64 markers; unsupported",
        path.display()
    );

    let mut pos = cd_offset as u64;
    for index in 0..total_entries {
        file.seek(SeekFrom::Start(pos))?;
        let signature = file.read_u32::<LittleEndian>()?;
        if signature != CENTRAL_DIR_SIGNATURE {
            bail!(
                "Bad central directory signature {signature:#010x} for entry {index} at offset {pos:#x}"
            );
        }

        file.seek(SeekFrom::Start(pos + 28))?;
        let name_len = file.read_u16::<LittleEndian>()? as u64;
        let extra_len = file.read_u16::<LittleEndian>()? as u64;
        let comment_len = file.read_u16::<LittleEndian>()? as u64;
        file.seek(SeekFrom::Start(pos + 42))?;
        let local_header_offset = file.read_u32::<LittleEndian>()? as u64;

        file.seek(SeekFrom::Start(local_header_offset))?;
        let local_signature = file.read_u32::<LittleEndian>()?;
        if local_signature != LOCAL_HEADER_SIGNATURE {
            bail!(
                "Central entry {index} points at offset {local_header_offset:#x} which is not a local header (signature {local_signature:#010x})"
            );
        }

        // Local header: time at +10, date at +12.
        file.seek(SeekFrom::Start(local_header_offset + 10))?;
        file.write_u16::<LittleEndian>(dos_time)?;
        file.write_u16::<LittleEndian>(dos_date)?;

        // Central header: time at +12, date at +14.
        file.seek(SeekFrom::Start(pos + 12))?;
        file.write_u16::<LittleEndian>(dos_time)?;
        file.write_u16::<LittleEndian>(dos_date)?;

        pos += CENTRAL_HEADER_SIZE + name_len + extra_len + comment_len;
    }

    // The walk must consume the central directory exactly; anything else
    // means the entry count or the recorded sizes lie about the layout.
    ensure!(
        pos == eocd_start,
        "Central directory walk ended at offset {pos:#x}, expected {eocd_start:#x}; `{}` is malformed",
        path.display()
    );

    file.flush()?;
    Ok(())
}

/// Scans backward from the end of the file for the end-of-central-directory
/// signature, bounded by the maximum comment length.
fn find_eocd_start<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    let file_length = reader.seek(SeekFrom::End(0))?;
    ensure!(file_length >= EOCD_SIZE, "File too short to be a zip archive");
    let search_lower_bound = file_length.saturating_sub(EOCD_SIZE + u16::MAX as u64);
    let mut pos = file_length - EOCD_SIZE;
    loop {
        reader.seek(SeekFrom::Start(pos))?;
        if reader.read_u32::<LittleEndian>()? == END_OF_CENTRAL_DIR_SIGNATURE {
            return Ok(pos);
        }
        if pos == search_lower_bound {
            break;
        }
        pos -= 1;
    }
    bail!("No end-of-central-directory record found");
}
