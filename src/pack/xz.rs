//! Size-aware xz compression with an external-binary fast path.
//!
//! A multi-threaded `xz` binary is preferred when one is reachable (explicit
//! override or search path); otherwise the in-process single-threaded codec
//! takes over with a one-time performance warning. Both paths emit the same
//! stream format and are freely interchangeable.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::process::{Command, Stdio};
use xz2::read::XzDecoder;
use xz2::stream::{Check, Stream};
use xz2::write::XzEncoder;

use crate::core::config::RunContext;

/// liblzma's extreme-preset flag, OR'd into a 0-9 compression level. Maps to
/// the `e` suffix (`-9e`) of the external binary.
pub const PRESET_EXTREME: u32 = 1 << 31;

/// Integrity check embedded in the produced stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum XzCheck {
    NoCheck,
    Crc32,
    #[default]
    Crc64,
    Sha256,
}

impl XzCheck {
    fn as_flag(self) -> &'static str {
        match self {
            Self::NoCheck => "--check=none",
            Self::Crc32 => "--check=crc32",
            Self::Crc64 => "--check=crc64",
            Self::Sha256 => "--check=sha256",
        }
    }

    fn as_stream_check(self) -> Check {
        match self {
            Self::NoCheck => Check::None,
            Self::Crc32 => Check::Crc32,
            Self::Crc64 => Check::Crc64,
            Self::Sha256 => Check::Sha256,
        }
    }
}

pub fn decompress(src: &Path, dst: &Path, ctx: &mut RunContext) -> Result<()> {
    let args = ["--decompress", "--keep", "--stdout", "-T0"];
    if run_external(src, dst, &args, ctx)? {
        return Ok(());
    }
    let input = File::open(src).with_context(|| format!("Opening `{}`", src.display()))?;
    let mut decoder = XzDecoder::new(input);
    let mut output = File::create(dst).with_context(|| format!("Creating `{}`", dst.display()))?;
    io::copy(&mut decoder, &mut output)
        .with_context(|| format!("Decompressing `{}`", src.display()))?;
    Ok(())
}

pub fn compress(
    src: &Path,
    dst: &Path,
    level: u32,
    threads: u32,
    check: XzCheck,
    ctx: &mut RunContext,
) -> Result<()> {
    let preset = level & !PRESET_EXTREME;
    let level_flag = if level & PRESET_EXTREME != 0 {
        format!("-{preset}e")
    } else {
        format!("-{preset}")
    };
    let threads_flag = format!("-T{threads}");
    let args = [
        "--compress",
        "--keep",
        "--stdout",
        threads_flag.as_str(),
        level_flag.as_str(),
        check.as_flag(),
    ];
    if run_external(src, dst, &args, ctx)? {
        return Ok(());
    }
    let mut input = File::open(src).with_context(|| format!("Opening `{}`", src.display()))?;
    let output = File::create(dst).with_context(|| format!("Creating `{}`", dst.display()))?;
    let stream = Stream::new_easy_encoder(level, check.as_stream_check())
        .context("Initializing xz encoder")?;
    let mut encoder = XzEncoder::new_stream(output, stream);
    io::copy(&mut input, &mut encoder)
        .with_context(|| format!("Compressing `{}`", src.display()))?;
    encoder.finish()?;
    Ok(())
}

/// Runs the external binary when one is reachable. Returns `Ok(false)` when
/// the caller should fall back to the in-process codec. An explicitly
/// configured binary that cannot be spawned is a hard error; only the PATH
/// probe degrades silently.
fn run_external(src: &Path, dst: &Path, args: &[&str], ctx: &mut RunContext) -> Result<bool> {
    let (program, explicit) = match &ctx.xz_binary {
        Some(path) => (path.clone(), true),
        None => ("xz".into(), false),
    };
    let output = File::create(dst).with_context(|| format!("Creating `{}`", dst.display()))?;
    let spawned = Command::new(&program)
        .args(args)
        .arg(src)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output))
        .status();
    let status = match spawned {
        Ok(status) => status,
        Err(err) if err.kind() == ErrorKind::NotFound && !explicit => {
            ctx.note_slow_xz();
            return Ok(false);
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Spawning xz binary `{}`", program.display()));
        }
    };
    if !status.success() {
        bail!(
            "`{}` failed with {} while processing `{}`",
            program.display(),
            status,
            src.display()
        );
    }
    Ok(true)
}
