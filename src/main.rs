use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use apkrepack::core::config::{FIXED_DOS_DATE, FIXED_DOS_TIME};
use apkrepack::pack::zip_patch;
use apkrepack::{RepackOptions, UnpackOrchestrator, UnpackSession};

#[derive(Parser)]
#[command(
    name = "apkrepack",
    version,
    about = "Repackages application archives around an external dex optimizer"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract an archive and relocate all of its dex files into a single
    /// directory for the optimizer.
    Unpack {
        /// Input application archive.
        input: PathBuf,
        /// Extraction working directory; must not already exist.
        #[arg(long)]
        work_dir: PathBuf,
        /// Directory the dex files are relocated into; must not already
        /// exist.
        #[arg(long)]
        dex_dir: PathBuf,
        /// Path to an external xz binary; by default `xz` is probed on the
        /// search path with an in-process fallback.
        #[arg(long)]
        xz: Option<PathBuf>,
        /// Force the split/flat decision instead of probing the archive.
        #[arg(long)]
        split: Option<bool>,
    },
    /// Reassemble the archive from a working directory produced by `unpack`,
    /// after the optimizer rewrote the dex files in place.
    Repack {
        /// Working directory of the earlier `unpack`.
        work_dir: PathBuf,
        /// Output archive path.
        output: PathBuf,
        /// Compress xzs blobs at level 0 instead of maximal.
        #[arg(long)]
        fast: bool,
        /// Rewrite every output timestamp to the fixed epoch.
        #[arg(long)]
        reset_timestamps: bool,
        /// Record the locators directive in the produced metadata.
        #[arg(long)]
        locators: bool,
        #[arg(long, default_value_t = 0)]
        locator_store_id: u32,
        /// Path to an external xz binary.
        #[arg(long)]
        xz: Option<PathBuf>,
    },
    /// Rewrite every zip entry timestamp in place to the fixed epoch.
    Normalize {
        /// Archive to patch.
        archive: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Commands::Unpack {
            input,
            work_dir,
            dex_dir,
            xz,
            split,
        } => {
            let session = UnpackOrchestrator::new(input, work_dir, dex_dir)
                .split_override(split)
                .xz_binary(xz)
                .unpack()?;
            log::info!(
                "Dex files ready under `{}` ({})",
                session.dex_dir().display(),
                session.mode_name()
            );
            session.save()?;
            Ok(())
        }
        Commands::Repack {
            work_dir,
            output,
            fast,
            reset_timestamps,
            locators,
            locator_store_id,
            xz,
        } => {
            let session = UnpackSession::load(&work_dir, xz)?;
            let opts = RepackOptions {
                have_locators: locators,
                locator_store_id,
                fast,
                reset_timestamps,
            };
            session.repackage(&output, &opts)?;
            log::info!("Wrote `{}`", output.display());
            Ok(())
        }
        Commands::Normalize { archive } => {
            zip_patch::normalize_timestamps(&archive, FIXED_DOS_TIME, FIXED_DOS_DATE)?;
            log::info!("Normalized timestamps in `{}`", archive.display());
            Ok(())
        }
    }
}
