//! Shared driver for the `vpartclone`, `vpartimage`, and `vntfsclone`
//! binaries. The three differ only in the format their error messages
//! assume when the magic bytes match nothing.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches, Parser};
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;
use crate::fuse;
use crate::image::Image;
use crate::probe::{self, Format};
use crate::source::ByteSource;

#[derive(Parser, Debug)]
pub struct Args {
    /// image to read
    pub image: PathBuf,

    /// mount point for virtual partition; an empty directory
    #[arg(short, long, value_parser = empty_directory)]
    pub mountpoint: Option<PathBuf>,

    /// dump header and bitmap info
    #[arg(short, long)]
    pub verbose: bool,

    /// verify all checksums in image (slow!)
    #[arg(short, long = "crc_check")]
    pub crc_check: bool,

    /// enable FUSE filesystem debug messages
    #[arg(short, long = "debug_fuse")]
    pub debug_fuse: bool,

    /// suppress progress bar when indexing or checking
    #[arg(short, long)]
    pub quiet: bool,

    /// bitmap-index stride in bits; leave unchanged unless memory usage
    /// is too high, then double or quadruple repeatedly
    #[arg(short, long = "index_size",
          default_value_t = crate::index::DEFAULT_INDEX_STRIDE,
          value_parser = index_size)]
    pub index_size: u32,
}

fn empty_directory(arg: &str) -> std::result::Result<PathBuf, String> {
    let path = PathBuf::from(arg);
    let is_empty = path.is_dir()
        && fs::read_dir(&path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
    if is_empty {
        Ok(path)
    } else {
        Err(format!("'{arg}' is not an empty directory"))
    }
}

fn index_size(arg: &str) -> std::result::Result<u32, String> {
    let value: u32 = arg
        .parse()
        .map_err(|_| format!("'{arg}' is not an integer"))?;
    if value < 1000 {
        Err(format!("'{arg}' is too small, should be >= 1000"))
    } else if value % 8 != 0 {
        Err(format!("'{arg}' is not a multiple of 8"))
    } else {
        Ok(value)
    }
}

/// Entry point shared by the three binaries; returns the process exit
/// code.
pub fn run(format: Format) -> i32 {
    let prog = format!("v{}", format.tool());
    let about = format!(
        "Mount {} image backup as virtual partition.",
        format.tool()
    );
    let matches = Args::command().name(prog).about(about).get_matches();
    let args = Args::from_arg_matches(&matches).expect("clap parsed the args");

    let mut logger = env_logger::Builder::from_default_env();
    if args.debug_fuse {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    match run_with(format, &args) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {e}");
            1
        }
    }
}

fn run_with(format: Format, args: &Args) -> Result<()> {
    // Mounting needs random access; everything else reads the image
    // front to back and works from a pipe or a compressed stream.
    let sequential = args.mountpoint.is_none();
    let source = ByteSource::open(&args.image, sequential)?;
    let mut image = probe::open_image(source, format, args.index_size)?;

    if args.verbose {
        println!("{image}");
        println!();
    }

    if let Some(mountpoint) = &args.mountpoint {
        build_index_with_spinner(&mut image, args.quiet)?;
        if let Err(e) = fuse::run_fuse(image, mountpoint, args.debug_fuse) {
            eprintln!();
            eprintln!("FUSE file system errored out with: \"{e}\".");
            std::process::exit(1);
        }
    } else if args.crc_check {
        // The probe may have dispatched to a different decoder than the
        // binary's namesake; the message follows the image.
        if image.tool() == "ntfsclone" {
            println!("Reading entire image '{}'...", args.image.display());
        } else {
            println!(
                "Verifying all checksums of image '{}'...",
                args.image.display()
            );
        }
        let bar = if args.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(image.used_blocks()).with_style(
                ProgressStyle::with_template(
                    "{wide_bar} {human_pos}/{human_len} used blocks ({eta})",
                )
                .expect("static progress template"),
            )
        };
        image.read_blocks(true, Some(&mut |_, _| bar.inc(1)))?;
        bar.finish_and_clear();
    }
    Ok(())
}

fn build_index_with_spinner(image: &mut Image, quiet: bool) -> Result<()> {
    // Only the ntfsclone index build is slow (it scans the whole image),
    // but a short-lived spinner is harmless for the bitmap formats.
    let spinner = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new_spinner().with_message("Indexing image...");
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    };
    let result = image.build_block_index();
    spinner.finish_and_clear();
    result
}
