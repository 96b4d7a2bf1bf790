//! The `mkfs.myfs` tool: packs a set of host files into a fresh container
//! image. Diagnostics go to standard output; the exit code is `0` on
//! success, `-1` when validation refuses the inputs and the negated errno
//! when the host I/O fails.

use myfs::builder;
use myfs::builder::BuildReport;
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;

/// Command line of one invocation.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The container file, then every file to pack.
    paths: Vec<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            _ => res.paths.push(PathBuf::from(arg)),
        }
    }
    res
}

fn print_usage() {
    println!("Usage:");
    println!(" mkfs.myfs <container> <file1> [<file2> ...]");
    println!();
    println!(" container:\tthe container image to create; anything other than");
    println!("           \t`container.bin` is replaced by a fresh `container.bin`");
    println!("           \tin the working directory");
    println!(" fileN:\t\tup to 64 host files to pack, unique by base name");
}

fn print_report(report: &BuildReport) {
    println!();
    println!("SuperBlock:");
    println!("FileSystemSize: {}", report.superblock.fs_size);
    println!("DMapBlockStart: {}", report.superblock.dmap_start);
    println!("FatBlockStart: {}", report.superblock.fat_start);
    println!("RootBlockStart: {}", report.superblock.root_start);
    println!("FileCount: {}", report.superblock.file_count);
    println!();
    for (i, file) in report.files.iter().enumerate() {
        println!("File {i}: {}", file.name);
        println!("Size: {} byte(s) in {} block(s)", file.size, file.blocks);
        if file.blocks > 0 {
            println!(
                "DataBlocks: {}..{}",
                file.first_block,
                file.first_block + file.blocks as i32 - 1
            );
        } else {
            println!("DataBlocks: none");
        }
    }
    println!();
    println!("{} written.", report.container.display());
}

fn main() {
    let mut args = std::env::args_os();
    args.next();
    let args = parse_args(args);
    if args.help {
        print_usage();
        exit(0);
    }
    let Some((container, files)) = args.paths.split_first() else {
        println!("mkfs.myfs: error: no container file has been provided");
        print_usage();
        exit(-1);
    };
    if files.is_empty() {
        println!("mkfs.myfs: error: no input file has been provided");
        print_usage();
        exit(-1);
    }

    match builder::build(container, files) {
        Ok(report) => print_report(&report),
        Err(e) => {
            println!("mkfs.myfs: error: {e}");
            exit(e.exit_code());
        }
    }
}
