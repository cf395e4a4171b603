//! File commands - cat, stat, ls, cp, mv, rm, mkdir, fetch

use crate::cli::args::{
    CatArgs, CopyArgs, FetchArgs, LsArgs, MkdirArgs, MoveArgs, OutputFormat, RmArgs, StatArgs,
};
use crate::error::{GfsError, GfsResult};
use crate::facade::Gfs;
use crate::fs::{DirEntry, FileKind, FileStat, OpenMode};
use console::style;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Execute the cat command
pub fn cat(args: CatArgs, gfs: &Gfs) -> GfsResult<()> {
    let mut file = gfs.open(&args.path, OpenMode::Read)?;
    if args.offset > 0 {
        file.seek(SeekFrom::Start(args.offset))
            .map_err(|e| GfsError::io(format!("seeking in {}", args.path), e))?;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let copied = match args.length {
        Some(len) => io::copy(&mut Read::by_ref(&mut file).take(len), &mut out),
        None => io::copy(&mut file, &mut out),
    }
    .map_err(|e| GfsError::io(format!("reading {}", args.path), e))?;
    out.flush()
        .map_err(|e| GfsError::io("flushing stdout", e))?;

    debug!("Wrote {} bytes of {}", copied, args.path);
    Ok(())
}

/// Execute the stat command
pub fn stat(args: StatArgs, gfs: &Gfs) -> GfsResult<()> {
    let stat = gfs.stat(&args.path)?;
    match args.format {
        OutputFormat::Table => print_stat_table(&stat),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stat)?),
        OutputFormat::Plain => println!(
            "{}\t{}\t{}",
            kind_label(stat.kind),
            display_size(stat.size),
            stat.url
        ),
    }
    Ok(())
}

fn print_stat_table(stat: &FileStat) {
    println!("{:<10} {}", "URL", stat.url);
    println!("{:<10} {}", "KIND", kind_label(stat.kind));
    println!("{:<10} {}", "SIZE", display_size(stat.size));
    let modified = stat
        .modified
        .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{:<10} {}", "MODIFIED", modified);
    println!("{:<10} {}", "TAG", stat.tag.as_deref().unwrap_or("-"));
}

/// Execute the ls command
pub fn ls(args: LsArgs, gfs: &Gfs) -> GfsResult<()> {
    let entries = gfs.list(&args.path)?;
    match args.format {
        OutputFormat::Table => print_entry_table(&entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                match entry.kind {
                    FileKind::Directory => println!("{}/", entry.name),
                    FileKind::File => println!("{}", entry.name),
                }
            }
        }
    }
    Ok(())
}

fn print_entry_table(entries: &[DirEntry]) {
    println!("{:<40} {:<10} {:>14}", "NAME", "KIND", "SIZE");
    println!("{}", "-".repeat(66));

    for entry in entries {
        let kind = match entry.kind {
            FileKind::Directory => style("directory").blue().to_string(),
            FileKind::File => "file".to_string(),
        };
        println!(
            "{:<40} {:<10} {:>14}",
            entry.name,
            kind,
            display_size(entry.size)
        );
    }

    println!();
    println!("Total: {} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
}

/// Execute the cp command
pub fn cp(args: CopyArgs, gfs: &Gfs) -> GfsResult<()> {
    gfs.copy(&args.src, &args.dst)
}

/// Execute the mv command
pub fn mv(args: MoveArgs, gfs: &Gfs) -> GfsResult<()> {
    gfs.replace(&args.src, &args.dst)
}

/// Execute the rm command
pub fn rm(args: RmArgs, gfs: &Gfs) -> GfsResult<()> {
    if args.recursive {
        return gfs.rmtree(&args.path, args.force);
    }
    if gfs.isdir(&args.path)? {
        return gfs.rmdir(&args.path);
    }
    gfs.remove(&args.path)
}

/// Execute the mkdir command
pub fn mkdir(args: MkdirArgs, gfs: &Gfs) -> GfsResult<()> {
    if args.parents {
        gfs.makedirs(&args.path, true)
    } else {
        gfs.mkdir(&args.path)
    }
}

/// Execute the fetch command
pub fn fetch(args: FetchArgs, gfs: &Gfs) -> GfsResult<()> {
    let local = gfs.as_local(&args.path)?;
    println!("{}", local.display());
    Ok(())
}

fn kind_label(kind: FileKind) -> &'static str {
    match kind {
        FileKind::File => "file",
        FileKind::Directory => "directory",
    }
}

fn display_size(size: Option<u64>) -> String {
    size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}
