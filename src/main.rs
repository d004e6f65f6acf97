//! Main entry point for the ntpidump CLI tool.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::Instant;

use clap::Parser;

use ntpidump::cli::Args;
use ntpidump::envelope;
use ntpidump::extract::{self, ExtractOptions};
use ntpidump::lzma2;
use ntpidump::progress::ProgressSink;

const SCRATCH_DIR: &str = ".temp";

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(&args.input));
    let scratch_dir = PathBuf::from(SCRATCH_DIR);

    // Fresh scratch directory for every run. On failure it is left in place
    // for diagnosis.
    if scratch_dir.exists() {
        std::fs::remove_dir_all(&scratch_dir)?;
    }
    std::fs::create_dir_all(&scratch_dir)?;

    eprintln!("Input archive: {}", args.input.display());
    eprintln!("Output directory: {}", output_dir.display());

    // --- Stage 1: envelope parsing ---
    let archive = std::fs::read(&args.input)?;
    let report = envelope::unpack(&archive, &scratch_dir)?;
    let (major, minor, patch) = report.version;
    eprintln!(
        "Archive version {}.{}.{}, {} region(s)",
        major,
        minor,
        patch,
        report.regions.len()
    );
    if report.used_default_keys {
        eprintln!(
            "Warning: unsupported archive version {}.{}.{}, using the default key set",
            major, minor, patch
        );
    }

    // --- Stage 2: block decoding ---
    let entries = extract::load_file_index(&scratch_dir)?;
    if !entries.is_empty() {
        eprintln!("Found {} partition(s):", entries.len());
        for entry in &entries {
            eprintln!("  {} ({})", entry.name, format_size(entry.partition_length));
        }
    }

    let sink = LineSink::default();
    let cancel = AtomicBool::new(false);
    let decoder = lzma2::default_decoder();
    let opts = ExtractOptions {
        scratch_dir: scratch_dir.clone(),
        output_dir,
        workers: args.workers,
    };
    let summary = extract::extract_archive(&opts, &decoder, &sink, &cancel)?;
    sink.finish();

    for (name, err) in &summary.failed {
        eprintln!("Failed: {}: {}", name, err);
    }
    eprintln!(
        "Extracted {}/{} file(s) in {:.2}s",
        summary.extracted.len(),
        summary.extracted.len() + summary.failed.len(),
        started.elapsed().as_secs_f64()
    );

    if !summary.failed.is_empty() {
        // Keep the scratch directory around for diagnosis.
        return Err(format!("{} file(s) failed to extract", summary.failed.len()).into());
    }

    if args.keep_temp {
        eprintln!(
            "Scratch directory kept at {}",
            std::fs::canonicalize(&scratch_dir)?.display()
        );
    } else {
        std::fs::remove_dir_all(&scratch_dir)?;
    }

    Ok(())
}

fn default_output_dir(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ntpi".to_string());
    let dir = format!("{}_extracted", stem);
    match input.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(dir),
        _ => PathBuf::from(dir),
    }
}

fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    match bytes {
        b if b >= GIB => format!("{:.1} GiB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MiB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KiB", b as f64 / KIB as f64),
        b => format!("{} B", b),
    }
}

/// Stderr progress line updated in place. Updates from concurrent file tasks
/// share the line; the last writer wins, which is fine for an advisory
/// display.
#[derive(Default)]
struct LineSink {
    last_len: Mutex<usize>,
}

impl ProgressSink for LineSink {
    fn update(&self, name: &str, bytes_expected: u64, bytes_done: u64) {
        let percent = if bytes_expected > 0 {
            bytes_done as f64 / bytes_expected as f64 * 100.0
        } else {
            100.0
        };
        let line = format!(
            "{}: {} / {} ({:.0}%)",
            name,
            format_size(bytes_done),
            format_size(bytes_expected),
            percent
        );

        let mut last = self.last_len.lock().unwrap();
        let mut padded = line.clone();
        if *last > padded.len() {
            padded.push_str(&" ".repeat(*last - padded.len()));
        }
        *last = line.len();
        eprint!("\r{}", padded);
        let _ = io::stderr().flush();
    }
}

impl LineSink {
    /// Terminate the in-place line once extraction is done.
    fn finish(&self) {
        if *self.last_len.lock().unwrap() > 0 {
            eprintln!();
        }
    }
}
