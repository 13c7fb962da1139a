use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use zmf::{MediaFile, MediaOptions, MetadataEntry, SectionInfo, DEFAULT_SECTOR_SIZE};

#[derive(Parser)]
#[command(name = "zmf", version, about = "Inspect and edit ZMF2 media containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header fields, metadata and the section list
    Info {
        input: PathBuf,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Copy a file into a new section
    AddSection {
        file:  PathBuf,
        name:  String,
        input: PathBuf,
    },
    /// Write a section's bytes to stdout
    DumpSection {
        file: PathBuf,
        name: String,
        /// Hex dump instead of raw bytes
        #[arg(long)]
        hex: bool,
    },
    /// Print one metadata entry
    Get {
        file: PathBuf,
        key:  String,
    },
    /// Set one metadata entry (the file must exist)
    Set {
        file:  PathBuf,
        key:   String,
        value: String,
    },
    /// Create the container if needed and stamp authoring metadata
    Touch {
        file: PathBuf,
        /// Sector size for a new container (power of two, 256 and up;
        /// default 1024)
        #[arg(long)]
        sector_size: Option<u32>,
    },
    /// Tombstone a section
    RemoveSection {
        file: PathBuf,
        name: String,
    },
    /// Rewrite into a new file without dead records and unreachable spans
    Compact {
        input:  PathBuf,
        output: PathBuf,
    },
}

#[derive(Serialize)]
struct ContainerInfo {
    path:           String,
    bitstream_type: String,
    sector_size:    u32,
    file_size:      u64,
    sectors:        u64,
    metadata:       Vec<MetadataEntry>,
    sections:       Vec<SectionInfo>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match Cli::parse().command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let mut mf = MediaFile::open(&input, true, false)?;
            let sector_size = mf.sector_size();
            let file_size   = mf.file_size()?;
            let info = ContainerInfo {
                path:           input.display().to_string(),
                bitstream_type: mf.bitstream_type(),
                sector_size,
                file_size,
                sectors:        (file_size + sector_size as u64 - 1) / sector_size as u64,
                metadata:       mf.metadata()?,
                sections:       mf.sections()?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }

            println!("── Media file ───────────────────────────────────────────");
            println!("  Path           {}", info.path);
            println!("  Bitstream      {}", info.bitstream_type);
            println!("  Sector size    {} B", info.sector_size);
            println!("  File size      {} B ({} sectors)", info.file_size, info.sectors);
            println!("── Metadata ({}) ─────────────────────────────────────────", info.metadata.len());
            for entry in &info.metadata {
                println!("  {}={}", entry.key, entry.value);
            }
            println!("── Sections ({}) ─────────────────────────────────────────", info.sections.len());
            println!("  {:<32} {:>12} {:>12}  Description", "Name", "Length", "Compression");
            for s in &info.sections {
                println!("  {:<32} {:>12} {:>12}  {}",
                    s.name, s.data_length, s.compression_tag(), s.desc);
            }
        }

        // ── AddSection ───────────────────────────────────────────────────────
        Commands::AddSection { file, name, input } => {
            let mut mf = MediaFile::open(&file, false, true)?;
            if mf.open_section(&name)?.is_some() {
                return Err(format!("section '{name}' already exists in {}", file.display()).into());
            }
            let mut src = std::fs::File::open(&input)
                .map_err(|e| format!("failed to open '{}': {e}", input.display()))?;
            let mut section = mf.create_section(&name)?;
            let n = io::copy(&mut src, &mut section)?;
            section.flush()?;
            drop(section);
            mf.close()?;
            println!("  added  {name} ({n} bytes)");
        }

        // ── DumpSection ──────────────────────────────────────────────────────
        Commands::DumpSection { file, name, hex } => {
            let mut mf = MediaFile::open(&file, true, false)?;
            let Some(mut section) = mf.open_section(&name)? else {
                return Err(format!("section '{name}' does not exist").into());
            };
            let stdout = io::stdout();
            let mut out = stdout.lock();
            if hex {
                let mut data = Vec::new();
                section.read_to_end(&mut data)?;
                for (i, row) in data.chunks(16).enumerate() {
                    writeln!(out, "{:08x}  {}", i * 16, hex::encode(row))?;
                }
            } else {
                io::copy(&mut section, &mut out)?;
            }
            out.flush()?;
        }

        // ── Get ──────────────────────────────────────────────────────────────
        Commands::Get { file, key } => {
            let mut mf = MediaFile::open(&file, true, false)?;
            match mf.get_metadata(&key)? {
                Some(value) => println!("{key}={value}"),
                None        => eprintln!("zmf: '{key}' not set"),
            }
        }

        // ── Set ──────────────────────────────────────────────────────────────
        Commands::Set { file, key, value } => {
            let mut mf = MediaFile::open(&file, false, false)?;
            mf.set_metadata(&key, &value)?;
            mf.close()?;
        }

        // ── Touch ────────────────────────────────────────────────────────────
        Commands::Touch { file, sector_size } => {
            let opts = MediaOptions {
                sector_size: sector_size.unwrap_or(DEFAULT_SECTOR_SIZE),
                ..MediaOptions::default()
            };
            let mut mf = MediaFile::open_with(&file, opts)?;
            if let Some(size) = sector_size.filter(|&s| s != mf.sector_size()) {
                mf.set_sector_size(size)?;
            }
            let original_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            mf.set_metadata("media.original_name", &original_name)?;
            mf.set_metadata("media.authored_using", &authored_using())?;
            mf.close()?;
        }

        // ── RemoveSection ────────────────────────────────────────────────────
        Commands::RemoveSection { file, name } => {
            let mut mf = MediaFile::open(&file, false, false)?;
            if !mf.remove_section(&name)? {
                return Err(format!("section '{name}' does not exist").into());
            }
            mf.close()?;
        }

        // ── Compact ──────────────────────────────────────────────────────────
        Commands::Compact { input, output } => {
            let mut mf = MediaFile::open(&input, true, false)?;
            let stats = mf.compact_to(&output)?;
            println!("Compacted {} → {}", input.display(), output.display());
            println!("  sections  {} copied, {} shadowed", stats.sections, stats.shadowed);
            println!("  metadata  {} entries", stats.metadata_entries);
            println!("  size      {} B → {} B", stats.size_before, stats.size_after);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn authored_using() -> String {
    format!(
        "name={},version={},vendor={}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_AUTHORS"),
    )
}
