//! Offline dissector for captured chip and application traffic.

mod capture;
mod dissect;
mod output;

use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use bgbridge::bglib::Framing;
use bgbridge::keys::{KeyProvider, KeyStore};
use bgbridge::types::MacAddr;
use clap::Parser;

use dissect::Dissector;
use output::OutputConfig;

/// Decode a text capture of bridge serial traffic
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture file, one `[timestamp] chip|app <hex>` chunk per line (`-` for stdin)
    input: PathBuf,

    /// Show raw hex data for each frame
    #[arg(short = 'x', long)]
    hex: bool,

    /// Framing of the chip side
    #[arg(long, default_value = "unbracketed")]
    chip_framing: Framing,

    /// Framing of the application side
    #[arg(long, default_value = "unbracketed")]
    app_framing: Framing,

    /// Bind key file for encrypted MiBeacon payloads
    #[arg(short = 'k', long)]
    keys: Option<PathBuf>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("bgbridge=debug".parse()?),
            )
            .init();
    }

    let store;
    let empty = HashMap::<MacAddr, Vec<u8>>::new();
    let keys: &dyn KeyProvider = match &args.keys {
        Some(path) => {
            store = KeyStore::load(path)
                .with_context(|| format!("Failed to load keys: {:?}", path))?;
            tracing::debug!(keys = store.len(), "Loaded bind keys");
            &store
        }
        None => &empty,
    };

    let chunks = capture::read_capture(&args.input)?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file: {:?}", path))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };

    let config = OutputConfig {
        show_raw_hex: args.hex,
        use_color: !args.no_color && args.output.is_none() && std::io::stdout().is_terminal(),
    };

    let mut dissector = Dissector::new(args.chip_framing, args.app_framing, keys);
    let mut frames = 0usize;
    for chunk in &chunks {
        for item in dissector.feed(chunk) {
            writeln!(out, "{}", output::format_dissected(&item, &config))?;
            frames += 1;
        }
    }
    tracing::debug!(chunks = chunks.len(), frames, "Done");

    Ok(())
}
