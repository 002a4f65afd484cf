use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use httptap::capture::{FileSource, FrameSource, LiveSource};
use httptap::config::Config;
use httptap::engine::Engine;
use httptap::report::{JsonSink, LogSink};

#[derive(Parser)]
#[command(name = "httptap")]
#[command(author, version, about = "passive HTTP traffic monitor")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interface to capture on
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Read frames from a pcap file instead of a live interface
    #[arg(long, conflicts_with = "interface")]
    pub file: Option<String>,

    /// BPF filter selecting the traffic to inspect
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Bytes captured per frame
    #[arg(long)]
    pub snaplen: Option<i32>,

    /// Emit one JSON object per HTTP message on stdout
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).context("loading configuration")?,
        None => Config::default(),
    };

    // CLI flags win over the file.
    if cli.interface.is_some() {
        config.capture.interface = cli.interface;
    }
    if cli.file.is_some() {
        config.capture.file = cli.file;
    }
    if let Some(filter) = cli.filter {
        config.capture.filter = filter;
    }
    if let Some(snaplen) = cli.snaplen {
        config.capture.snaplen = snaplen;
    }
    if cli.json {
        config.report.json = true;
    }

    let source: Box<dyn FrameSource> = match &config.capture.file {
        Some(path) => Box::new(
            FileSource::open(path, &config.capture.filter).context("opening capture file")?,
        ),
        None => Box::new(
            LiveSource::open(
                config.capture.interface.as_deref(),
                &config.capture.filter,
                config.capture.snaplen,
                config.capture.promiscuous,
            )
            .context("opening capture device")?,
        ),
    };

    let json = config.report.json;
    let engine = Engine::new(config);
    if json {
        engine.run(source, JsonSink).await?;
    } else {
        engine.run(source, LogSink).await?;
    }
    Ok(())
}
