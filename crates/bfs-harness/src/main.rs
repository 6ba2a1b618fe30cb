#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bfs_harness::{ImageConfig, boot_fixture_with};
use bfs_types::ByteOrder;
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("generate") => generate(&args[1..]),
        Some("config") => {
            let config = parse_config(&args[1..])?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_usage() {
    println!("bfs-harness\n");
    println!("USAGE:");
    println!("  bfs-harness generate <image> [--big-endian] [--legacy] [--config <json>]");
    println!("  bfs-harness config [--big-endian] [--legacy] [--config <json>]");
}

/// Build the boot fixture geometry from flags; `--config` loads a full
/// `ImageConfig` first and later flags override it.
fn parse_config(args: &[String]) -> Result<ImageConfig> {
    let mut config = ImageConfig {
        name: "BootFixture".to_owned(),
        ..ImageConfig::default()
    };
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--big-endian" => config.byte_order = ByteOrder::Big,
            "--legacy" => config.legacy_superblock = true,
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {path}"))?;
                config = serde_json::from_str(&text)
                    .with_context(|| format!("invalid image config in {path}"))?;
            }
            other => bail!("unknown flag: {other}"),
        }
    }
    Ok(config)
}

fn generate(args: &[String]) -> Result<()> {
    let Some(out) = args.first() else {
        bail!("usage: bfs-harness generate <image> [--big-endian] [--legacy] [--config <json>]");
    };
    let config = parse_config(&args[1..])?;
    let image = boot_fixture_with(config.clone())?;
    let out = Path::new(out);
    fs::write(out, &image).with_context(|| format!("failed to write {}", out.display()))?;
    eprintln!(
        "wrote {} ({} bytes, {}, block_size={})",
        out.display(),
        image.len(),
        config.byte_order,
        config.block_size
    );
    Ok(())
}
