#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bfs::{FileType, Node, NodeAttr, OpenOptions, Volume, VolumeExt};
use serde::Serialize;
use std::env;
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

const CAT_CHUNK: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct InspectOutput {
    name: String,
    byte_order: String,
    block_size: u32,
    num_blocks: i64,
    used_blocks: i64,
    num_ags: i32,
    ag_shift: i32,
    superblock_offset: u64,
    clean: bool,
    root: String,
    indices: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListEntry {
    name: String,
    inode: u64,
    kind: FileType,
    size: u64,
}

/// Flags shared by every subcommand, plus its positional arguments.
#[derive(Debug, Default)]
struct CommandLine {
    positional: Vec<String>,
    json: bool,
    verbose: bool,
    no_follow: bool,
    options: OpenOptions,
}

impl CommandLine {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
        let mut cmd = Self::default();
        let mut args = args;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--json" => cmd.json = true,
                "--verbose" | "-v" => cmd.verbose = true,
                "--no-follow" => cmd.no_follow = true,
                "--no-legacy-probe" => cmd.options.probe_legacy_offset = false,
                "--cache-blocks" => {
                    let value = args.next().context("--cache-blocks requires a value")?;
                    cmd.options.cache_blocks = value
                        .parse()
                        .with_context(|| format!("invalid --cache-blocks value: {value}"))?;
                }
                "--max-symlinks" => {
                    let value = args.next().context("--max-symlinks requires a value")?;
                    cmd.options.max_symlink_depth = value
                        .parse()
                        .with_context(|| format!("invalid --max-symlinks value: {value}"))?;
                }
                flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
                _ => cmd.positional.push(arg),
            }
        }
        Ok(cmd)
    }

    fn image(&self, command: &str) -> Result<&str> {
        match self.positional.first() {
            Some(image) => Ok(image),
            None => bail!("{command} requires an image path"),
        }
    }

    fn path(&self, command: &str) -> Result<&str> {
        match self.positional.get(1) {
            Some(path) => Ok(path),
            None => bail!("{command} requires <image-path> <path>"),
        }
    }

    fn open(&self, command: &str) -> Result<Volume> {
        let image = self.image(command)?;
        Volume::open_with_options(Path::new(image), &self.options)
            .with_context(|| format!("failed to open BFS image: {image}"))
    }

    fn resolve<'v>(&self, volume: &'v Volume, path: &str) -> Result<Node<'v>> {
        let node = if self.no_follow {
            volume.resolve_path(path)
        } else {
            volume.resolve_path_follow(path)
        };
        node.with_context(|| format!("failed to resolve {path}"))
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    if matches!(command.as_str(), "--help" | "-h" | "help") {
        print_usage();
        return Ok(());
    }

    let cmd = CommandLine::parse(args)?;
    if cmd.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .init();
    }
    debug!(command = %command, args = ?cmd.positional, "cli_command");

    match command.as_str() {
        "inspect" => inspect(&cmd),
        "ls" => list(&cmd),
        "cat" => cat(&cmd),
        "readlink" => readlink(&cmd),
        "stat" => stat(&cmd),
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("bfs-cli\n");
    println!("USAGE:");
    println!("  bfs-cli inspect <image-path> [--json]");
    println!("  bfs-cli ls <image-path> <path> [--json]");
    println!("  bfs-cli cat <image-path> <path>");
    println!("  bfs-cli readlink <image-path> <path>");
    println!("  bfs-cli stat <image-path> <path> [--json]");
    println!();
    println!("OPTIONS:");
    println!("  --verbose, -v          log driver events to stderr (RUST_LOG overrides)");
    println!("  --no-follow            do not follow symlinks while resolving <path>");
    println!("  --no-legacy-probe      only look for the superblock at byte 512");
    println!("  --cache-blocks <n>     share an ARC cache of <n> blocks under all reads");
    println!("  --max-symlinks <n>     symlinks followed per lookup (default 40)");
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn inspect(cmd: &CommandLine) -> Result<()> {
    let volume = cmd.open("inspect")?;
    let sb = volume.superblock();
    let output = InspectOutput {
        name: sb.name.clone(),
        byte_order: sb.byte_order.to_string(),
        block_size: sb.block_size,
        num_blocks: sb.num_blocks,
        used_blocks: sb.used_blocks,
        num_ags: sb.num_ags,
        ag_shift: sb.ag_shift,
        superblock_offset: volume.superblock_offset(),
        clean: sb.is_clean(),
        root: sb.root_dir.to_string(),
        indices: (!sb.indices.is_zero()).then(|| sb.indices.to_string()),
    };

    if cmd.json {
        return print_json(&output);
    }
    println!("BFS Inspector");
    println!("name: {}", output.name);
    println!("byte_order: {}", output.byte_order);
    println!("block_size: {}", output.block_size);
    println!("num_blocks: {}", output.num_blocks);
    println!("used_blocks: {}", output.used_blocks);
    println!("allocation_groups: {} (ag_shift {})", output.num_ags, output.ag_shift);
    println!("superblock_offset: {}", output.superblock_offset);
    println!("clean: {}", output.clean);
    println!("root: {}", output.root);
    println!("indices: {}", output.indices.as_deref().unwrap_or("none"));
    Ok(())
}

fn list(cmd: &CommandLine) -> Result<()> {
    let volume = cmd.open("ls")?;
    let path = cmd.positional.get(1).map_or("/", String::as_str);
    let dir = cmd
        .resolve(&volume, path)?
        .into_directory()
        .with_context(|| format!("{path} is not a directory"))?;

    let mut entries = Vec::new();
    let mut cookie = dir.open()?;
    while let Some((name, id)) = cookie.get_next_entry()? {
        let node = Node::load(&volume, id)
            .with_context(|| format!("failed to load entry {name} (inode {})", id.0))?;
        entries.push(ListEntry {
            name,
            inode: id.0,
            kind: node.file_type(),
            size: node.size(),
        });
    }

    if cmd.json {
        return print_json(&entries);
    }
    for entry in &entries {
        println!(
            "{:>10} {:>12} {:<12} {}",
            entry.inode,
            entry.size,
            format!("{:?}", entry.kind),
            entry.name
        );
    }
    Ok(())
}

fn cat(cmd: &CommandLine) -> Result<()> {
    let volume = cmd.open("cat")?;
    let path = cmd.path("cat")?;
    let node = cmd.resolve(&volume, path)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0_u8; CAT_CHUNK];
    let mut pos = 0_u64;
    let size = node.size();
    while pos < size {
        let n = node
            .read_at(pos, &mut buf)
            .with_context(|| format!("failed to read {path} at {pos}"))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("write to stdout")?;
        pos += n as u64;
    }
    out.flush().context("flush stdout")?;
    Ok(())
}

fn readlink(cmd: &CommandLine) -> Result<()> {
    let volume = cmd.open("readlink")?;
    let path = cmd.path("readlink")?;
    let node = volume
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    let target = node
        .read_link()
        .with_context(|| format!("failed to read link {path}"))?;
    println!("{target}");
    Ok(())
}

fn stat(cmd: &CommandLine) -> Result<()> {
    let volume = cmd.open("stat")?;
    let path = cmd.path("stat")?;
    let node = cmd.resolve(&volume, path)?;
    let attr: NodeAttr = node.attr();

    if cmd.json {
        return print_json(&attr);
    }
    println!("path: {path}");
    println!("name: {}", node.name().unwrap_or_default());
    println!("inode: {}", attr.inode.0);
    println!("kind: {:?}", attr.kind);
    println!("mode: {:#o} (perm {:04o})", attr.mode, attr.perm);
    println!("size: {}", attr.size);
    println!("uid: {} gid: {}", attr.uid, attr.gid);
    println!("flags: {:#x}", attr.flags);
    println!("created: {}", unix_secs(attr.created));
    println!("modified: {}", unix_secs(attr.modified));
    Ok(())
}

fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_secs()).map_or(i64::MIN, |s| -s),
    }
}
