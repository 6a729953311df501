//! binscope - Inspect the byte layout of binary files
//!
//! This tool decodes executables, archives, media files and encoded
//! messages into a tree of typed byte regions and prints it.

use anyhow::{bail, Context, Result};
use binscope_core::{Children, FileDom, Region, Registry, RegistryConfig};
use bytes::Bytes;
use clap::{Args, Parser, ValueEnum};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::{DirEntry, WalkDir};

/// Inspect the byte layout of binary files
#[derive(Parser, Debug)]
#[command(name = "binscope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    input: InputMode,

    /// Force a decoder instead of sniffing (see --list-formats)
    #[arg(long, value_name = "ID")]
    format: Option<String>,

    /// Decoder option such as zip.encoding=latin1 (repeatable)
    #[arg(long = "option", value_name = "FORMAT.KEY=VALUE", value_parser = parse_option)]
    options: Vec<FormatOption>,

    /// Output mode
    #[arg(short, long, value_enum, default_value = "tree")]
    output: OutputMode,

    /// Deepest tree level to print (0 = top-level regions only)
    #[arg(long)]
    depth: Option<usize>,

    /// Number of children of a lazy record table to decode and print
    #[arg(long, default_value = "8")]
    lazy_preview: usize,

    /// Dry run - only show which decoder each file would use
    #[arg(long)]
    dry_run: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single file to decode
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of files to decode
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// List the available decoders and their options
    #[arg(long)]
    list_formats: bool,
}

/// How decoded files are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputMode {
    /// Indented region tree
    Tree,
    /// One line per file plus its top-level regions
    Summary,
}

/// One `--option` value
#[derive(Debug, Clone, PartialEq, Eq)]
struct FormatOption {
    format: String,
    key: String,
    value: String,
}

fn parse_option(s: &str) -> std::result::Result<FormatOption, String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FORMAT.KEY=VALUE, got '{s}'"))?;
    let (format, key) = name
        .split_once('.')
        .filter(|(f, k)| !f.is_empty() && !k.is_empty())
        .ok_or_else(|| format!("expected FORMAT.KEY before '=', got '{name}'"))?;
    Ok(FormatOption {
        format: format.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Tracks decoded content so that identical files are decoded once
#[derive(Default)]
struct ContentIndex {
    /// Maps content hash -> first path with that content
    seen: HashMap<String, PathBuf>,
    stats: RunStats,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RunStats {
    files: usize,
    decoded: usize,
    undecoded: usize,
    duplicates: usize,
}

impl ContentIndex {
    /// Short hex digest of the content (first 16 chars of blake3)
    fn content_hash(data: &[u8]) -> String {
        blake3::hash(data).to_hex()[..16].to_string()
    }

    /// Returns the first path seen with this hash, or records `path` as it
    fn first_seen(&mut self, path: &Path, hash: &str) -> Option<PathBuf> {
        if let Some(first) = self.seen.get(hash) {
            return Some(first.clone());
        }
        self.seen.insert(hash.to_string(), path.to_path_buf());
        None
    }

    fn print_summary(&self) {
        info!(
            "Summary: {} files, {} decoded, {} without regions, {} duplicates skipped",
            self.stats.files, self.stats.decoded, self.stats.undecoded, self.stats.duplicates
        );
    }
}

/// Rendering limits for the tree view
#[derive(Debug, Clone, Copy)]
struct View {
    depth: Option<usize>,
    lazy_preview: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let registry = build_registry(&cli)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if cli.input.list_formats {
        list_formats(&registry, &mut out)?;
        Ok(())
    } else if let Some(ref file) = cli.input.file {
        process_single_file(&cli, &registry, file, &mut out)
    } else if let Some(ref directory) = cli.input.directory {
        process_directory(&cli, &registry, directory, &mut out).map(|_| ())
    } else {
        bail!("One of --file, --directory or --list-formats must be specified")
    }
}

/// Builds the registry from `--option` values, rejecting unknown format ids
fn build_registry(cli: &Cli) -> Result<Registry> {
    let config = cli
        .options
        .iter()
        .fold(RegistryConfig::new(), |config, o| {
            config.option(o.format.as_str(), o.key.as_str(), o.value.as_str())
        });
    let registry = Registry::with_config(config);

    for o in &cli.options {
        let Some(decoder) = registry.get(&o.format) else {
            bail!("Unknown format in --option: {} (see --list-formats)", o.format);
        };
        if !decoder.parsing_options().iter().any(|def| def.id == o.key) {
            warn!("Format '{}' has no option '{}'; it will be ignored", o.format, o.key);
        }
    }
    if let Some(ref id) = cli.format {
        if registry.get(id).is_none() {
            bail!("Unknown format: {} (see --list-formats)", id);
        }
    }
    Ok(registry)
}

fn list_formats(registry: &Registry, out: &mut impl Write) -> io::Result<()> {
    let options: HashMap<_, _> = registry.parsing_options().into_iter().collect();
    for id in registry.formats() {
        let name = registry.get(id).map(|d| d.name()).unwrap_or_default();
        writeln!(out, "{id:<10} {name}")?;
        for def in options.get(id).into_iter().flatten() {
            writeln!(
                out,
                "{:<10}   --option {id}.{}=<value>  {} (default: {})",
                "", def.id, def.description, def.default
            )?;
        }
    }
    Ok(())
}

/// Decode a single file
fn process_single_file(cli: &Cli, registry: &Registry, file: &Path, out: &mut impl Write) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let mut index = ContentIndex::default();
    process_file(cli, registry, file, &mut index, out)
}

/// Decode every non-hidden file under a directory
fn process_directory(
    cli: &Cli,
    registry: &Registry,
    directory: &Path,
    out: &mut impl Write,
) -> Result<RunStats> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let mut index = ContentIndex::default();
    for path in candidate_files(directory) {
        debug!("Processing: {}", path.display());
        if let Err(e) = process_file(cli, registry, &path, &mut index, out) {
            // Log error but continue with other files
            warn!("Error processing {}: {:#}", path.display(), e);
        }
    }

    index.print_summary();
    Ok(index.stats)
}

/// Regular files under `directory` in name order, skipping hidden entries
fn candidate_files(directory: &Path) -> Vec<PathBuf> {
    WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(DirEntry::into_path)
        .collect()
}

/// Hidden below the root; the root itself is always walked
fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
}

fn process_file(
    cli: &Cli,
    registry: &Registry,
    path: &Path,
    index: &mut ContentIndex,
    out: &mut impl Write,
) -> Result<()> {
    trace!("Reading {}", path.display());
    let data = Bytes::from(
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?,
    );
    index.stats.files += 1;

    let hash = ContentIndex::content_hash(&data);
    if let Some(first) = index.first_seen(path, &hash) {
        debug!("Skipping duplicate: {} (hash: {})", path.display(), hash);
        index.stats.duplicates += 1;
        writeln!(out, "{}: same content as {}", path.display(), first.display())?;
        return Ok(());
    }

    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if cli.dry_run {
        let decoder = match cli.format {
            Some(ref id) => registry.get(id),
            None => registry.select(name, &data),
        };
        let id = decoder.map(|d| d.id()).unwrap_or("no decoder");
        writeln!(out, "{}: {}", path.display(), id)?;
        return Ok(());
    }

    let dom = registry
        .parse(data, name, cli.format.as_deref())
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    if dom.regions.is_empty() {
        index.stats.undecoded += 1;
    } else {
        index.stats.decoded += 1;
    }

    match cli.output {
        OutputMode::Tree => {
            let view = View {
                depth: cli.depth,
                lazy_preview: cli.lazy_preview,
            };
            render_tree(out, path, &dom, view)?;
        }
        OutputMode::Summary => render_summary(out, path, &dom)?,
    }
    Ok(())
}

fn render_tree(out: &mut impl Write, path: &Path, dom: &FileDom, view: View) -> io::Result<()> {
    writeln!(
        out,
        "{} ({}, {} bytes)",
        path.display(),
        dom.format.unwrap_or("no decoder"),
        dom.buffer.len()
    )?;
    if dom.regions.is_empty() {
        writeln!(out, "  (no regions)")?;
    }
    for region in &dom.regions {
        render_region(out, region, 1, view)?;
    }
    Ok(())
}

fn render_region(out: &mut impl Write, region: &Region, level: usize, view: View) -> io::Result<()> {
    let indent = "  ".repeat(level);
    let line = format!(
        "{indent}{}  {}  [{}..{})  {}",
        region.id,
        region.kind.as_str(),
        region.start,
        region.end,
        region.display_value()
    );
    writeln!(out, "{}", line.trim_end())?;

    if matches!(view.depth, Some(max) if level > max) {
        return Ok(());
    }
    match &region.children {
        Children::None => {}
        Children::Eager(children) => {
            for child in children {
                render_region(out, child, level + 1, view)?;
            }
        }
        Children::Lazy(lazy) => {
            let shown = lazy.count().min(view.lazy_preview);
            for i in 0..shown {
                match lazy.get(i) {
                    Ok(child) => render_region(out, &child, level + 1, view)?,
                    Err(e) => {
                        writeln!(out, "{indent}  <child {i} not decoded: {e}>")?;
                        break;
                    }
                }
            }
            if lazy.count() > shown {
                writeln!(out, "{indent}  ... {} more (lazy)", lazy.count() - shown)?;
            }
        }
    }
    Ok(())
}

fn render_summary(out: &mut impl Write, path: &Path, dom: &FileDom) -> io::Result<()> {
    let mut decoded = 0;
    let mut lazy_tables = 0;
    for region in &dom.regions {
        region.walk(&mut |r| {
            decoded += 1;
            if r.children.is_lazy() {
                lazy_tables += 1;
            }
        });
    }
    writeln!(
        out,
        "{}: {} ({} bytes), {} top-level regions, {} decoded regions, {} lazy tables",
        path.display(),
        dom.format.unwrap_or("no decoder"),
        dom.buffer.len(),
        dom.regions.len(),
        decoded,
        lazy_tables
    )?;
    for region in &dom.regions {
        writeln!(
            out,
            "  {:<28} [{}..{})  {} children",
            region.id,
            region.start,
            region.end,
            region.child_count()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gzip() -> Vec<u8> {
        let mut data = vec![0x1F, 0x8B, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0x03];
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        data.extend_from_slice(&[0; 8]);
        data
    }

    /// Stored ZIP with one empty entry per name
    fn zip(names: &[&str]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut offsets = Vec::new();
        for name in names {
            offsets.push(data.len() as u32);
            data.extend_from_slice(b"PK\x03\x04");
            data.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0x21, 0]);
            data.extend_from_slice(&[0; 12]);
            data.extend_from_slice(&(name.len() as u16).to_le_bytes());
            data.extend_from_slice(&[0, 0]);
            data.extend_from_slice(name.as_bytes());
        }
        let cd_offset = data.len();
        for (name, offset) in names.iter().zip(offsets) {
            data.extend_from_slice(b"PK\x01\x02");
            data.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0x21, 0]);
            data.extend_from_slice(&[0; 12]);
            data.extend_from_slice(&(name.len() as u16).to_le_bytes());
            data.extend_from_slice(&[0; 12]);
            data.extend_from_slice(&offset.to_le_bytes());
            data.extend_from_slice(name.as_bytes());
        }
        let cd_size = data.len() - cd_offset;
        data.extend_from_slice(b"PK\x05\x06");
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&(names.len() as u16).to_le_bytes());
        data.extend_from_slice(&(names.len() as u16).to_le_bytes());
        data.extend_from_slice(&(cd_size as u32).to_le_bytes());
        data.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        data.extend_from_slice(&[0, 0]);
        data
    }

    fn tree(data: Vec<u8>, name: &str, view: View) -> String {
        let dom = Registry::new().parse(data, name, None).unwrap();
        let mut out = Vec::new();
        render_tree(&mut out, Path::new(name), &dom, view).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_parse_option() {
        assert_eq!(
            parse_option("zip.encoding=latin1").unwrap(),
            FormatOption {
                format: "zip".to_string(),
                key: "encoding".to_string(),
                value: "latin1".to_string(),
            }
        );
        assert!(parse_option("zip.encoding").is_err());
        assert!(parse_option("encoding=latin1").is_err());
        assert!(parse_option(".encoding=latin1").is_err());
    }

    #[test]
    fn test_build_registry_rejects_unknown_format() {
        let cli = Cli::try_parse_from(["binscope", "--list-formats", "--option", "nope.x=1"]).unwrap();
        assert!(build_registry(&cli).is_err());

        let cli = Cli::try_parse_from(["binscope", "--list-formats", "--format", "elf"]).unwrap();
        assert!(build_registry(&cli).is_err());

        let cli =
            Cli::try_parse_from(["binscope", "--list-formats", "--option", "zip.encoding=latin1"]).unwrap();
        assert!(build_registry(&cli).is_ok());
    }

    #[test]
    fn test_list_formats() {
        let mut out = Vec::new();
        list_formats(&Registry::new(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("ico"));
        assert!(text.contains("--option zip.encoding=<value>"));
        assert_eq!(text.lines().filter(|l| !l.starts_with(' ')).count(), 12);
    }

    #[test]
    fn test_tree_output() {
        let view = View {
            depth: None,
            lazy_preview: 8,
        };
        let text = tree(gzip(), "a.gz", view);
        assert!(text.starts_with("a.gz (gzip, 21 bytes)"));
        assert!(text.contains("  gzip  compound  [0..21)"));
        assert!(text.contains("    CompressedData  bytes  [10..13)"));

        let view = View {
            depth: Some(0),
            lazy_preview: 8,
        };
        let text = tree(gzip(), "a.gz", view);
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_lazy_preview() {
        let view = View {
            depth: None,
            lazy_preview: 1,
        };
        let text = tree(zip(&["a", "b", "c"]), "x.zip", view);
        assert!(text.contains("CentralDirectoryEntry"));
        assert_eq!(text.matches("... 2 more (lazy)").count(), 2);
    }

    #[test]
    fn test_content_hash() {
        let hash1 = ContentIndex::content_hash(b"hello");
        let hash2 = ContentIndex::content_hash(b"hello");
        let hash3 = ContentIndex::content_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_candidate_files_skip_hidden() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("sub/.git")).unwrap();
        fs::write(root.join("a.bin"), b"a").unwrap();
        fs::write(root.join(".hidden"), b"h").unwrap();
        fs::write(root.join("sub/b.bin"), b"b").unwrap();
        fs::write(root.join("sub/.git/config"), b"c").unwrap();

        let files: Vec<_> = candidate_files(root)
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(files, vec![PathBuf::from("a.bin"), PathBuf::from("sub/b.bin")]);
    }

    #[test]
    fn test_directory_deduplicates_content() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("one.gz"), gzip()).unwrap();
        fs::write(root.join("two.gz"), gzip()).unwrap();
        fs::write(root.join("notes.txt"), b"plain text").unwrap();

        let dir = root.to_str().unwrap();
        let cli = Cli::try_parse_from(["binscope", "--directory", dir, "--output", "summary"]).unwrap();
        let registry = build_registry(&cli).unwrap();
        let mut out = Vec::new();
        let stats = process_directory(&cli, &registry, root, &mut out).unwrap();

        assert_eq!(
            stats,
            RunStats {
                files: 3,
                decoded: 1,
                undecoded: 1,
                duplicates: 1,
            }
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("two.gz: same content as"));
        assert!(text.contains("one.gz: gzip (21 bytes), 1 top-level regions"));
    }

    #[test]
    fn test_dry_run() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("archive.bin");
        fs::write(&file, zip(&["a"])).unwrap();

        let path = file.to_str().unwrap();
        let cli = Cli::try_parse_from(["binscope", "--file", path, "--dry-run"]).unwrap();
        let registry = build_registry(&cli).unwrap();
        let mut out = Vec::new();
        process_single_file(&cli, &registry, &file, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), format!("{path}: zip\n"));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
