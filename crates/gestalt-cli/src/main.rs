//! gestalt - Dump Swift reflection metadata from compiled binaries
//!
//! This tool loads Mach-O, ELF and PE/COFF images, decodes the records of
//! their Swift 5 metadata sections and prints them as Swift-like
//! declarations.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gestalt_core::catalog::{
    AssociatedTypeDescriptor, BuiltinTypeDescriptor, CatalogRecord, FieldDescriptor,
    FieldDescriptorKind, ProtocolConformance, ProtocolDescriptor, ProtocolRecord,
};
use gestalt_core::resolve::{NamePiece, NameRun};
use gestalt_core::{
    FailurePolicy, NameDecoder, ObjectFileReader, ObjectReader, Scanner, ScannerConfig,
    SectionRole, SectionTable, VerbatimNames,
};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Dump Swift reflection metadata embedded in compiled binaries
#[derive(Parser, Debug)]
#[command(name = "gestalt")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print decoded metadata as Swift-like declarations
    Dump(DumpArgs),
    /// List the sections of a binary and how they are classified
    Sections(SectionsArgs),
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[command(flatten)]
    input: InputMode,

    /// Also print the symbols of every image
    #[arg(long)]
    symbols: bool,

    /// Only print records of this role (fieldmd, assocty, builtin, protos, proto)
    #[arg(long)]
    role: Option<SectionRole>,

    /// Maximum number of records decoded per section (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_records: usize,

    /// Reject an image at its first corrupt record instead of skipping it
    #[arg(long)]
    fail_fast: bool,

    /// Demangler command names are passed to, e.g. "swift-demangle --compact"
    /// (names are printed mangled without one)
    #[arg(long, value_name = "COMMAND")]
    demangler: Option<String>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single binary file to dump
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of binaries to process
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SectionsArgs {
    /// Path to the binary to inspect
    #[arg(short, long)]
    file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    match &cli.command {
        Command::Dump(args) => run_dump(args),
        Command::Sections(args) => run_sections(&args.file),
    }
}

fn run_dump(args: &DumpArgs) -> Result<()> {
    let policy = if args.fail_fast {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::Isolate
    };
    let config = ScannerConfig::new()
        .failure_policy(policy)
        .max_records_per_section(args.max_records);
    let mut scanner = Scanner::with_config(config);

    if let Some(ref file) = args.input.file {
        load_single_file(&mut scanner, file)?;
    } else if let Some(ref directory) = args.input.directory {
        load_directory(&mut scanner, directory)?;
    } else {
        bail!("Either --file or --directory must be specified")
    }

    for issue in scanner.issues() {
        match issue.role {
            Some(_) => warn!("{}", issue),
            None => debug!("{}", issue),
        }
    }

    let demangler = match args.demangler.as_deref() {
        Some(command) => Some(
            CommandDemangler::new(command).context("--demangler needs a program to run")?,
        ),
        None => None,
    };
    let names: &dyn NameDecoder = match &demangler {
        Some(demangler) => demangler,
        None => &VerbatimNames,
    };

    print!("{}", render_dump(&scanner, args, names));
    Ok(())
}

/// Name decoder running an external demangler once per distinct name
///
/// Names are passed as the last argument and the trimmed standard output is
/// used. Failures and unchanged output fall back to the mangled text.
struct CommandDemangler {
    program: String,
    args: Vec<String>,
    cache: Mutex<HashMap<String, String>>,
}

impl CommandDemangler {
    fn new(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            cache: Mutex::default(),
        })
    }

    fn run(&self, symbol: &str) -> Option<String> {
        let output = match process::Command::new(&self.program)
            .args(&self.args)
            .arg(symbol)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                debug!("Failed to run {}: {}", self.program, e);
                return None;
            }
        };
        if !output.status.success() {
            trace!("{} exited with {} for {}", self.program, output.status, symbol);
            return None;
        }
        let text = String::from_utf8(output.stdout).ok()?;
        let text = text.trim();
        (!text.is_empty() && text != symbol).then(|| text.to_string())
    }
}

impl NameDecoder for CommandDemangler {
    fn decode(&self, encoded: &str) -> String {
        if encoded.is_empty() {
            return String::new();
        }
        if let Some(hit) = self.cache.lock().ok().and_then(|cache| cache.get(encoded).cloned()) {
            return hit;
        }

        // metadata holds bare manglings, symbols carry their own prefix
        let symbol = if encoded.starts_with('$') || encoded.starts_with('_') {
            encoded.to_string()
        } else {
            format!("$s{encoded}")
        };
        let decoded = self.run(&symbol).unwrap_or_else(|| encoded.to_string());
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(encoded.to_string(), decoded.clone());
        }
        decoded
    }

    fn decode_run(&self, run: &NameRun<'_>) -> String {
        // symbolic references only resolve inside the image
        if run
            .pieces()
            .iter()
            .all(|piece| matches!(piece, NamePiece::Text(_)))
        {
            self.decode(&String::from_utf8_lossy(run.bytes))
        } else {
            VerbatimNames.decode_run(run)
        }
    }
}

/// Load a single binary file
fn load_single_file(scanner: &mut Scanner, file: &Path) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    scanner
        .add_image(file)
        .with_context(|| format!("Failed to load binary: {}", file.display()))?;
    Ok(())
}

/// Load a directory of binaries recursively
fn load_directory(scanner: &mut Scanner, directory: &Path) -> Result<()> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let mut binaries_loaded = 0;

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        // Skip hidden files
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
        {
            continue;
        }

        if !is_likely_binary(path) {
            trace!("Skipping non-binary: {}", path.display());
            continue;
        }

        debug!("Loading binary: {}", path.display());
        match scanner.add_image(path) {
            Ok(id) => {
                trace!("Loaded {} as image {}", path.display(), id);
                binaries_loaded += 1;
            }
            // Log error but continue with other files
            Err(e) => warn!("Error loading {}: {}", path.display(), e),
        }
    }

    info!("Loaded {} binaries", binaries_loaded);
    Ok(())
}

/// Heuristic to determine if a file is likely a binary image
fn is_likely_binary(path: &Path) -> bool {
    // Check by extension - skip obvious non-binaries
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let skip_extensions = [
            "txt", "md", "json", "yaml", "yml", "xml", "plist", "html", "css", "js", "py", "rb",
            "swift", "h", "m", "c", "cpp", "hpp", "rs", "toml", "ini", "cfg", "conf", "log", "csv",
            "svg", "png", "jpg", "jpeg", "gif", "pdf", "zip", "tar", "gz", "xz", "sh", "bat",
            "strings", "nib", "car",
        ];
        if skip_extensions.contains(&ext.to_lowercase().as_str()) {
            return false;
        }
    }

    // Skip very small files (< 1KB) and very large files (> 1GB)
    if let Ok(metadata) = fs::metadata(path) {
        let size = metadata.len();
        if size < 1024 || size > 1024 * 1024 * 1024 {
            return false;
        }
    }

    // Identify container formats by their magic bytes
    if let Ok(mut file) = fs::File::open(path) {
        use std::io::Read;
        let mut magic = [0u8; 4];
        if file.read_exact(&mut magic).is_ok() {
            // Mach-O, both widths and byte orders, and universal binaries
            if matches!(
                magic,
                [0xCF, 0xFA, 0xED, 0xFE]
                    | [0xCE, 0xFA, 0xED, 0xFE]
                    | [0xFE, 0xED, 0xFA, 0xCF]
                    | [0xFE, 0xED, 0xFA, 0xCE]
                    | [0xCA, 0xFE, 0xBA, 0xBE]
            ) {
                return true;
            }
            // ELF
            if magic == [0x7F, b'E', b'L', b'F'] {
                return true;
            }
            // PE - MZ header
            if magic[0..2] == [b'M', b'Z'] {
                return true;
            }
        }
    }

    // If we can't determine, try it anyway if it has no extension
    path.extension().is_none()
}

fn run_sections(file: &Path) -> Result<()> {
    let object = ObjectReader
        .open(file)
        .with_context(|| format!("Failed to open binary: {}", file.display()))?;
    let table = SectionTable::swift5();

    for section in &object.sections {
        let role = table
            .classify(&section.name)
            .map(|role| role.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:#012x} {:>10} {:<32} {}",
            section.address,
            section.contents.len(),
            section.name,
            role
        );
    }
    Ok(())
}

/// Whether output for `role` was requested
fn wants(args: &DumpArgs, role: SectionRole) -> bool {
    args.role.map_or(true, |wanted| wanted == role)
}

fn render_dump(scanner: &Scanner, args: &DumpArgs, names: &dyn NameDecoder) -> String {
    let mut out = String::new();

    if wants(args, SectionRole::FieldMetadata) {
        write_header(&mut out, "Field Metadata");
        for descriptor in typed::<FieldDescriptor>(scanner, names) {
            out.push_str(&render_field_descriptor(&descriptor));
        }
    }

    if wants(args, SectionRole::AssociatedTypes) {
        write_header(&mut out, "Associated Type Metadata");
        for descriptor in typed::<AssociatedTypeDescriptor>(scanner, names) {
            out.push_str(&render_associated_types(&descriptor));
        }
    }

    if wants(args, SectionRole::BuiltinTypes) {
        write_header(&mut out, "Builtin Types");
        for builtin in typed::<BuiltinTypeDescriptor>(scanner, names) {
            out.push_str(&render_builtin(&builtin));
        }
    }

    if wants(args, SectionRole::Protocols) {
        write_header(&mut out, "Protocols");
        for record in typed::<ProtocolRecord>(scanner, names) {
            if let Some(descriptor) = &record.descriptor {
                out.push_str(&render_protocol(descriptor));
            }
        }
    }

    if wants(args, SectionRole::ProtocolConformances) {
        write_header(&mut out, "Protocol Conformances");
        for conformance in typed::<ProtocolConformance>(scanner, names) {
            out.push_str(&render_conformance(&conformance));
        }
    }

    if args.symbols {
        write_header(&mut out, "Symbols");
        for image in scanner.images() {
            for symbol in image.symbols() {
                let _ = writeln!(out, "{}", names.decode(&symbol.name));
            }
        }
    }

    out
}

/// Typed records of one role; records that fail to resolve are logged and skipped
fn typed<T: CatalogRecord>(scanner: &Scanner, names: &dyn NameDecoder) -> Vec<T> {
    scanner
        .typed_records::<T>(names)
        .into_iter()
        .filter_map(|record| match record {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping {} record: {}", T::ROLE, e);
                None
            }
        })
        .collect()
}

fn write_header(out: &mut String, title: &str) {
    let _ = writeln!(out, "================DUMPING: {}====================", title);
}

/// Strip the noise demangled names carry for imported and extended types
fn postprocess_name(name: &str) -> String {
    if name.starts_with("(extension in") {
        if let Some((_, rest)) = name.split_once(':') {
            return rest.to_string();
        }
    }
    name.replace("__C", "")
}

fn display_name(name: Option<&str>) -> String {
    name.map(postprocess_name)
        .unwrap_or_else(|| "<unknown>".to_string())
}

fn render_field_descriptor(descriptor: &FieldDescriptor) -> String {
    let keyword = match descriptor.kind {
        FieldDescriptorKind::Struct => "struct",
        FieldDescriptorKind::Class => "class",
        FieldDescriptorKind::Enum | FieldDescriptorKind::MultiPayloadEnum => "enum",
        FieldDescriptorKind::Protocol | FieldDescriptorKind::ClassProtocol => "protocol",
        FieldDescriptorKind::ObjCProtocol => "@objc protocol",
        FieldDescriptorKind::ObjCClass => "@objc class",
        FieldDescriptorKind::Unknown(_) => "/* unknown */",
    };

    let mut out = String::new();
    let _ = write!(
        out,
        "{} {}",
        keyword,
        display_name(descriptor.type_name.as_deref())
    );
    if descriptor.kind == FieldDescriptorKind::ClassProtocol {
        out.push_str(" : class");
    }
    out.push_str(" {\n");

    for field in &descriptor.fields {
        let introducer = if descriptor.kind.is_enum() {
            "case"
        } else if field.is_var() {
            "var"
        } else {
            "let"
        };
        let _ = write!(
            out,
            "   {} {}",
            introducer,
            field.name.as_deref().unwrap_or("_")
        );
        match field.type_name.as_deref() {
            Some(type_name) if !type_name.is_empty() => {
                let _ = writeln!(out, " : {}", postprocess_name(type_name));
            }
            _ => out.push('\n'),
        }
    }
    out.push_str("}\n");
    out
}

fn render_associated_types(descriptor: &AssociatedTypeDescriptor) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "extension {} : {} {{",
        display_name(descriptor.conforming_type_name.as_deref()),
        display_name(descriptor.protocol_type_name.as_deref())
    );
    for associated in &descriptor.associated_types {
        let _ = writeln!(
            out,
            "  typealias {} = {}",
            associated.name.as_deref().unwrap_or("_"),
            display_name(associated.substituted_type_name.as_deref())
        );
    }
    out.push_str("}\n");
    out
}

fn render_builtin(builtin: &BuiltinTypeDescriptor) -> String {
    format!(
        "{} : size {}, alignment {}, stride {}, extra inhabitants {}{}\n",
        display_name(builtin.type_name.as_deref()),
        builtin.size,
        builtin.alignment,
        builtin.stride,
        builtin.extra_inhabitants,
        if builtin.bitwise_takable {
            ", bitwise takable"
        } else {
            ""
        }
    )
}

fn render_protocol(descriptor: &ProtocolDescriptor) -> String {
    let mut out = String::new();
    let _ = write!(out, "protocol {}", display_name(descriptor.name.as_deref()));
    if descriptor.class_bound {
        out.push_str(" : class");
    }
    out.push_str(" {\n");
    for name in &descriptor.associated_type_names {
        let _ = writeln!(out, "  associatedtype {}", name);
    }
    out.push_str("}\n");
    out
}

fn render_conformance(conformance: &ProtocolConformance) -> String {
    format!(
        "extension {} : {} {{}}{}\n",
        display_name(conformance.type_name.as_deref()),
        display_name(conformance.protocol.as_deref()),
        if conformance.is_retroactive {
            " // retroactive"
        } else {
            ""
        }
    )
}
