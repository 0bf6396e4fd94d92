use std::{
    borrow::Cow,
    fmt, fs,
    io::{self, Write},
    ops::ControlFlow,
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, ValueEnum};
use dwarfcfi::dwarf::{
    cfi::{CallFrameInfo, Handler, Register, TracingReporter},
    reader::{ByteReader, Endianness},
    section::{CfiSection, SectionMap},
};
use object::{Object, ObjectSection};
use tracing::{debug, info_span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prints the unwinding rules described by an object file's call frame
/// information.
#[derive(Parser, Debug)]
#[command(name = "cfi-dump")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// The object file to read
    path: PathBuf,
    /// Which CFI sections to dump
    #[arg(short, long, value_enum, default_value_t = Which::All)]
    section: Which,
    /// Only print the header of every entry, not its rules
    #[arg(long, default_value_t = false)]
    headers: bool,
    /// Log more (-v for debug, -vv for trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Which {
    DebugFrame,
    EhFrame,
    All,
}

impl Which {
    fn sections(self) -> &'static [CfiSection] {
        match self {
            Which::DebugFrame => &[CfiSection::DebugFrame],
            Which::EhFrame => &[CfiSection::EhFrame],
            Which::All => &CfiSection::ALL,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum DumpError {
    #[error("failed to set up logging: {0}")]
    Logging(#[from] tracing_subscriber::filter::FromEnvError),
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: String, source: object::Error },
    #[error("failed to read section {name}: {source}")]
    Section {
        name: &'static str,
        source: object::Error,
    },
    #[error("{path} has no call frame information")]
    NoCfi { path: String },
    #[error("failed to write output: {0}")]
    Write(#[from] io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = init_tracing(cli.verbose).and_then(|()| run(&cli));
    match result {
        Ok(true) => ExitCode::SUCCESS,
        // the rules were printed, but some entries were broken
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("cfi-dump: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) -> Result<(), DumpError> {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?,
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();
    Ok(())
}

fn run(cli: &Cli) -> Result<bool, DumpError> {
    let path = cli.path.display().to_string();
    let data = fs::read(&cli.path).map_err(|source| DumpError::Read {
        path: path.clone(),
        source,
    })?;
    let file = object::File::parse(&*data).map_err(|source| DumpError::Parse {
        path: path.clone(),
        source,
    })?;

    let endian = if file.is_little_endian() {
        Endianness::Little
    } else {
        Endianness::Big
    };
    let address_size = if file.is_64() { 8 } else { 4 };
    let mut reader = ByteReader::new(endian, address_size);
    if let Some(text) = find_section(&file, &[".text", "__text"]) {
        reader = reader.with_text_base(text.address());
    }
    if let Some(got) = find_section(&file, &[".got", "__got"]) {
        reader = reader.with_data_base(got.address());
    }
    debug!(file_format = ?file.format(), ?reader, "opened {path}");

    let mut loaded = Vec::new();
    for &section in cli.section.sections() {
        if let Some(found) = load_section(&file, section)? {
            loaded.push(found);
        }
    }
    let mut sections = SectionMap::new();
    for (name, contents, address) in &loaded {
        sections.insert(name, &contents[..], *address);
    }
    if sections.is_empty() {
        return Err(DumpError::NoCfi { path });
    }

    let stdout = io::stdout();
    let mut printer = Printer {
        out: stdout.lock(),
        headers_only: cli.headers,
        failed: None,
    };
    let mut all_ok = true;
    for (section, _) in sections.iter() {
        let Some(cfi) = CallFrameInfo::from_sections(&sections, reader, section) else {
            continue;
        };
        let _span = info_span!("dump", %section).entered();
        writeln!(printer.out, "{section}:")?;

        let mut reporter = TracingReporter::new(&path, section.name());
        all_ok &= cfi.start(&mut printer, &mut reporter);
        if let Some(err) = printer.failed.take() {
            return Err(err.into());
        }
    }
    printer.out.flush()?;

    Ok(all_ok)
}

fn find_section<'data, 'file>(
    file: &'file object::File<'data>,
    names: &[&str],
) -> Option<object::Section<'data, 'file>> {
    names.iter().find_map(|name| file.section_by_name(name))
}

fn load_section<'data>(
    file: &object::File<'data>,
    section: CfiSection,
) -> Result<Option<(&'static str, Cow<'data, [u8]>, u64)>, DumpError> {
    for &name in section.names() {
        if let Some(found) = file.section_by_name(name) {
            let contents = found
                .uncompressed_data()
                .map_err(|source| DumpError::Section { name, source })?;
            return Ok(Some((name, contents, found.address())));
        }
    }

    Ok(None)
}

/// Writes every entry and rule as one line.
struct Printer<W> {
    out: W,
    headers_only: bool,
    /// The first write error, which stops the dump.
    failed: Option<io::Error>,
}

impl<W: Write> Printer<W> {
    fn line(&mut self, line: fmt::Arguments<'_>) -> ControlFlow<()> {
        match self.out.write_fmt(line) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => {
                self.failed = Some(err);
                ControlFlow::Break(())
            }
        }
    }

    fn rule(&mut self, address: u64, reg: Register, rule: fmt::Arguments<'_>) -> ControlFlow<()> {
        self.line(format_args!("  {address:#x}: {reg} = {rule}\n"))
    }
}

struct Hex<'a>(&'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn indirect(indirect: bool) -> &'static str {
    if indirect {
        " (indirect)"
    } else {
        ""
    }
}

impl<W: Write> Handler for Printer<W> {
    fn entry(
        &mut self,
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: &str,
        return_address: u64,
    ) -> bool {
        let end = address.wrapping_add(length);
        let printed = self.line(format_args!(
            "FDE {offset:#x}: {address:#x}..{end:#x} version {version} \
             augmentation {augmentation:?} return address r{return_address}\n"
        ));
        printed.is_continue() && !self.headers_only
    }

    fn undefined_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()> {
        self.rule(address, reg, format_args!("undefined"))
    }

    fn same_value_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()> {
        self.rule(address, reg, format_args!("same value"))
    }

    fn offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        self.rule(address, reg, format_args!("[{base}{offset:+}]"))
    }

    fn val_offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        self.rule(address, reg, format_args!("{base}{offset:+}"))
    }

    fn register_rule(
        &mut self,
        address: u64,
        reg: Register,
        base_register: u64,
    ) -> ControlFlow<()> {
        self.rule(address, reg, format_args!("r{base_register}"))
    }

    fn expression_rule(
        &mut self,
        address: u64,
        reg: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        self.rule(address, reg, format_args!("[expr {}]", Hex(expression)))
    }

    fn val_expression_rule(
        &mut self,
        address: u64,
        reg: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        self.rule(address, reg, format_args!("expr {}", Hex(expression)))
    }

    fn personality_routine(&mut self, address: u64, is_indirect: bool) -> ControlFlow<()> {
        self.line(format_args!("  personality {address:#x}{}\n", indirect(is_indirect)))
    }

    fn language_specific_data_area(&mut self, address: u64, is_indirect: bool) -> ControlFlow<()> {
        self.line(format_args!("  lsda {address:#x}{}\n", indirect(is_indirect)))
    }

    fn signal_handler(&mut self) -> ControlFlow<()> {
        self.line(format_args!("  signal frame\n"))
    }

    fn end(&mut self) {}
}
