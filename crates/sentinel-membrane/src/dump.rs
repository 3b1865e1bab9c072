//! Diagnostics reporter.
//!
//! Renders the full state of one stack (construction site, trigger, canaries,
//! checksums, metadata, element listing) into a text sink owned by that
//! stack. A record is rendered into memory first and written with a single
//! `write_all`, so a failing formatter never leaves half a record behind.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic::Location;
use std::path::{Path, PathBuf};

use crate::canary::{CanaryGuard, Sentinel, position_of};
use crate::error::StackError;
use crate::guard::StackHeader;
use crate::layout::RegionLayout;
use crate::tracker::RawRegion;

/// Renders one element into a dump.
pub trait ElementFormatter: Send {
    fn format(&self, out: &mut dyn Write, element: &[u8]) -> io::Result<()>;
}

impl<F> ElementFormatter for F
where
    F: Fn(&mut dyn Write, &[u8]) -> io::Result<()> + Send,
{
    fn format(&self, out: &mut dyn Write, element: &[u8]) -> io::Result<()> {
        self(out, element)
    }
}

/// Writes each byte as an escaped ASCII character.
pub fn ascii(out: &mut dyn Write, element: &[u8]) -> io::Result<()> {
    for &byte in element {
        write!(out, "{}", byte.escape_ascii())?;
    }
    Ok(())
}

/// Writes the element as lowercase hex, `0x` prefixed.
pub fn hex(out: &mut dyn Write, element: &[u8]) -> io::Result<()> {
    out.write_all(b"0x")?;
    for byte in element {
        write!(out, "{byte:02x}")?;
    }
    Ok(())
}

/// Where a stack was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub file: String,
    pub line: u32,
    pub var_name: String,
    pub function: String,
}

impl Provenance {
    #[must_use]
    pub fn new(
        file: impl Into<String>,
        line: u32,
        var_name: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            line,
            var_name: var_name.into(),
            function: function.into(),
        }
    }

    /// Every field must be present; a zero line counts as missing.
    pub fn validate(&self) -> Result<(), StackError> {
        if self.file.is_empty() {
            return Err(StackError::MissingDiagnostics("file"));
        }
        if self.line == 0 {
            return Err(StackError::MissingDiagnostics("line"));
        }
        if self.var_name.is_empty() {
            return Err(StackError::MissingDiagnostics("var_name"));
        }
        if self.function.is_empty() {
            return Err(StackError::MissingDiagnostics("function"));
        }
        Ok(())
    }
}

/// Capture the declaration site of a stack variable.
///
/// ```
/// let site = sentinel_membrane::provenance!(symbols);
/// assert_eq!(site.var_name, "symbols");
/// ```
#[macro_export]
macro_rules! provenance {
    ($var:ident) => {
        $crate::Provenance::new(file!(), line!(), stringify!($var), module_path!())
    };
}

/// Source location and operation that triggered a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub op: &'static str,
}

impl CallSite {
    /// The caller of the innermost `#[track_caller]` frame.
    #[track_caller]
    #[must_use]
    pub fn here(op: &'static str) -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            op,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Everything needed to open a diagnostics sink. All parts are mandatory.
pub struct DiagnosticsConfig {
    sink_path: PathBuf,
    provenance: Provenance,
    formatter: Box<dyn ElementFormatter>,
}

impl DiagnosticsConfig {
    #[must_use]
    pub fn new(
        sink_path: impl Into<PathBuf>,
        provenance: Provenance,
        formatter: impl ElementFormatter + 'static,
    ) -> Self {
        Self {
            sink_path: sink_path.into(),
            provenance,
            formatter: Box::new(formatter),
        }
    }

    #[must_use]
    pub fn sink_path(&self) -> &Path {
        &self.sink_path
    }

    pub fn validate(&self) -> Result<(), StackError> {
        if self.sink_path.as_os_str().is_empty() {
            return Err(StackError::MissingDiagnostics("sink_path"));
        }
        self.provenance.validate()
    }
}

impl fmt::Debug for DiagnosticsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticsConfig")
            .field("sink_path", &self.sink_path)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

/// Borrowed view of the state being dumped.
#[derive(Clone, Copy)]
pub struct DumpView<'a> {
    pub stack_addr: usize,
    pub header: &'a StackHeader,
    pub region: &'a RawRegion,
    pub layout: &'a RegionLayout,
    pub canaries: bool,
    pub hashes: bool,
}

/// Owns one stack's dump file.
pub struct DiagnosticsReporter {
    path: PathBuf,
    provenance: Provenance,
    formatter: Box<dyn ElementFormatter>,
    sink: Option<BufWriter<File>>,
    records: usize,
}

impl DiagnosticsReporter {
    /// Validate `config` and create (truncate) its sink.
    pub fn open(config: DiagnosticsConfig) -> Result<Self, StackError> {
        config.validate()?;
        let file = File::create(&config.sink_path).map_err(StackError::Dump)?;
        Ok(Self {
            path: config.sink_path,
            provenance: config.provenance,
            formatter: config.formatter,
            sink: Some(BufWriter::new(file)),
            records: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Records written so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flush and close the sink. Closing twice is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        match self.sink.take() {
            Some(mut sink) => sink.flush(),
            None => Ok(()),
        }
    }

    /// Render and append one record.
    pub fn write_record(&mut self, view: &DumpView<'_>, reason: &str, site: CallSite) -> io::Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "diagnostic sink is closed",
            ));
        };
        let mut record = Vec::with_capacity(512);
        render(&mut record, &self.provenance, self.formatter.as_ref(), view, reason, site)?;
        sink.write_all(&record)?;
        sink.flush()?;
        self.records += 1;
        Ok(())
    }
}

impl fmt::Debug for DiagnosticsReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticsReporter")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

fn render(
    out: &mut Vec<u8>,
    provenance: &Provenance,
    formatter: &dyn ElementFormatter,
    view: &DumpView<'_>,
    reason: &str,
    site: CallSite,
) -> io::Result<()> {
    let header = view.header;
    writeln!(
        out,
        "GuardedStack[{:#x}] initialized in {}:{} as '{}' in function '{}'",
        view.stack_addr, provenance.file, provenance.line, provenance.var_name, provenance.function
    )?;
    writeln!(out, "dump called from {site} '{}'", site.op)?;
    writeln!(out, "ERROR = '{reason}'")?;
    writeln!(out, "{{")?;

    if view.canaries {
        let data_sentinel = |sentinel: Sentinel| {
            let addr = view.region.addr() + position_of(sentinel, view.layout);
            match CanaryGuard::stored(sentinel, header, view.region, view.layout) {
                Some(value) => format!("[{addr:#x}] = {value:#x}"),
                None => format!("[{addr:#x}] = <unreadable>"),
            }
        };
        writeln!(out, "\t\t---CANARIES---")?;
        writeln!(out, "\tcanary_left       = {:#x};", header.left_canary())?;
        writeln!(out, "\tdata_canary_left {};", data_sentinel(Sentinel::DataLeft))?;
        writeln!(out, "\tdata_canary_right{};", data_sentinel(Sentinel::DataRight))?;
        writeln!(out, "\tcanary_right      = {:#x};", header.right_canary())?;
    }

    if view.hashes {
        writeln!(out, "\t\t---HASHES---")?;
        writeln!(out, "\tstructure_hash    = {:#x};", header.structure_hash())?;
        writeln!(out, "\tdata_hash         = {:#x};", header.data_hash())?;
    }

    writeln!(out, "\t\t---DEFAULT_INFO---")?;
    writeln!(out, "\tsize              =   {};", header.size())?;
    writeln!(out, "\tcapacity          =   {};", header.capacity())?;
    writeln!(out, "\telement_size      =   {};", header.element_size())?;
    writeln!(out, "\t\t---MEMBERS---")?;
    writeln!(out, "\tdata[{:#x}]:", header.data_addr())?;
    write_members(out, formatter, view)?;
    writeln!(out, "}}")?;
    writeln!(out)
}

fn write_members(out: &mut Vec<u8>, formatter: &dyn ElementFormatter, view: &DumpView<'_>) -> io::Result<()> {
    let header = view.header;
    if header.data_addr() == 0 {
        return writeln!(out, "\t\t--- (POISON)");
    }
    if header.size() > header.capacity() {
        return writeln!(out, "\t\tincorrect size");
    }

    let bytes = view.region.as_slice();
    // Only slots that really exist in the region are listed.
    let listed = header.capacity().min(view.layout.capacity());
    for index in 0..listed {
        let poisoned = index >= header.size();
        let marker = if poisoned { "*" } else { " " };
        write!(out, "\t   {marker}[{index}] = ")?;
        match bytes.get(view.layout.slot_range(index)) {
            Some(element) => formatter.format(out, element)?,
            None => out.write_all(b"<out of region>")?,
        }
        writeln!(out, "{};", if poisoned { " (POISON)" } else { "" })?;
    }
    if listed < header.capacity() {
        writeln!(
            out,
            "\t\t{} slot(s) beyond the allocated region",
            header.capacity() - listed
        )?;
    }
    Ok(())
}

/// Failing-condition names of every record in `text`, in order.
#[must_use]
pub fn record_errors(text: &str) -> Vec<&str> {
    text.lines()
        .filter_map(|line| line.strip_prefix("ERROR = '"))
        .filter_map(|rest| rest.strip_suffix('\''))
        .collect()
}
