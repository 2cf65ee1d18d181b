use std::fmt;

use thiserror::Error;

/// Where in the document a directive was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Free-standing text handed directly to the engine.
    Text,
    /// The document as a whole (loop pairing across slides).
    Document,
    Slide { slide: usize, shape: String },
    TableCell { slide: usize, shape: String, row: usize, column: usize },
    Chart { slide: usize, shape: String },
    SheetCell { sheet: String, row: usize, column: usize },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Text => write!(f, "text"),
            Location::Document => write!(f, "document"),
            Location::Slide { slide, shape } => write!(f, "slide {}, shape {:?}", slide, shape),
            Location::TableCell { slide, shape, row, column } => write!(
                f,
                "slide {}, table {:?}, row {}, column {}",
                slide, shape, row + 1, column + 1
            ),
            Location::Chart { slide, shape } => write!(f, "slide {}, chart {:?}", slide, shape),
            Location::SheetCell { sheet, row, column } => {
                write!(f, "sheet {:?}, cell {}{}", sheet, column_letter(*column), row + 1)
            }
        }
    }
}

/// Spreadsheet column name for a zero-based index (0 -> A, 26 -> AA).
pub fn column_letter(mut column: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (column % 26) as u8) as char);
        if column < 26 {
            break;
        }
        column = column / 26 - 1;
    }
    letters.iter().rev().collect()
}

/// Malformed template syntax. Always aborts a render.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unterminated '{delimiter}' directive at offset {offset} in {text:?}")]
    Unterminated { delimiter: &'static str, offset: usize, text: String },
    #[error("malformed expression {text:?}: {message}")]
    Malformed { text: String, message: String },
    #[error("empty placeholder {text:?}")]
    EmptyPlaceholder { text: String },
    #[error("unexpected curly brace in expression {text:?}")]
    StrayBrace { text: String },
    #[error("directive {text:?} is not allowed here")]
    MisplacedDirective { text: String },
    #[error("slide {slide} carries more than one loop start directive")]
    MultipleLoopStarts { slide: usize },
    #[error("slide {slide} carries more than one %endloop% directive")]
    MultipleLoopEnds { slide: usize },
    #[error("slide {slide} carries both a loop start and an %endloop% directive")]
    LoopBoundsOnSameSlide { slide: usize },
    #[error("slide {slide}: nested loops are not supported")]
    NestedLoop { slide: usize },
    #[error("slide {slide}: %endloop% without a matching loop start")]
    UnmatchedLoopEnd { slide: usize },
    #[error("loop started on slide {slide} is never closed with %endloop%")]
    UnclosedLoop { slide: usize },
}

/// What went wrong while resolving a placeholder.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionErrorKind {
    #[error("unknown attribute '{segment}' after '{path}'")]
    UnknownAttribute { segment: String, path: String },
    #[error("cannot read '{segment}' from a {found} value")]
    NotAnObject { segment: String, found: &'static str },
    #[error("filter on '{segment}' needs a sequence, found {found}")]
    NotASequence { segment: String, found: &'static str },
    #[error("'{segment}' is not callable")]
    NotCallable { segment: String },
    #[error("calling '{segment}' failed: {message}")]
    CallFailed { segment: String, message: String },
    #[error("arithmetic on non-numeric values: {message}")]
    TypeMismatch { message: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown format specifier {spec:?}")]
    UnknownFormat { spec: String },
    #[error("format {spec:?} cannot be applied to a {found} value")]
    FormatMismatch { spec: String, found: &'static str },
    #[error("{count} placeholders share a region with a list-valued one; expansion needs exactly one")]
    AmbiguousExpansion { count: usize },
    #[error("'{expression}' does not resolve to a collection (found {found})")]
    NotACollection { expression: String, found: &'static str },
    #[error("permission denied for {object:?}")]
    PermissionDenied { object: String },
    #[error("chart value {value:?} is not numeric")]
    NotNumeric { value: String },
}

/// A data-dependent failure attached to the raw placeholder that caused it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot resolve {placeholder:?}: {kind}")]
pub struct ResolutionError {
    pub placeholder: String,
    pub kind: ResolutionErrorKind,
}

impl ResolutionError {
    pub fn new(placeholder: impl Into<String>, kind: ResolutionErrorKind) -> Self {
        Self { placeholder: placeholder.into(), kind }
    }
}

/// Failure while evaluating one placeholder body, before a location is attached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaceholderError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl PlaceholderError {
    pub fn at(self, location: &Location) -> RenderError {
        match self {
            PlaceholderError::Parse(source) => RenderError::parse(location, source),
            PlaceholderError::Resolution(source) => RenderError::resolution(location, source),
        }
    }
}

/// A region could not be structurally expanded. Always aborts a render.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpansionError {
    #[error("column {column} is outside the template row ({width} cells)")]
    ColumnOutOfRange { column: usize, width: usize },
    #[error("row {row} cannot be cloned: {reason}")]
    InvalidCloneTarget { row: usize, reason: String },
    #[error("row {row} cannot be removed: {reason}")]
    UnremovableRow { row: usize, reason: String },
    #[error("chart series {series:?} has {values} values for {categories} categories")]
    ChartMisaligned { series: String, values: usize, categories: usize },
}

/// Image retrieval failure for a single `%image%` marker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("image fetching is disabled (no fetcher configured) for {url}")]
    Disabled { url: String },
    #[error("request for {url} failed: {message}")]
    Network { url: String, message: String },
    #[error("request for {url} timed out")]
    Timeout { url: String },
    #[error("request for {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("content at {url} is not a supported image")]
    NotAnImage { url: String },
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("parse error at {location}: {source}")]
    Parse { location: Location, #[source] source: ParseError },
    #[error("resolution error at {location}: {source}")]
    Resolution { location: Location, #[source] source: ResolutionError },
    #[error("expansion error at {location}: {source}")]
    Expansion { location: Location, #[source] source: ExpansionError },
    #[error("image error at {location} ({directive:?}): {source}")]
    Fetch { location: Location, directive: String, #[source] source: FetchError },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("document codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RenderError {
    pub fn parse(location: &Location, source: ParseError) -> Self {
        RenderError::Parse { location: location.clone(), source }
    }

    pub fn resolution(location: &Location, source: ResolutionError) -> Self {
        RenderError::Resolution { location: location.clone(), source }
    }

    pub fn expansion(location: &Location, source: ExpansionError) -> Self {
        RenderError::Expansion { location: location.clone(), source }
    }

    /// Structural errors mean the template itself is broken and abort regardless of policy.
    pub fn is_structural(&self) -> bool {
        !matches!(self, RenderError::Resolution { .. } | RenderError::Fetch { .. })
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            RenderError::Parse { location, .. }
            | RenderError::Resolution { location, .. }
            | RenderError::Expansion { location, .. }
            | RenderError::Fetch { location, .. } => Some(location),
            RenderError::Config(_) | RenderError::Codec(_) => None,
        }
    }

    /// Short cause used for inline error markers.
    pub fn cause(&self) -> String {
        match self {
            RenderError::Resolution { source, .. } => source.to_string(),
            RenderError::Fetch { source, .. } => source.to_string(),
            other => other.to_string(),
        }
    }
}

/// Data-dependent errors collected during a best-effort render.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<RenderError>,
}

impl Diagnostics {
    pub fn push(&mut self, error: RenderError) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[RenderError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_errors(self) -> Vec<RenderError> {
        self.errors
    }
}
