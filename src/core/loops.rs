use std::ops::Range;

use log::debug;

use crate::config::LoopMarkerMode;
use crate::context::Scope;
use crate::errors::ParseError;
use crate::parser::Token;
use crate::types::Value;

pub const LOOP_NUMBER: &str = "loop_number";
pub const LOOP_COUNT: &str = "loop_count";

#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Start { variable: String, collection: String, raw: String },
    End,
}

impl Marker {
    pub fn from_token(token: &Token) -> Option<Marker> {
        match token {
            Token::LoopStart { variable, collection, raw } => Some(Marker::Start {
                variable: variable.clone(),
                collection: collection.clone(),
                raw: raw.clone(),
            }),
            Token::LoopEnd { .. } => Some(Marker::End),
            _ => None,
        }
    }
}

/// Slides `start..=end` repeated once per element of `collection`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopRange {
    pub start: usize,
    pub end: usize,
    pub variable: String,
    pub collection: String,
    /// The start directive as written.
    pub raw: String,
}

impl LoopRange {
    /// Slides that are repeated under `mode`.
    pub fn body(&self, mode: LoopMarkerMode) -> Range<usize> {
        match mode {
            LoopMarkerMode::StripDirectives => self.start..self.end + 1,
            LoopMarkerMode::DropMarkerSlides => self.start + 1..self.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Plain(usize),
    Loop(LoopRange),
}

/// Pairs loop markers across slides. `markers[i]` holds the markers found on slide `i`.
///
/// Every check runs before anything is duplicated; slide numbers in errors are 1-based.
pub fn plan_sections(markers: &[Vec<Marker>]) -> Result<Vec<Section>, ParseError> {
    let mut sections = Vec::new();
    let mut open: Option<(usize, String, String, String)> = None;

    for (index, slide_markers) in markers.iter().enumerate() {
        let slide = index + 1;
        let starts: Vec<&Marker> = slide_markers.iter().filter(|m| matches!(m, Marker::Start { .. })).collect();
        let ends = slide_markers.len() - starts.len();

        if starts.len() > 1 {
            return Err(ParseError::MultipleLoopStarts { slide });
        }
        if ends > 1 {
            return Err(ParseError::MultipleLoopEnds { slide });
        }
        if starts.len() == 1 && ends == 1 {
            return Err(ParseError::LoopBoundsOnSameSlide { slide });
        }

        if let Some(Marker::Start { variable, collection, raw }) = starts.first() {
            if open.is_some() {
                return Err(ParseError::NestedLoop { slide });
            }
            open = Some((index, variable.clone(), collection.clone(), raw.clone()));
            continue;
        }

        if ends == 1 {
            let Some((start, variable, collection, raw)) = open.take() else {
                return Err(ParseError::UnmatchedLoopEnd { slide });
            };
            debug!("Loop over '{}' as '{}' spans slides {}..={}", collection, variable, start + 1, slide);
            sections.push(Section::Loop(LoopRange { start, end: index, variable, collection, raw }));
            continue;
        }

        if open.is_none() {
            sections.push(Section::Plain(index));
        }
    }

    if let Some((start, ..)) = open {
        return Err(ParseError::UnclosedLoop { slide: start + 1 });
    }
    Ok(sections)
}

/// Scope for one iteration: the loop variable plus `loop_number` (1-based) and `loop_count`.
pub fn iteration_scope<'a>(scope: &Scope<'a>, variable: &str, item: Value, index: usize, count: usize) -> Scope<'a> {
    scope
        .with(variable, item)
        .with(LOOP_NUMBER, index + 1)
        .with(LOOP_COUNT, count)
}
