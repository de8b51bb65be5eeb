//! Source locations attached to graph nodes.
//!
//! A [`SourceInformation`] records the span a node was parsed from plus a
//! "main" position (usually the element's name). Its `Display` form is the
//! compact `source:LcC-LcC` notation used in compiler messages.

use std::cmp::Ordering;
use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// Span of source text a node was parsed from. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceInformation {
    source_id: String,
    start_line: u32,
    start_column: u32,
    line: u32,
    column: u32,
    end_line: u32,
    end_column: u32,
}

impl SourceInformation {
    /// Creates a span whose main position is its start.
    pub fn new(
        source_id: impl Into<String>,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    ) -> Self {
        Self::with_main(
            source_id,
            start_line,
            start_column,
            start_line,
            start_column,
            end_line,
            end_column,
        )
    }

    /// Creates a span with an explicit main position.
    pub fn with_main(
        source_id: impl Into<String>,
        start_line: u32,
        start_column: u32,
        line: u32,
        column: u32,
        end_line: u32,
        end_column: u32,
    ) -> Self {
        SourceInformation {
            source_id: source_id.into(),
            start_line,
            start_column,
            line,
            column,
            end_line,
            end_column,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn start_line(&self) -> u32 {
        self.start_line
    }

    pub fn start_column(&self) -> u32 {
        self.start_column
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn end_line(&self) -> u32 {
        self.end_line
    }

    pub fn end_column(&self) -> u32 {
        self.end_column
    }

    /// Inclusive range of lines covered by this span.
    pub fn lines(&self) -> RangeInclusive<u32> {
        self.start_line..=self.end_line
    }

    /// Returns a copy of this span with the end moved to `end_line:end_column`.
    pub fn extended_to(&self, end_line: u32, end_column: u32) -> Self {
        SourceInformation {
            end_line,
            end_column,
            ..self.clone()
        }
    }

    fn sort_key(&self) -> (&str, u32, u32, u32, u32, u32, u32) {
        (
            &self.source_id,
            self.line,
            self.column,
            self.start_line,
            self.start_column,
            self.end_line,
            self.end_column,
        )
    }
}

impl fmt::Display for SourceInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.source_id)?;
        if self.start_line == self.end_line {
            if self.start_column == self.end_column {
                write!(f, "{}c{}", self.start_line, self.start_column)
            } else {
                write!(
                    f,
                    "{}cc{}-{}",
                    self.start_line, self.start_column, self.end_column
                )
            }
        } else {
            write!(
                f,
                "{}c{}-{}c{}",
                self.start_line, self.start_column, self.end_line, self.end_column
            )
        }
    }
}

impl PartialOrd for SourceInformation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders by source id, then main position, then start, then end.
impl Ord for SourceInformation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}
