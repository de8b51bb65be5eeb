//! Pluggable parsers and the built-in declaration grammar.
//!
//! A source is split into sections by `###Name` header lines; each section
//! is handed to the [`Parser`] registered under that name (`Pure` when no
//! header precedes it). Parsers create nodes through the repository while
//! the batch transaction is open, so every node they create is registered
//! as new and disappears again if the batch fails.
//!
//! [`DeclarationParser`] understands a small line-oriented grammar:
//!
//! ```text
//! import meta::pure::*;
//! Class my::pkg::Person extends my::pkg::Named, Audited
//! {
//! }
//! Primitive Money;
//! ```

use puregraph_core::m3::{self, property};
use puregraph_core::{NodeId, NodeRepository, SourceInformation, Value};

use crate::error::CompileError;

/// Name of the section a source starts in.
pub const DEFAULT_SECTION: &str = "Pure";

/// Turns section text into nodes.
pub trait Parser: Send + Sync {
    /// Section name this parser handles.
    fn name(&self) -> &str;

    /// Parses `text` and returns the top-level nodes it declared, in source
    /// order. These are the nodes the compiler will bind, validate and, when
    /// the source changes, unbind.
    fn parse(&self, ctx: &ParseContext<'_>, text: &str) -> Result<Vec<NodeId>, CompileError>;
}

/// What a parser sees of the world.
pub struct ParseContext<'a> {
    repository: &'a NodeRepository,
    source_id: &'a str,
    line_offset: u32,
}

impl<'a> ParseContext<'a> {
    /// `line_offset` is added to every section-relative line number.
    pub fn new(repository: &'a NodeRepository, source_id: &'a str, line_offset: u32) -> Self {
        ParseContext {
            repository,
            source_id,
            line_offset,
        }
    }

    pub fn repository(&self) -> &'a NodeRepository {
        self.repository
    }

    pub fn source_id(&self) -> &'a str {
        self.source_id
    }

    /// Source span for section-relative, 1-based positions.
    pub fn span(&self, line: u32, column: u32, end_line: u32, end_column: u32) -> SourceInformation {
        SourceInformation::new(
            self.source_id,
            line + self.line_offset,
            column,
            end_line + self.line_offset,
            end_column,
        )
    }

    /// A syntax error at a section-relative position.
    pub fn error(&self, line: u32, column: u32, message: impl Into<String>) -> CompileError {
        CompileError::compilation(message, Some(self.span(line, column, line, column)))
    }

    /// A bootstrapped classifier, by top-level name.
    pub fn classifier(&self, name: &str) -> Result<NodeId, CompileError> {
        self.repository
            .get_top_level(name)
            .ok_or_else(|| CompileError::UnknownClassifier {
                path: name.to_string(),
            })
    }

    /// Places `node` into the package at `package_path`, creating packages
    /// as needed.
    pub fn declare_in_package(&self, node: NodeId, package_path: &str) -> Result<NodeId, CompileError> {
        let package = self.repository.get_or_create_package(package_path)?;
        self.repository
            .set_to_one(node, property::PACKAGE, Value::Node(package))?;
        self.repository.add_child(package, node)?;
        Ok(package)
    }
}

/// One `###`-delimited section of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub parser: String,
    /// 1-based line of the section's first content line.
    pub first_line: u32,
    pub text: String,
}

/// Splits source text on `###Name` header lines.
pub fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Section {
        parser: DEFAULT_SECTION.to_string(),
        first_line: 1,
        text: String::new(),
    };
    for (index, line) in text.split_inclusive('\n').enumerate() {
        let line_no = index as u32 + 1;
        if let Some(name) = line.trim_end().strip_prefix("###") {
            let next = Section {
                parser: name.trim().to_string(),
                first_line: line_no + 1,
                text: String::new(),
            };
            let finished = std::mem::replace(&mut current, next);
            if !finished.text.trim().is_empty() || finished.parser != DEFAULT_SECTION {
                sections.push(finished);
            }
        } else {
            current.text.push_str(line);
        }
    }
    if !current.text.trim().is_empty() || current.parser != DEFAULT_SECTION || sections.is_empty() {
        sections.push(current);
    }
    sections
}

// ---------------------------------------------------------------------------
// Declaration grammar
// ---------------------------------------------------------------------------

/// Parser for `import`, `Class` and `Primitive` declarations.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclarationParser;

impl Parser for DeclarationParser {
    fn name(&self) -> &str {
        DEFAULT_SECTION
    }

    fn parse(&self, ctx: &ParseContext<'_>, text: &str) -> Result<Vec<NodeId>, CompileError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut state = DeclarationState::new(ctx)?;
        let mut index = 0;
        while index < lines.len() {
            let raw = lines[index];
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with("//") {
                index += 1;
                continue;
            }
            let line = Line {
                number: index as u32 + 1,
                column: indent(raw) + 1,
                raw,
                trimmed,
            };
            if let Some(rest) = trimmed.strip_prefix("import ") {
                state.import(&line, rest)?;
                index += 1;
            } else if let Some(rest) = trimmed.strip_prefix("Class ") {
                index = state.class(&lines, index, &line, rest)?;
            } else if let Some(rest) = trimmed.strip_prefix("Primitive ") {
                state.primitive(&line, rest)?;
                index += 1;
            } else {
                let token = trimmed.split_whitespace().next().unwrap_or(trimmed);
                return Err(ctx.error(
                    line.number,
                    line.column,
                    format!("expected 'import', 'Class' or 'Primitive', found '{token}'"),
                ));
            }
        }
        Ok(state.roots)
    }
}

struct Line<'t> {
    number: u32,
    column: u32,
    raw: &'t str,
    trimmed: &'t str,
}

impl Line<'_> {
    fn end_column(&self) -> u32 {
        self.column + self.trimmed.chars().count() as u32 - 1
    }

    /// 1-based column of `needle` in the raw line, searching from byte `from`.
    fn column_of(&self, needle: &str, from: usize) -> u32 {
        self.raw[from..]
            .find(needle)
            .map(|pos| self.raw[..from + pos].chars().count() as u32 + 1)
            .unwrap_or(self.column)
    }
}

struct DeclarationState<'c, 'a> {
    ctx: &'c ParseContext<'a>,
    class: NodeId,
    primitive: NodeId,
    import: NodeId,
    import_group: NodeId,
    import_stub: NodeId,
    group: Option<NodeId>,
    roots: Vec<NodeId>,
}

impl<'c, 'a> DeclarationState<'c, 'a> {
    fn new(ctx: &'c ParseContext<'a>) -> Result<Self, CompileError> {
        Ok(DeclarationState {
            ctx,
            class: ctx.classifier(m3::CLASS)?,
            primitive: ctx.classifier(m3::PRIMITIVE_TYPE)?,
            import: ctx.classifier(m3::IMPORT)?,
            import_group: ctx.classifier(m3::IMPORT_GROUP)?,
            import_stub: ctx.classifier(m3::IMPORT_STUB)?,
            group: None,
            roots: Vec::new(),
        })
    }

    fn repo(&self) -> &'a NodeRepository {
        self.ctx.repository()
    }

    /// The section's import group, created at the first line that needs it.
    fn group(&mut self, line: &Line<'_>) -> Result<NodeId, CompileError> {
        if let Some(group) = self.group {
            return Ok(group);
        }
        let span = self.ctx.span(line.number, line.column, line.number, line.column);
        let group = self
            .repo()
            .create_anonymous(self.import_group, Some(span), true)?;
        self.group = Some(group);
        self.roots.push(group);
        Ok(group)
    }

    fn import(&mut self, line: &Line<'_>, rest: &str) -> Result<(), CompileError> {
        let statement = rest
            .trim()
            .strip_suffix(';')
            .ok_or_else(|| self.ctx.error(line.number, line.end_column(), "expected ';'"))?;
        let package = statement
            .trim()
            .strip_suffix("::*")
            .ok_or_else(|| {
                self.ctx
                    .error(line.number, line.column, "imports must have the form 'import a::b::*;'")
            })?;
        check_path(self.ctx, line, package)?;

        let group = self.group(line)?;
        let span = self
            .ctx
            .span(line.number, line.column, line.number, line.end_column());
        let import = self
            .repo()
            .create_anonymous(self.import, Some(span.clone()), true)?;
        self.repo()
            .set_to_one(import, property::PATH, Value::from(package))?;
        self.repo()
            .set_to_one(import, property::IMPORT_GROUP, Value::Node(group))?;
        self.repo()
            .add_value(group, property::IMPORTS, Value::Node(import))?;

        if let Some(group_span) = self.repo().source_information(group) {
            if group_span.end_line() < span.end_line() {
                self.repo().set_source_information(
                    group,
                    Some(group_span.extended_to(span.end_line(), span.end_column())),
                )?;
            }
        }
        Ok(())
    }

    /// Parses a class declaration starting at `lines[index]`. Returns the
    /// index of the first line after the declaration.
    fn class(
        &mut self,
        lines: &[&str],
        index: usize,
        line: &Line<'_>,
        rest: &str,
    ) -> Result<usize, CompileError> {
        // The body may open on the header line or on the next non-blank one.
        let (header, open_index, open_byte) = match rest.find('{') {
            Some(brace) => {
                let rest_offset = line.raw.len() - line.raw.trim_start().len() + "Class ".len();
                (rest[..brace].trim(), index, rest_offset + brace)
            }
            None => {
                let next = lines
                    .iter()
                    .enumerate()
                    .skip(index + 1)
                    .find(|(_, l)| !l.trim().is_empty());
                match next {
                    Some((i, l)) if l.trim_start().starts_with('{') => {
                        (rest.trim(), i, l.len() - l.trim_start().len())
                    }
                    _ => {
                        return Err(self.ctx.error(
                            line.number,
                            line.end_column(),
                            "expected '{'",
                        ))
                    }
                }
            }
        };
        let (path, supertypes) = match header.split_once(" extends ") {
            Some((path, supers)) => (path.trim(), Some(supers)),
            None => (header, None),
        };
        check_path(self.ctx, line, path)?;
        let (package, name) = match path.rsplit_once("::") {
            Some((package, name)) => (package, name),
            None => ("", path),
        };

        let (end_index, end_column) = closing_brace(lines, open_index, open_byte).ok_or_else(|| {
            self.ctx
                .error(line.number, line.column, format!("missing '}}' for class '{path}'"))
        })?;

        let end_line = end_index as u32 + 1;
        let name_column = line.column_of(path, 0) + (path.len() - name.len()) as u32;
        let span = SourceInformation::with_main(
            self.ctx.source_id(),
            line.number + self.ctx.line_offset,
            line.column,
            line.number + self.ctx.line_offset,
            name_column,
            end_line + self.ctx.line_offset,
            end_column,
        );
        let class = self.repo().create_node(name, self.class, Some(span), true)?;
        self.ctx.declare_in_package(class, package)?;

        let group = self.group(line)?;
        self.repo()
            .set_to_one(class, property::IMPORT_GROUP, Value::Node(group))?;

        if let Some(supers) = supertypes {
            let search_from = line.raw.find(" extends ").unwrap_or(0);
            for sup in supers.split(',').map(str::trim) {
                check_path(self.ctx, line, sup)?;
                let column = line.column_of(sup, search_from);
                let span = self.ctx.span(
                    line.number,
                    column,
                    line.number,
                    column + sup.chars().count() as u32 - 1,
                );
                let stub = self
                    .repo()
                    .create_anonymous(self.import_stub, Some(span), true)?;
                self.repo()
                    .set_to_one(stub, property::ID_OR_PATH, Value::from(sup))?;
                self.repo()
                    .set_to_one(stub, property::IMPORT_GROUP, Value::Node(group))?;
                self.repo()
                    .add_value(class, property::GENERALIZATION_STUBS, Value::Node(stub))?;
            }
        }

        self.roots.push(class);
        Ok(end_index + 1)
    }

    fn primitive(&mut self, line: &Line<'_>, rest: &str) -> Result<(), CompileError> {
        let name = rest
            .trim()
            .strip_suffix(';')
            .ok_or_else(|| self.ctx.error(line.number, line.end_column(), "expected ';'"))?
            .trim();
        if name.contains("::") {
            return Err(self
                .ctx
                .error(line.number, line.column, "primitive names cannot be qualified"));
        }
        check_path(self.ctx, line, name)?;
        let span = self
            .ctx
            .span(line.number, line.column, line.number, line.end_column());
        let node = self
            .repo()
            .create_node(name, self.primitive, Some(span), true)?;
        self.roots.push(node);
        Ok(())
    }
}

fn indent(raw: &str) -> u32 {
    raw.chars().take_while(|c| c.is_whitespace()).count() as u32
}

fn check_path(ctx: &ParseContext<'_>, line: &Line<'_>, path: &str) -> Result<(), CompileError> {
    let valid = !path.is_empty()
        && path.split("::").all(|segment| {
            !segment.is_empty() && segment.chars().all(|c| c.is_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(ctx.error(
            line.number,
            line.column,
            format!("invalid element path '{path}'"),
        ))
    }
}

/// Scans from the `{` at byte `open` of `lines[start]` to its matching `}`.
/// Returns the line index and 1-based column of the close brace.
fn closing_brace(lines: &[&str], start: usize, open: usize) -> Option<(usize, u32)> {
    let mut depth = 0usize;
    for (index, line) in lines.iter().enumerate().skip(start) {
        let from = if index == start { open } else { 0 };
        for (offset, c) in line[from..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        let column = line[..from + offset].chars().count() as u32 + 1;
                        return Some((index, column));
                    }
                }
                _ => {}
            }
        }
    }
    None
}
