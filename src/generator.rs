use crate::block::{Block, InputKind};
use crate::names::{NameDb, NameType};
use crate::workspace::Workspace;
use anyhow::{bail, Result};
use regex::Regex;
use std::collections::HashMap;

/// Binding strength of a generated expression. Lower binds tighter; the
/// integer part is the precedence class.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Order(pub f64);

impl Order {
    fn class(self) -> i64 {
        self.0.floor() as i64
    }
}

/// Output of a per-block generator.
#[derive(Debug, Clone, PartialEq)]
pub enum Code {
    Statement(String),
    Value(String, Order),
    /// The block registered its code elsewhere (e.g. a function definition).
    Handled,
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub indent: String,
    pub comment_wrap: usize,
    /// Emitted before each statement; `%1` is replaced by the quoted block id.
    pub statement_prefix: Option<String>,
    pub one_based_index: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            indent: "  ".to_string(),
            comment_wrap: 60,
            statement_prefix: None,
            one_based_index: true,
        }
    }
}

/// A target language: its reserved words, precedence exceptions and the
/// per-block generators.
pub trait Language {
    fn name(&self) -> &'static str;

    fn reserved_words(&self) -> &'static [&'static str];

    /// (outer, inner) pairs that never need parentheses.
    fn order_overrides(&self) -> &'static [(Order, Order)] {
        &[]
    }

    fn init(&self, _gen: &mut Generator<'_>) -> Result<()> {
        Ok(())
    }

    /// Code for a single block, or None when the block type is not supported.
    fn generate(&self, gen: &mut Generator<'_>, block: &Block) -> Result<Option<Code>>;

    /// Adds comments and the code of the following blocks.
    fn scrub(&self, gen: &mut Generator<'_>, block: &Block, code: String, this_only: bool) -> Result<String> {
        let next = if this_only {
            String::new()
        } else {
            gen.statement_chain(block.next_block().map(String::as_str))?
        };
        Ok(code + &next)
    }

    fn finish(&self, _gen: &mut Generator<'_>, code: String) -> Result<String> {
        Ok(code)
    }

    fn scrub_naked_value(&self, line: String) -> String {
        line
    }

    fn unsupported_statement(&self, block: &Block) -> String;

    fn unsupported_value(&self, gen: &mut Generator<'_>, block: &Block) -> Code;
}

/// One code generation pass over a workspace.
pub struct Generator<'a> {
    ws: &'a Workspace,
    language: &'a dyn Language,
    pub options: GeneratorOptions,
    pub names: NameDb,
    definitions: Vec<(String, String)>,
    function_names: HashMap<String, String>,
}

impl<'a> Generator<'a> {
    pub const FUNCTION_NAME_PLACEHOLDER: &'static str = "{leCUI8hutHZI4480Dc}";

    pub fn new(ws: &'a Workspace, language: &'a dyn Language, options: GeneratorOptions) -> Self {
        Self {
            ws,
            language,
            options,
            names: NameDb::new(language.reserved_words()),
            definitions: Vec::new(),
            function_names: HashMap::new(),
        }
    }

    pub fn workspace(&self) -> &'a Workspace {
        self.ws
    }

    pub fn workspace_to_code(&mut self) -> Result<String> {
        self.definitions.clear();
        self.function_names.clear();
        let language = self.language;
        language.init(self)?;
        let ws = self.ws;
        let mut sections = Vec::new();
        for id in ws.top_blocks_sorted() {
            let block = ws.get_block(&id)?;
            let mut line = match self.block_to_code(Some(&id), false)? {
                Code::Statement(code) | Code::Value(code, _) => code,
                Code::Handled => String::new(),
            };
            if line.is_empty() {
                continue;
            }
            if block.output.is_some() {
                line = language.scrub_naked_value(line);
                if let Some(prefix) = &self.options.statement_prefix {
                    line = self.inject_id(prefix, block) + &line;
                }
            }
            sections.push(line);
        }
        let code = language.finish(self, sections.join("\n"))?;
        log::debug!("generated {} bytes of {}", code.len(), language.name());
        scrub_whitespace(&code)
    }

    /// Generates a block and, unless `this_only`, the blocks below it.
    /// Disabled blocks are skipped but their successors are not.
    pub fn block_to_code(&mut self, id: Option<&str>, this_only: bool) -> Result<Code> {
        let Some(id) = id else {
            return Ok(Code::Statement(String::new()));
        };
        let ws = self.ws;
        let block = ws.get_block(id)?;
        if !block.enabled {
            if this_only {
                return Ok(Code::Statement(String::new()));
            }
            return self.block_to_code(block.next_block().map(String::as_str), false);
        }
        let language = self.language;
        let code = match language.generate(self, block)? {
            Some(code) => code,
            None => {
                log::warn!("no {} generator for {}", language.name(), block.describe());
                if block.output.is_some() {
                    language.unsupported_value(self, block)
                } else {
                    Code::Statement(language.unsupported_statement(block))
                }
            }
        };
        match code {
            Code::Value(code, order) => {
                if block.output.is_none() {
                    bail!("Expecting string from statement block: {}", block.block_type);
                }
                Ok(Code::Value(language.scrub(self, block, code, this_only)?, order))
            }
            Code::Statement(mut code) => {
                if let Some(prefix) = &self.options.statement_prefix {
                    code = self.inject_id(prefix, block) + &code;
                }
                Ok(Code::Statement(language.scrub(self, block, code, this_only)?))
            }
            Code::Handled => Ok(Code::Handled),
        }
    }

    pub(crate) fn statement_chain(&mut self, id: Option<&str>) -> Result<String> {
        match self.block_to_code(id, false)? {
            Code::Statement(code) | Code::Value(code, _) => Ok(code),
            Code::Handled => Ok(String::new()),
        }
    }

    /// Code of the block plugged into `input`, parenthesised when the
    /// surrounding operator binds tighter. Empty when nothing is plugged in.
    pub fn value_to_code(&mut self, block: &Block, input: &str, outer: Order) -> Result<String> {
        let Some(target) = block.input_target(input) else {
            return Ok(String::new());
        };
        let (code, inner) = match self.block_to_code(Some(target.as_str()), false)? {
            Code::Value(code, order) => (code, order),
            Code::Statement(code) if code.is_empty() => return Ok(String::new()),
            Code::Handled => return Ok(String::new()),
            Code::Statement(_) => {
                let target_type = self.ws.get_block(target)?.block_type.clone();
                bail!("Expecting tuple from value block: {}", target_type);
            }
        };
        if code.is_empty() {
            return Ok(code);
        }
        if self.needs_parentheses(outer, inner) {
            return Ok(format!("({})", code));
        }
        Ok(code)
    }

    fn needs_parentheses(&self, outer: Order, inner: Order) -> bool {
        let (outer_class, inner_class) = (outer.class(), inner.class());
        if outer_class > inner_class {
            return false;
        }
        if outer_class == inner_class && (outer_class == 0 || outer_class == 99) {
            return false;
        }
        !self
            .language
            .order_overrides()
            .iter()
            .any(|&(o, i)| o == outer && i == inner)
    }

    /// Indented code of the statement stack in `input`.
    pub fn statement_to_code(&mut self, block: &Block, input: &str) -> Result<String> {
        let code = self.statement_chain(block.input_target(input).map(String::as_str))?;
        if code.is_empty() {
            return Ok(code);
        }
        Ok(prefix_lines(&code, &self.options.indent))
    }

    pub fn add_loop_trap(&self, branch: String, block: &Block) -> String {
        match &self.options.statement_prefix {
            Some(prefix) => branch + &prefix_lines(&self.inject_id(prefix, block), &self.options.indent),
            None => branch,
        }
    }

    pub fn inject_id(&self, msg: &str, block: &Block) -> String {
        msg.replace("%1", &format!("'{}'", block.id))
    }

    pub fn indent(&self) -> &str {
        &self.options.indent
    }

    /// Sets a named top-of-file definition. Re-defining keeps the original
    /// position.
    pub fn define(&mut self, key: &str, code: String) {
        match self.definitions.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = code,
            None => self.definitions.push((key.to_string(), code)),
        }
    }

    pub fn has_definition(&self, key: &str) -> bool {
        self.definitions.iter().any(|(k, _)| k == key)
    }

    pub fn definitions(&self) -> &[(String, String)] {
        &self.definitions
    }

    /// Registers a helper function once and returns its final name.
    /// Occurrences of the placeholder in `lines` are replaced by that name,
    /// and two-space indents by the configured indent.
    pub fn provide_function(&mut self, desired_name: &str, lines: &[&str]) -> String {
        if !self.has_definition(desired_name) {
            let function_name = self.names.get_distinct_name(desired_name, NameType::Procedure);
            let code = lines
                .iter()
                .map(|line| {
                    let line = line.replace(Self::FUNCTION_NAME_PLACEHOLDER, &function_name);
                    let depth = line.len() - line.trim_start_matches("  ").len();
                    format!("{}{}", self.options.indent.repeat(depth / 2), &line[depth..])
                })
                .collect::<Vec<_>>()
                .join("\n");
            self.function_names.insert(desired_name.to_string(), function_name);
            self.define(desired_name, code);
        }
        self.function_names
            .get(desired_name)
            .cloned()
            .unwrap_or_else(|| desired_name.to_string())
    }

    pub fn variable_name(&mut self, var_id: &str) -> String {
        self.names.get_name(var_id, NameType::Variable)
    }

    pub fn procedure_name(&mut self, name: &str) -> String {
        self.names.get_name(name, NameType::Procedure)
    }

    /// Comments of a block and everything below it, one per line.
    pub fn all_nested_comments(&self, id: &str) -> String {
        let mut comments = self
            .ws
            .descendants(id)
            .iter()
            .filter_map(|d| self.ws.block(d).and_then(|b| b.comment.clone()))
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>();
        if !comments.is_empty() {
            comments.push(String::new());
        }
        comments.join("\n")
    }

    /// Comment lines for a statement block and its value children.
    pub fn comment_code(&self, block: &Block, line_prefix: &str) -> String {
        if block.output.as_ref().is_some_and(|c| c.is_connected()) {
            return String::new();
        }
        let mut out = String::new();
        if let Some(comment) = block.comment.as_deref().filter(|c| !c.is_empty()) {
            let wrapped = wrap(comment, self.options.comment_wrap.saturating_sub(3));
            out += &prefix_lines(&(wrapped + "\n"), line_prefix);
        }
        for input in block.inputs.iter().filter(|i| i.kind == InputKind::Value) {
            if let Some(child) = input.target_block() {
                let nested = self.all_nested_comments(child);
                if !nested.is_empty() {
                    out += &prefix_lines(&nested, line_prefix);
                }
            }
        }
        out
    }
}

/// Prefixes every line of `text`; a trailing newline does not start a line.
pub fn prefix_lines(text: &str, prefix: &str) -> String {
    let body = text.strip_suffix('\n');
    let (content, tail) = match body {
        Some(content) => (content, "\n"),
        None => (text, ""),
    };
    let joined = format!("\n{}", prefix);
    format!("{}{}{}", prefix, content.replace('\n', &joined), tail)
}

/// Greedy word wrap, keeping existing line breaks.
pub fn wrap(text: &str, limit: usize) -> String {
    if limit == 0 {
        return text.to_string();
    }
    text.split('\n')
        .map(|paragraph| {
            let mut lines: Vec<String> = Vec::new();
            let mut current = String::new();
            for word in paragraph.split_whitespace() {
                if !current.is_empty() && current.len() + 1 + word.len() > limit {
                    lines.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(word);
            }
            lines.push(current);
            lines.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drops leading blank lines, trailing whitespace and spaces before newlines.
fn scrub_whitespace(code: &str) -> Result<String> {
    let leading = Regex::new(r"^\s+\n")?;
    let trailing = Regex::new(r"\n\s+$")?;
    let line_ends = Regex::new(r"[ \t]+\n")?;
    let code = leading.replace(code, "");
    let code = trailing.replace(&code, "\n");
    Ok(line_ends.replace_all(&code, "\n").into_owned())
}
