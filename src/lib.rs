pub mod block;
pub mod blocks;
pub mod connection;
pub mod connection_db;
pub mod events;
pub mod generator;
pub mod mutator;
pub mod names;
pub mod procedures;
pub mod python;
pub mod state;
pub mod types;
pub mod variables;
pub mod workspace;
pub mod xml;

#[cfg(not(target_arch = "wasm32"))]
pub mod cli;

#[cfg(all(target_arch = "wasm32", feature = "wasm-bindings"))]
pub mod wasm;

use anyhow::Result;
use generator::{Generator, GeneratorOptions};
use python::Python;
use std::path::{Path, PathBuf};
use workspace::{Workspace, WorkspaceOptions};

#[cfg(not(target_arch = "wasm32"))]
pub fn run_cli(args: &cli::Args) -> Result<()> {
    let total_stages = 3 + usize::from(args.emit_xml.is_some()) + usize::from(args.emit_json.is_some());
    let progress = CliProgress::new("Generate", total_stages, args.verbose);
    let mut stage = 0usize;

    stage += 1;
    progress.emit(stage, "Resolving input path");
    let input = canonicalize_file(&args.input)?;
    let text = std::fs::read_to_string(&input)?;

    stage += 1;
    progress.emit(stage, "Loading workspace");
    let options = WorkspaceOptions {
        lenient_block_types: !args.strict_types,
        ..WorkspaceOptions::default()
    };
    let ws = if args.json {
        load_workspace_json(&text, options)?
    } else {
        load_workspace_xml(&text, options)?
    };

    if let Some(path) = &args.emit_xml {
        stage += 1;
        progress.emit(stage, "Writing XML");
        std::fs::write(path, xml::workspace_to_xml(&ws, true)?)?;
    }
    if let Some(path) = &args.emit_json {
        stage += 1;
        progress.emit(stage, "Writing JSON");
        std::fs::write(path, state::workspace_to_json(&ws)?)?;
    }

    stage += 1;
    progress.emit(stage, "Generating Python");
    print!("{}", workspace_to_python(&ws, GeneratorOptions::default())?);
    Ok(())
}

pub fn load_workspace_xml(text: &str, options: WorkspaceOptions) -> Result<Workspace> {
    let mut ws = Workspace::with_options(options);
    xml::workspace_from_xml(&mut ws, text)?;
    Ok(ws)
}

pub fn load_workspace_json(text: &str, options: WorkspaceOptions) -> Result<Workspace> {
    let mut ws = Workspace::with_options(options);
    state::workspace_from_json(&mut ws, text)?;
    Ok(ws)
}

pub fn workspace_to_python(ws: &Workspace, options: GeneratorOptions) -> Result<String> {
    Generator::new(ws, &Python, options).workspace_to_code()
}

pub fn xml_to_python(text: &str) -> Result<String> {
    let ws = load_workspace_xml(text, WorkspaceOptions::default())?;
    workspace_to_python(&ws, GeneratorOptions::default())
}

pub fn json_to_python(text: &str) -> Result<String> {
    let ws = load_workspace_json(text, WorkspaceOptions::default())?;
    workspace_to_python(&ws, GeneratorOptions::default())
}

pub fn canonicalize_file(path: &Path) -> Result<PathBuf> {
    if !path.exists() || !path.is_file() {
        return Err(anyhow::anyhow!("Input file not found: '{}'.", path.display()));
    }
    Ok(path.canonicalize()?)
}

#[cfg(not(target_arch = "wasm32"))]
struct CliProgress {
    prefix: &'static str,
    total: usize,
    enabled: bool,
}

#[cfg(not(target_arch = "wasm32"))]
impl CliProgress {
    fn new(prefix: &'static str, total: usize, enabled: bool) -> Self {
        Self {
            prefix,
            total: total.max(1),
            enabled,
        }
    }

    fn emit(&self, step: usize, label: &str) {
        if !self.enabled {
            return;
        }
        let step = step.clamp(1, self.total);
        let bar = render_progress_bar(step, self.total, 14);
        eprintln!("[{}] {}... ({}/{}) {}", self.prefix, label, step, self.total, bar);
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn render_progress_bar(step: usize, total: usize, width: usize) -> String {
    let width = width.max(1);
    let filled = ((step * width) + (total / 2)) / total;
    let mut s = String::with_capacity(width + 2);
    s.push('[');
    for i in 0..width {
        s.push(if i < filled { '=' } else { '-' });
    }
    s.push(']');
    s
}
