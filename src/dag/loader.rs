// src/dag/loader.rs

//! Where stage graphs come from.
//!
//! The default source is the `pipeline.toml` manifest. An external tool that
//! prints a DOT digraph (for example `dvc dag --dot`) can be plugged in with
//! [`DotCommandSource`].

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use regex::Regex;
use tracing::debug;

use crate::config::{load_and_validate, pipeline_path};
use crate::dag::graph::{Stage, StageGraph, StageKind};
use crate::errors::{Result, StagehandError};

/// Something that can describe the stage DAG of a workspace.
pub trait GraphSource: Send + Sync {
    fn load(&self, cwd: &Path) -> Result<StageGraph>;
}

/// Reads `<cwd>/pipeline.toml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestSource;

impl GraphSource for ManifestSource {
    fn load(&self, cwd: &Path) -> Result<StageGraph> {
        let path = pipeline_path(cwd);
        let manifest = load_and_validate(&path).map_err(|e| match e {
            StagehandError::DagCycle(_) => e,
            other => StagehandError::GraphUnavailable(format!(
                "cannot read {}: {}",
                path.display(),
                other
            )),
        })?;
        Ok(StageGraph::from_pipeline(&manifest))
    }
}

/// Runs a shell command in `cwd` and parses its stdout as a DOT digraph.
#[derive(Debug, Clone)]
pub struct DotCommandSource {
    command: String,
}

impl DotCommandSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl GraphSource for DotCommandSource {
    fn load(&self, cwd: &Path) -> Result<StageGraph> {
        debug!(command = %self.command, cwd = %cwd.display(), "loading stage graph from command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(cwd)
            .output()
            .map_err(|e| {
                StagehandError::GraphUnavailable(format!(
                    "failed to spawn `{}`: {}",
                    self.command, e
                ))
            })?;

        if !output.status.success() {
            return Err(StagehandError::GraphUnavailable(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let text = String::from_utf8(output.stdout).map_err(|e| {
            StagehandError::GraphUnavailable(format!("`{}` printed non-UTF-8: {}", self.command, e))
        })?;

        parse_dot(&text)
    }
}

/// Load the graph from `source` for `cwd` (default: the process working
/// directory) and restrict it to `targets` plus their ancestors.
pub fn load_graph(
    source: &dyn GraphSource,
    cwd: Option<&Path>,
    targets: &[String],
) -> Result<StageGraph> {
    let graph = match cwd {
        Some(dir) => source.load(dir)?,
        None => source.load(&std::env::current_dir()?)?,
    };
    graph.topological_order()?;
    graph.restrict_to(targets)
}

/// Parse a DOT digraph into a [`StageGraph`].
///
/// Supported: node statements with an optional attribute list, edge chains
/// (`a -> b -> c`), quoted or bare identifiers. A node's `cmd` attribute makes
/// it runnable; nodes without one are data-only. The `"\n"` pseudo-node some
/// tools emit is ignored.
pub fn parse_dot(text: &str) -> Result<StageGraph> {
    let body = extract_body(text)?;
    let attr_re = Regex::new(r#"(\w+)\s*=\s*("(?:[^"\\]|\\.)*"|[^,;\s\]]+)"#)
        .map_err(|e| StagehandError::Other(e.into()))?;
    let mut graph = StageGraph::new();
    let mut commands: BTreeMap<String, String> = BTreeMap::new();
    let mut edges: Vec<(String, String)> = Vec::new();

    for statement in split_statements(body) {
        let statement = statement.trim();
        if statement.is_empty() || is_global_attr(statement) {
            continue;
        }

        let (head, attrs) = split_attrs(statement)?;
        let ids: Vec<String> = head.split("->").map(unquote).collect();
        if ids.iter().any(|id| id.is_empty()) {
            return Err(StagehandError::GraphUnavailable(format!(
                "malformed DOT statement: {statement}"
            )));
        }

        let ids: Vec<String> = ids.into_iter().filter(|id| !is_artefact(id)).collect();

        for id in ids.iter() {
            if graph.id_of(id).is_none() {
                graph.add_stage(Stage::data_only(id.clone()));
            }
        }

        if ids.len() == 1 {
            if let Some(attrs) = attrs {
                for cap in attr_re.captures_iter(attrs) {
                    if &cap[1] == "cmd" {
                        commands.insert(ids[0].clone(), unquote(&cap[2]));
                    }
                }
            }
        } else {
            for pair in ids.windows(2) {
                edges.push((pair[0].clone(), pair[1].clone()));
            }
        }
    }

    for (name, cmd) in commands {
        let previous = graph
            .stage(&name)
            .cloned()
            .unwrap_or_else(|| Stage::data_only(name.clone()));
        graph.add_stage(Stage::new(
            name,
            StageKind::Runnable { cmd },
            previous.deps,
            previous.outs,
            previous.params,
        ));
    }

    for (from, to) in edges {
        graph.add_edge(&from, &to)?;
    }

    Ok(graph)
}

fn extract_body(text: &str) -> Result<&str> {
    let open = text.find('{');
    let close = text.rfind('}');
    match (open, close) {
        (Some(open), Some(close)) if open < close => {
            let header = text[..open].trim();
            if !header.split_whitespace().any(|w| w == "digraph") {
                return Err(StagehandError::GraphUnavailable(format!(
                    "expected a DOT digraph, found header '{header}'"
                )));
            }
            Ok(&text[open + 1..close])
        }
        _ => Err(StagehandError::GraphUnavailable(
            "expected a DOT digraph body enclosed in braces".to_string(),
        )),
    }
}

/// Split on `;` and newlines that are not inside a quoted string.
fn split_statements(body: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' | '\n' if !in_quotes => {
                out.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&body[start..]);
    out
}

fn split_attrs(statement: &str) -> Result<(&str, Option<&str>)> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in statement.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '[' if !in_quotes => {
                let rest = &statement[i + 1..];
                let end = rest.rfind(']').ok_or_else(|| {
                    StagehandError::GraphUnavailable(format!(
                        "unterminated attribute list: {statement}"
                    ))
                })?;
                return Ok((&statement[..i], Some(&rest[..end])));
            }
            _ => {}
        }
    }
    Ok((statement, None))
}

fn is_global_attr(statement: &str) -> bool {
    let first = statement.split(['[', ' ', '\t']).next().unwrap_or("");
    matches!(first, "graph" | "node" | "edge" | "rankdir")
}

fn is_artefact(id: &str) -> bool {
    id == "\\n" || id == "\n"
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('n') => out.push_str("\\n"),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}
