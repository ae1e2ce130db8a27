//! Shader program lifecycle: compile, link, swap, and memoised uniform
//! lookups.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::device::{GpuDevice, ProgramId, ShaderStage, Uniform, UniformLocation};

/// Structured source error. Never fatal; the caller keeps its old program.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("Vertex: {0}")]
    Vertex(String),
    /// Fragment log with line numbers already mapped to the user's source.
    #[error("{0}")]
    Fragment(String),
    #[error("Link: {0}")]
    Link(String),
}

/// Compiles and links a program without touching any existing one.
pub fn compile<D: GpuDevice + ?Sized>(
    device: &mut D,
    vertex: &str,
    fragment: &str,
    header_lines: usize,
) -> Result<ProgramId, CompileError> {
    let vertex_stage = device
        .compile_stage(ShaderStage::Vertex, vertex)
        .map_err(CompileError::Vertex)?;

    let fragment_stage = match device.compile_stage(ShaderStage::Fragment, fragment) {
        Ok(stage) => stage,
        Err(log) => {
            device.release_stage(vertex_stage);
            return Err(CompileError::Fragment(remap_error_lines(&log, header_lines)));
        }
    };

    let linked = device.link_program(vertex_stage, fragment_stage);
    device.release_stage(vertex_stage);
    device.release_stage(fragment_stage);
    linked.map_err(CompileError::Link)
}

/// Rewrites `ERROR: <file>:<line>` markers as `Line <n>` where
/// `n = max(1, line - header_lines)`.
pub fn remap_error_lines(log: &str, header_lines: usize) -> String {
    let mut out = String::with_capacity(log.len());
    let mut rest = log;
    while let Some(pos) = rest.find("ERROR:") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + "ERROR:".len()..];
        match parse_location(after) {
            Some((line, consumed)) => {
                let shown = line.saturating_sub(header_lines).max(1);
                let _ = write!(out, "Line {shown}");
                rest = &after[consumed..];
            }
            None => {
                out.push_str("ERROR:");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse_location(text: &str) -> Option<(usize, usize)> {
    let trimmed = text.trim_start();
    let file_digits = trimmed.bytes().take_while(u8::is_ascii_digit).count();
    if file_digits == 0 {
        return None;
    }
    let after = trimmed[file_digits..].strip_prefix(':')?;
    let line_digits = after.bytes().take_while(u8::is_ascii_digit).count();
    if line_digits == 0 {
        return None;
    }
    let line = after[..line_digits].parse().ok()?;
    let consumed = (text.len() - trimmed.len()) + file_digits + 1 + line_digits;
    Some((line, consumed))
}

#[derive(Debug)]
struct ShaderProgram {
    id: ProgramId,
    locations: HashMap<String, Option<UniformLocation>>,
}

/// Holds at most one live program and swaps it atomically.
#[derive(Debug, Default)]
pub struct ProgramSlot {
    current: Option<ShaderProgram>,
}

impl ProgramSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<ProgramId> {
        self.current.as_ref().map(|program| program.id)
    }

    pub fn is_compiled(&self) -> bool {
        self.current.is_some()
    }

    /// Compiles a replacement. The previous program is destroyed only once
    /// the new one has linked; on failure the slot is untouched.
    pub fn replace<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        vertex: &str,
        fragment: &str,
        header_lines: usize,
    ) -> Result<ProgramId, CompileError> {
        let id = compile(device, vertex, fragment, header_lines)?;
        self.install(device, id);
        Ok(id)
    }

    /// Takes ownership of an already linked program, destroying the one it
    /// replaces.
    pub fn install<D: GpuDevice + ?Sized>(&mut self, device: &mut D, id: ProgramId) {
        let fresh = ShaderProgram {
            id,
            locations: HashMap::new(),
        };
        if let Some(old) = self.current.replace(fresh) {
            device.destroy_program(old.id);
        }
    }

    /// Memoised lookup; misses are cached as well.
    pub fn location<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        name: &str,
    ) -> Option<UniformLocation> {
        let program = self.current.as_mut()?;
        if let Some(cached) = program.locations.get(name) {
            return *cached;
        }
        let location = device.uniform_location(program.id, name);
        program.locations.insert(name.to_owned(), location);
        location
    }

    /// Writes `value` when the program declares `name`.
    pub fn set<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        name: &str,
        value: impl Into<Uniform>,
    ) -> bool {
        let Some(id) = self.id() else {
            return false;
        };
        match self.location(device, name) {
            Some(location) => {
                device.set_uniform(id, location, value.into());
                true
            }
            None => false,
        }
    }

    pub fn release<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        if let Some(program) = self.current.take() {
            device.destroy_program(program.id);
        }
    }

    /// Drops the handle without a device call; used after device loss.
    pub fn forget(&mut self) {
        self.current = None;
    }
}
