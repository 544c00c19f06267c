//! Structured node dumps.
//!
//! Nodes describe themselves as a stream of events pushed into a
//! [`DataEventHandler`]. [`TextDumpHandler`] renders them as indented text.

use std::fmt::Write;

use tessera_common::{BlockId, BlockKind, Result, TesseraError};
use tessera_packed::SubstreamKind;

/// Visitor receiving the events of a node dump.
pub trait DataEventHandler {
    fn start_node(&mut self, id: BlockId, kind: BlockKind, level: u16) -> Result<()>;

    fn end_node(&mut self) -> Result<()>;

    /// A named scalar of the current node or substream.
    fn value(&mut self, name: &str, value: u64) -> Result<()>;

    fn start_substream(&mut self, index: usize, kind: SubstreamKind, size: usize) -> Result<()>;

    fn end_substream(&mut self) -> Result<()>;

    /// One entry of the current substream.
    fn entry(&mut self, index: usize, values: &[u64]) -> Result<()>;
}

/// Renders events as indented text.
#[derive(Debug, Default)]
pub struct TextDumpHandler {
    out: String,
    depth: usize,
}

impl TextDumpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn into_string(self) -> String {
        self.out
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) -> Result<()> {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out
            .write_fmt(args)
            .map_err(|e| TesseraError::Internal(e.to_string()))?;
        self.out.push('\n');
        Ok(())
    }
}

impl DataEventHandler for TextDumpHandler {
    fn start_node(&mut self, id: BlockId, kind: BlockKind, level: u16) -> Result<()> {
        let name = match kind {
            BlockKind::Leaf => "leaf",
            BlockKind::Branch => "branch",
            _ => "block",
        };
        self.line(format_args!("{} {} level {}", name, id, level))?;
        self.depth += 1;
        Ok(())
    }

    fn end_node(&mut self) -> Result<()> {
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    fn value(&mut self, name: &str, value: u64) -> Result<()> {
        self.line(format_args!("{}: {}", name, value))
    }

    fn start_substream(&mut self, index: usize, kind: SubstreamKind, size: usize) -> Result<()> {
        self.line(format_args!("substream {} {} size {}", index, kind, size))?;
        self.depth += 1;
        Ok(())
    }

    fn end_substream(&mut self) -> Result<()> {
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    fn entry(&mut self, index: usize, values: &[u64]) -> Result<()> {
        let mut text = String::new();
        for (pos, value) in values.iter().enumerate() {
            if pos > 0 {
                text.push(' ');
            }
            let _ = write!(text, "{}", value);
        }
        self.line(format_args!("{}: {}", index, text))
    }
}
