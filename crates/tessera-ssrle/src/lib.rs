//! Succinct run-length symbol sequences (SSRLE).
//!
//! This crate provides:
//! - `RunTraits`: code-word geometry for 1, 2, 4 and 8 bits per symbol
//! - `SsrleRun`: pattern runs with split, insert, merge, rank and select
//! - The code-unit codec and the 64-byte segment writer/reader

pub mod codec;
pub mod run;
pub mod traits;

pub use codec::{
    RunReader, SegmentWriter, decode_run, decode_segment, encode_run, encoded_units, read_runs,
    write_segments_to,
};
pub use run::{RunSplit, SsrleRun, SymbolCmp, compactify_runs, total_length};
pub use traits::{
    CODE_UNIT_BITS, MAX_CODE_UNITS, RunTraits, SEGMENT_SIZE, SEGMENT_UNITS, SIZE_SELECTOR_BITS,
};
