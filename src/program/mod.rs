//! Serialized programs.
//!
//! A program is a flat list of records `{opcode, immediate tag, payload,
//! label flag}` closed by `0xff`. Loading appends every record to one code
//! segment, so the last record becomes the entry point and execution runs
//! back towards the first.

pub mod loader;
