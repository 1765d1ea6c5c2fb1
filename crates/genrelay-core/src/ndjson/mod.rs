//! NDJSON handling for the Claude Code stream-json protocol.
//!
//! [`LineFramer`] turns raw stdout bytes into complete records, and the parser
//! decodes each record into canonical message types using a tolerant reader.

mod framer;
mod parser;
mod types;

pub use framer::LineFramer;
pub use parser::{parse_line, parse_value};
pub use types::*;
