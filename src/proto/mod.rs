//! The HTTP/1.1 wire layer: request serialization, incremental response
//! parsing, and content decoding.

pub(crate) mod decode;
pub(crate) mod parse;
pub(crate) mod serialize;
