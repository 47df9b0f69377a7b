//! ESI engine (§4.4): fetch-side parser producing a binary opcode program, deliver-side
//! interpreter executing it, with gzip re-stitching and async re-embark on include.
pub mod deliver;
pub mod parser;

pub use deliver::{deliver, Deliverer, EsiDeliverError};
pub use parser::parse;
