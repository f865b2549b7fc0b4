//! Candidate enumeration, the size model, and the extractor (§4.9-4.10)
//! built on top of `outline-analysis`'s program-dependence graph.

pub mod candidates;
pub mod extractor;
pub mod size_model;

pub use candidates::{enumerate_candidates, type_signature_key, Candidate};
pub use extractor::{extract, mangled_name, ExtractionResult};
pub use size_model::{DefaultSizeModel, SizeModel};
