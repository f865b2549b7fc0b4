//! Content-addressed data model shared by every other crate in the
//! workspace: multibase text codecs, content identifiers, the `Node`
//! value tree and its CBOR/JSON codecs, and the URI/Name namespace used
//! to address blocks, heads, and memoized calls.

pub mod cid;
pub mod multibase;
pub mod name;
pub mod node;
pub mod uri;

pub use cid::{Cid, CidError, ContentCodec, HashCodec};
pub use multibase::{Base, MultibaseError};
pub use name::{Call, Name};
pub use node::{Kind, Node, NodeError};
pub use uri::Uri;
