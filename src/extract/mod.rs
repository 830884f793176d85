//! Object extraction.
//!
//! Turns commit tips into structured per-file results. Nothing here treats a
//! missing path as an error; read failures come back as values so callers can
//! decide whether they are a client problem or a damaged repository.

mod lookup;
mod walk;

pub use lookup::{lookup_key, lookup_path, FileLookup, KeyLookup};
pub use walk::{walk_tips, TipFiles};

pub(crate) use lookup::locate;
