//! Ephemeral, non-persisted flags shared across the application.

mod atom;

pub use atom::{Atom, AtomStore, AtomValue, AtomView};
