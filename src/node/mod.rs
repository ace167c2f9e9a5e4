//! The configuration tree: nodes and the values they hold.

mod node;
mod value;

pub use node::{
    is_reserved, Node, Root, RootRef, DATA_KEY, DEBUG_MODE_KEY, RESERVED_KEYS, ROOT_KEY,
    TYPE_HINTS_KEY,
};
pub use value::Value;
