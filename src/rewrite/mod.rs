//! Request path and response body rewriting.

mod body;
mod path;
mod substitution;

pub use body::{LineRewriter, RewriteBody};
pub use path::{matches_bind_path, rewrite_path};
pub use substitution::SubstitutionPair;
