pub mod evaluator;
pub mod expander;
pub mod format;
pub mod images;
pub mod literal;
pub mod loops;
pub mod permissions;
pub mod text;

pub use evaluator::Evaluator;
pub use text::{Rendered, TextMode};
