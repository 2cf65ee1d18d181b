pub mod keys;
pub mod pptx;
pub mod xlsx;
