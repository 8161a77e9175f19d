mod board;
mod verdict;

pub use board::*;
pub use verdict::*;
