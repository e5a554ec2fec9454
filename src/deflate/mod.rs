//! Raw deflate decoding (RFC 1951) that can be paused and resumed at any
//! symbol boundary, including in the middle of a block.

mod bits;
mod huffman;
mod inflate;
mod window;

pub use bits::BitReader;
pub use huffman::Huffman;
pub use inflate::{BlockState, Inflater};
pub use window::{WINDOW_SIZE, Window};
