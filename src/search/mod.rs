mod index;

pub use index::{LexicalIndex, LexicalMatch, SearchError};
