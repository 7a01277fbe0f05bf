pub mod assoc;
pub mod config;
pub mod error;
pub mod io;
pub mod matcher;
pub mod node;
pub mod paths;
pub mod rebuild;
pub mod store;
pub mod tag;
pub mod workspace;

pub use error::{Result, TagError};
pub use matcher::{Matcher, XpathMatcher};
pub use store::TagStore;
