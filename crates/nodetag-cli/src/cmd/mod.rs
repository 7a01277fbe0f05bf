pub mod config;
pub mod init;
pub mod node;
pub mod rebuild;
pub mod serve;
pub mod tag;
