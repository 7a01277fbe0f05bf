pub mod nodes;
pub mod rebuilds;
pub mod tags;
