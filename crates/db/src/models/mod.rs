pub mod audit;
pub mod quota;
pub mod target;
