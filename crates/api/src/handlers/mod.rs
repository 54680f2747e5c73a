pub mod admin;
pub mod jobs;
pub mod system;
