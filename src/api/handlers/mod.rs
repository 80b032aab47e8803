pub mod system;
pub mod upload;
