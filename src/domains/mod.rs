pub mod message;
pub mod paths;
