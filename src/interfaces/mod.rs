pub mod receivers;
pub mod security;
pub mod storage;
pub mod transport;
