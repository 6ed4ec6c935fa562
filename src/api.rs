pub mod data;
pub mod hello;
pub mod relay;
pub mod version;
