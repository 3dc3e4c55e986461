pub mod mapping;
pub mod relay;
