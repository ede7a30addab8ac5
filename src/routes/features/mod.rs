pub mod assembler;
pub mod cache;
pub mod catalog;
pub mod environment;
pub mod geotiff;
pub mod indices;
pub mod models;
pub mod pipeline;
mod retry;
pub mod views;
