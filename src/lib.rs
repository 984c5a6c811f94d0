pub mod config;
pub mod context;
pub mod discovery;
pub mod resource;
pub mod schema;
pub mod store;
pub mod sync;
pub mod value;
