pub mod backup;
pub mod core;
pub mod maintenance;
pub mod records;
pub mod settings;
