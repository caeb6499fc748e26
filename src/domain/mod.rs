pub mod keyboard;
pub mod models;
pub mod settings;
