pub mod analytics;
pub mod app;
pub mod session;
pub mod settings;
