pub mod app;
pub mod commands;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod env;
pub mod eval;
pub mod runtime;
pub mod serve;
pub mod validate;
