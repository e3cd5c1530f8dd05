pub mod config;
pub mod credentials;
pub mod db;
pub mod logging;
pub mod providers;
pub mod query_tool;
