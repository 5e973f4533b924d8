pub mod config;
pub mod db;
pub mod model;
pub mod normalizer;
pub mod registry;
pub mod search;
