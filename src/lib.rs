pub mod automation;
pub mod command;
pub mod config;
pub mod connector;
pub mod disconnect;
pub mod error;
pub mod notice;
pub mod profile;
pub mod registry;
pub mod repository;
pub mod secret;
pub mod terminal;
pub mod version;
