pub mod app;
pub mod audit;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod layout;
pub mod output;
pub mod records;
pub mod report;
pub mod store;
pub mod tables;
