pub mod accounts;
pub mod blockcount;
pub mod config;
pub mod db;
pub mod email;
pub mod migrations;
pub mod server;
