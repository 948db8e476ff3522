
pub mod batch;
pub mod command;
pub mod config;
pub mod convert;
pub mod ctf;
pub mod logging;
pub mod mrc;
pub mod protocols;
pub mod star;
pub mod tool;
