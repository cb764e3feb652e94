mod config;
mod teardown;
