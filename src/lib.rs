pub mod app;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod fetch;
pub mod semantic;
pub mod web;

#[cfg(test)]
mod tests;
