//! TUI module for terminal user interfaces

mod link_checker;

pub use link_checker::LinkCheckerApp;
