//! knowsync - collaborative reconciliation for git-backed knowledge directories

pub mod collab;
pub mod commands;
pub mod config;
