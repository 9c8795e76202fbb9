//! # ember-core
//! Foundation types, chain presets, and collaborator traits for Ember.

pub mod chain;
pub mod coins;
pub mod compact;
pub mod constants;
pub mod error;
pub mod invalid;
pub mod mempool;
pub mod merkle;
pub mod params;
pub mod script;
pub mod traits;
pub mod types;
