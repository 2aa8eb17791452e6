//! Configuration module for Samle.
//!
//! Handles loading and managing application settings.

mod settings;

pub use settings::{
    BatchSettings, CacheSettings, FetchSettings, GeneralSettings, Settings,
    TranslationSettings, ValidationSettings,
};
