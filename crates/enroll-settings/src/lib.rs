//! # enroll-settings
//!
//! Configuration management with layered sources for the enroll service.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`EnrollSettings::default()`]
//! 2. **User file**: `~/.enroll/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ENROLL_*` overrides (highest priority)
//!
//! The merged result is checked with [`EnrollSettings::validate`] before use.
//!
//! ## Crate Position
//!
//! Depends on `enroll-core` for shared enums. Read by the runtime, the
//! portal client, the server and the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
///
/// Initialized either explicitly via [`init_settings`] at startup or lazily
/// on first [`get_settings`] call.
static SETTINGS: OnceLock<EnrollSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.enroll/settings.json` with env var
/// overrides. If loading or validation fails, returns compiled defaults.
pub fn get_settings() -> &'static EnrollSettings {
    SETTINGS.get_or_init(|| {
        load_settings()
            .and_then(|s| s.validate().map(|()| s))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default settings");
                EnrollSettings::default()
            })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns `Err(settings)` if they were already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: EnrollSettings) -> std::result::Result<(), EnrollSettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
