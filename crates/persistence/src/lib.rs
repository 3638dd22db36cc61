#![deny(warnings)]

//! Local player options: sound, music, autosave and number display.
//!
//! These are opaque to the progression engine. The CLI reads the autosave
//! toggle to configure the session and the number format to print amounts.
//! Stored as a small JSON document with camelCase keys, e.g.
//! `{"sound":true,"music":true,"autoSave":true,"animations":true,"numberFormat":"standard"}`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// How amounts are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberFormat {
    /// `1.50K`, `2.00M`, `3.10B`, `4.00T`.
    #[default]
    Standard,
    /// `1.50e3`.
    Scientific,
    /// `1500`.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub sound: bool,
    pub music: bool,
    pub auto_save: bool,
    pub animations: bool,
    pub number_format: NumberFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sound: true,
            music: true,
            auto_save: true,
            animations: true,
            number_format: NumberFormat::Standard,
        }
    }
}

/// Errors reading or writing the settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Filesystem failure other than a missing file.
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    /// File exists but is not a settings document.
    #[error("malformed settings: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Returns the default location of the options file.
pub fn default_settings_path() -> PathBuf {
    PathBuf::from("./saves/options.json")
}

impl Settings {
    pub fn from_json_str(text: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_string(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, SettingsError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_json_str(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write settings to `path`, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, self.to_json_string()?).await?;
        debug!(path = %path.display(), "settings saved");
        Ok(())
    }
}

const SUFFIXES: [(u32, &str); 4] = [(12, "T"), (9, "B"), (6, "M"), (3, "K")];

fn pow10(exp: u32) -> Decimal {
    Decimal::from_i128_with_scale(10i128.pow(exp), 0)
}

fn fixed(amount: Decimal, dp: u32) -> String {
    let rounded = amount.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.*}", dp as usize, rounded)
}

fn scientific(amount: Decimal) -> String {
    let digits = amount.trunc().abs().to_string().len();
    let mut exp = u32::try_from(digits.saturating_sub(1)).unwrap_or(0);
    let mut mantissa = (amount / pow10(exp))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    if mantissa.abs() >= Decimal::TEN {
        mantissa = (mantissa / Decimal::TEN)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        exp += 1;
    }
    format!("{:.2}e{}", mantissa, exp)
}

/// Render an amount for display.
///
/// Example:
/// assert_eq!(format_amount(Decimal::new(1500, 0), NumberFormat::Standard), "1.50K");
pub fn format_amount(amount: Decimal, format: NumberFormat) -> String {
    let thousand = pow10(3);
    if amount.abs() < thousand {
        return fixed(amount, 1);
    }
    match format {
        NumberFormat::Standard => {
            for (exp, suffix) in SUFFIXES {
                let unit = pow10(exp);
                if amount.abs() >= unit {
                    return format!("{}{}", fixed(amount / unit, 2), suffix);
                }
            }
            fixed(amount, 1)
        }
        NumberFormat::Scientific => scientific(amount),
        NumberFormat::Full => fixed(amount, 0),
    }
}
