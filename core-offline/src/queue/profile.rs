//! Inter-task pacing

use core_runtime::config::PlatformClass;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pause inserted between downloads so foreground work is not starved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundProfile {
    /// 1500 ms between tasks.
    Conservative,
    /// 500 ms between tasks.
    Balanced,
    /// 100 ms between tasks.
    Aggressive,
}

impl BackgroundProfile {
    pub fn for_platform(platform: PlatformClass) -> Self {
        match platform {
            PlatformClass::Mobile => BackgroundProfile::Conservative,
            PlatformClass::Web => BackgroundProfile::Balanced,
            PlatformClass::Desktop => BackgroundProfile::Aggressive,
        }
    }

    pub fn pause(&self) -> Duration {
        match self {
            BackgroundProfile::Conservative => Duration::from_millis(1500),
            BackgroundProfile::Balanced => Duration::from_millis(500),
            BackgroundProfile::Aggressive => Duration::from_millis(100),
        }
    }

    /// Returns a human-readable description of the profile.
    pub fn description(&self) -> &'static str {
        match self {
            BackgroundProfile::Conservative => "Long pauses, suited to battery-powered devices",
            BackgroundProfile::Balanced => "Moderate pauses, suited to browsers",
            BackgroundProfile::Aggressive => "Short pauses, suited to desktops",
        }
    }
}
