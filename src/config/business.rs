// src/config/business.rs
// Hours, pricing and scope rules enforced by the business-rules engine (C7).

use serde::{Deserialize, Serialize};

/// A single open window, in local (configured-timezone) minutes-since-midnight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl HourWindow {
    fn new(start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> Self {
        Self {
            start_minute: start_h * 60 + start_m,
            end_minute: end_h * 60 + end_m,
        }
    }

    pub fn contains(&self, minute_of_day: u32) -> bool {
        minute_of_day >= self.start_minute && minute_of_day < self.end_minute
    }

    /// A window spanning the whole day, used by tests that don't want to
    /// depend on wall-clock time to exercise the hours gate.
    pub fn full_day() -> Self {
        Self {
            start_minute: 0,
            end_minute: 24 * 60,
        }
    }
}

/// Weekday 08:00-12:00 / 14:00-17:00, no weekends, per spec §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    pub timezone: String,
    pub windows: Vec<HourWindow>,
}

impl BusinessHoursConfig {
    pub fn from_env() -> Self {
        Self {
            timezone: super::helpers::env_or("RECEPTIONIST_TIMEZONE", "America/Sao_Paulo"),
            windows: vec![
                HourWindow::new(8, 0, 12, 0),
                HourWindow::new(14, 0, 17, 0),
            ],
        }
    }
}

/// The only valid pricing statement: "mensalidade R$ 375" + one-time "material R$ 100".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub monthly_amount: String,
    pub material_amount: String,
}

impl PricingConfig {
    pub fn from_env() -> Self {
        Self {
            monthly_amount: super::helpers::env_or("RECEPTIONIST_MONTHLY_PRICE", "R$ 375"),
            material_amount: super::helpers::env_or("RECEPTIONIST_MATERIAL_PRICE", "R$ 100"),
        }
    }
}

/// Topics the assistant is allowed to discuss, per spec §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub allowed_topics: Vec<String>,
}

impl ScopeConfig {
    pub fn from_env() -> Self {
        Self {
            allowed_topics: vec![
                "greeting".into(),
                "qualification".into(),
                "method".into(),
                "pricing".into(),
                "scheduling".into(),
                "confirmation".into(),
                "handoff".into(),
            ],
        }
    }
}
