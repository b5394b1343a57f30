//! Plan catalog
//!
//! Static, read-only table of entitlement tiers. Nothing mutates it at runtime.
//!
//! | Plan     | Credits   | Units/day | Downloads/day | Valid for |
//! |----------|-----------|-----------|---------------|-----------|
//! | Free     | 3         | 10        | 0             | never expires |
//! | Daily    | 35        | unlimited | unlimited     | 1 day     |
//! | Monthly  | 860       | unlimited | unlimited     | 28 days   |
//! | Premium  | unlimited | unlimited | unlimited     | 40 days   |
//! | Elite    | unlimited | unlimited | 10            | 45 days   |
//! | Superior | unlimited | unlimited | 25            | 60 days   |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Rejection;

/// Entitlement tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlanName {
    Free,
    Daily,
    Monthly,
    Premium,
    Elite,
    Superior,
}

impl PlanName {
    pub const ALL: [PlanName; 6] = [
        PlanName::Free,
        PlanName::Daily,
        PlanName::Monthly,
        PlanName::Premium,
        PlanName::Elite,
        PlanName::Superior,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanName::Free => "Free",
            PlanName::Daily => "Daily",
            PlanName::Monthly => "Monthly",
            PlanName::Premium => "Premium",
            PlanName::Elite => "Elite",
            PlanName::Superior => "Superior",
        }
    }

    /// Catalog row for this plan
    pub fn spec(&self) -> &'static PlanSpec {
        match self {
            PlanName::Free => &FREE,
            PlanName::Daily => &DAILY,
            PlanName::Monthly => &MONTHLY,
            PlanName::Premium => &PREMIUM,
            PlanName::Elite => &ELITE,
            PlanName::Superior => &SUPERIOR,
        }
    }
}

impl fmt::Display for PlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanName {
    type Err = Rejection;

    /// Case-insensitive, surrounding whitespace ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        PlanName::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Rejection::UnknownPlan(wanted.to_string()))
    }
}

/// A finite or unlimited quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Limited(u64),
    Unlimited,
}

impl Allowance {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Allowance::Unlimited)
    }

    /// Whether `used` more units still fit
    pub fn permits(&self, used: u64) -> bool {
        match self {
            Allowance::Limited(limit) => used < *limit,
            Allowance::Unlimited => true,
        }
    }
}

/// One row of the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSpec {
    pub name: PlanName,
    /// One-time credit allowance granted with the plan (when requested)
    pub credits: Allowance,
    /// Units (watches) per day
    pub daily_units: Allowance,
    /// Downloads per day
    pub daily_downloads: Allowance,
    /// `None` only for Free
    pub validity_days: Option<u32>,
}

static FREE: PlanSpec = PlanSpec {
    name: PlanName::Free,
    credits: Allowance::Limited(3),
    daily_units: Allowance::Limited(10),
    daily_downloads: Allowance::Limited(0),
    validity_days: None,
};

static DAILY: PlanSpec = PlanSpec {
    name: PlanName::Daily,
    credits: Allowance::Limited(35),
    daily_units: Allowance::Unlimited,
    daily_downloads: Allowance::Unlimited,
    validity_days: Some(1),
};

static MONTHLY: PlanSpec = PlanSpec {
    name: PlanName::Monthly,
    credits: Allowance::Limited(860),
    daily_units: Allowance::Unlimited,
    daily_downloads: Allowance::Unlimited,
    validity_days: Some(28),
};

static PREMIUM: PlanSpec = PlanSpec {
    name: PlanName::Premium,
    credits: Allowance::Unlimited,
    daily_units: Allowance::Unlimited,
    daily_downloads: Allowance::Unlimited,
    validity_days: Some(40),
};

static ELITE: PlanSpec = PlanSpec {
    name: PlanName::Elite,
    credits: Allowance::Unlimited,
    daily_units: Allowance::Unlimited,
    daily_downloads: Allowance::Limited(10),
    validity_days: Some(45),
};

static SUPERIOR: PlanSpec = PlanSpec {
    name: PlanName::Superior,
    credits: Allowance::Unlimited,
    daily_units: Allowance::Unlimited,
    daily_downloads: Allowance::Limited(25),
    validity_days: Some(60),
};

/// Gated per-use actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Watch,
    Download,
}

impl Action {
    /// Credits charged on finite-credit plans
    pub fn credit_cost(&self) -> u64 {
        match self {
            Action::Watch => 1,
            Action::Download => 1,
        }
    }
}
