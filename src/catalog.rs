//! Plan catalog and core domain types.
//!
//! The catalog is a read-only lookup of plan definitions keyed by plan id
//! and filterable by user type and country. Plans are loaded from TOML at
//! startup and validated once; nothing in the engine mutates them.

use std::fmt;

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Maximum length of a plan identifier.
const MAX_PLAN_ID_LENGTH: usize = 64;

/// Currency used when neither the plan nor the engine configuration
/// names one. The platform's home market bills in rupees.
pub const DEFAULT_CURRENCY: &str = "INR";

/// Role a billing identity belongs to.
///
/// Plans are segmented by role; a user can hold identities for more than
/// one role at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// Startup founder account.
    Startup,
    /// Investor account.
    Investor,
    /// Mentor account.
    Mentor,
    /// Advisor account.
    Advisor,
}

impl UserType {
    /// Returns the wire-format name of this role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Investor => "investor",
            Self::Mentor => "mentor",
            Self::Advisor => "advisor",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier of a subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// Entry tier.
    Basic,
    /// Standard paid tier.
    Pro,
    /// Top tier.
    Premium,
}

impl PlanTier {
    /// Returns the wire-format name of this tier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing interval of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Billed every calendar month.
    Monthly,
    /// Billed every calendar year.
    Yearly,
}

impl BillingInterval {
    /// Returns the wire-format name of this interval.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Number of calendar months covered by one billing period.
    #[must_use]
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Yearly => 12,
        }
    }

    /// Advances a timestamp by one billing period.
    ///
    /// Month arithmetic clamps to the last valid day, so a period starting
    /// on January 31 ends on February 28 (or 29).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if the resulting date would
    /// overflow the calendar range.
    pub fn advance(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        from.checked_add_months(Months::new(self.months()))
            .ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "billing period starting at {from} overflows the calendar"
                ))
            })
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated plan identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(String);

impl PlanId {
    /// Creates a new plan id after validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] if the id is empty, longer
    /// than 64 characters, or contains characters outside
    /// `[A-Za-z0-9_-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(EngineError::InvalidInput(
                "plan id cannot be empty".to_string(),
            ));
        }

        if id.len() > MAX_PLAN_ID_LENGTH {
            return Err(EngineError::InvalidInput(format!(
                "plan id exceeds maximum length of {MAX_PLAN_ID_LENGTH} characters"
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EngineError::InvalidInput(format!(
                "plan id '{id}' contains invalid characters (allowed: alphanumeric, '_', '-')"
            )));
        }

        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscription plan definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    /// Unique plan identifier.
    pub id: PlanId,

    /// Human-readable plan name, shown on the payment surface.
    pub name: String,

    /// Role this plan is sold to.
    pub user_type: UserType,

    /// Plan tier.
    pub tier: PlanTier,

    /// Price per billing period before discount and tax.
    pub base_price: Decimal,

    /// ISO 4217 currency this plan is priced in, or `None` to use the
    /// engine's configured default currency.
    #[serde(default)]
    pub currency: Option<String>,

    /// Tax percentage applied on the discounted base price.
    #[serde(default = "default_tax_percentage")]
    pub tax_percentage: Decimal,

    /// Billing interval.
    pub interval: BillingInterval,

    /// ISO 3166-1 alpha-2 country this plan is scoped to, or `None` for a
    /// globally available plan.
    #[serde(default)]
    pub country: Option<String>,

    /// Whether the plan can currently be purchased.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl SubscriptionPlan {
    /// Whether this plan is purchasable from the given country.
    #[must_use]
    pub fn available_in(&self, country: Option<&str>) -> bool {
        match (&self.country, country) {
            (None, _) => true,
            (Some(scoped), Some(requested)) => scoped.eq_ignore_ascii_case(requested),
            (Some(_), None) => false,
        }
    }

    /// The currency this plan bills in, falling back to the caller's
    /// default when the plan does not name one.
    #[must_use]
    pub fn currency_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.currency.as_deref().unwrap_or(fallback)
    }
}

fn default_tax_percentage() -> Decimal {
    Decimal::from(18)
}

fn default_active() -> bool {
    true
}

/// Read-only catalog of subscription plans.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanCatalog {
    plans: Vec<SubscriptionPlan>,
}

impl PlanCatalog {
    /// Builds a catalog from a list of plans, validating them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] on duplicate plan ids, negative
    /// prices, or tax percentages outside 0..=100.
    pub fn new(plans: Vec<SubscriptionPlan>) -> Result<Self> {
        let catalog = Self { plans };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parses a catalog from a TOML document with a `[[plans]]` array.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the TOML is malformed or any
    /// plan fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let catalog: Self = toml::from_str(toml_str)
            .map_err(|e| EngineError::Config(format!("plan catalog parse error: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for plan in &self.plans {
            if !seen.insert(plan.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate plan id '{}' in catalog",
                    plan.id
                )));
            }

            if plan.base_price.is_sign_negative() {
                return Err(EngineError::Config(format!(
                    "plan '{}' has a negative base price",
                    plan.id
                )));
            }

            if plan.tax_percentage.is_sign_negative() || plan.tax_percentage > Decimal::from(100) {
                return Err(EngineError::Config(format!(
                    "plan '{}' has a tax percentage outside 0..=100",
                    plan.id
                )));
            }

            if let Some(currency) = &plan.currency
                && (currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()))
            {
                return Err(EngineError::Config(format!(
                    "plan '{}' has an invalid currency code '{currency}' (expected 3 uppercase letters)",
                    plan.id
                )));
            }
        }
        Ok(())
    }

    /// Looks up a plan by id.
    #[must_use]
    pub fn get(&self, id: &PlanId) -> Option<&SubscriptionPlan> {
        self.plans.iter().find(|p| &p.id == id)
    }

    /// Returns the active plans available to a role from a country.
    ///
    /// Country-scoped plans are included only on an exact country match;
    /// global plans are always included.
    #[must_use]
    pub fn plans_for(&self, user_type: UserType, country: Option<&str>) -> Vec<&SubscriptionPlan> {
        self.plans
            .iter()
            .filter(|p| p.active && p.user_type == user_type && p.available_in(country))
            .collect()
    }

    /// Finds the best plan for a role, tier and interval from a country.
    ///
    /// A country-scoped match is preferred over a global one.
    #[must_use]
    pub fn find(
        &self,
        user_type: UserType,
        tier: PlanTier,
        interval: BillingInterval,
        country: Option<&str>,
    ) -> Option<&SubscriptionPlan> {
        let candidates: Vec<&SubscriptionPlan> = self
            .plans_for(user_type, country)
            .into_iter()
            .filter(|p| p.tier == tier && p.interval == interval)
            .collect();

        candidates
            .iter()
            .find(|p| p.country.is_some())
            .or_else(|| candidates.first())
            .copied()
    }

    /// Number of plans in the catalog, including inactive ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Whether the catalog holds no plans.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_catalog_toml() -> &'static str {
        r#"
            [[plans]]
            id = "startup-pro-monthly-in"
            name = "Startup Pro"
            user_type = "startup"
            tier = "pro"
            base_price = "100.00"
            currency = "INR"
            tax_percentage = "18"
            interval = "monthly"
            country = "IN"

            [[plans]]
            id = "startup-pro-monthly"
            name = "Startup Pro (Global)"
            user_type = "startup"
            tier = "pro"
            base_price = "120.00"
            interval = "monthly"

            [[plans]]
            id = "investor-premium-yearly"
            name = "Investor Premium"
            user_type = "investor"
            tier = "premium"
            base_price = "1000.00"
            interval = "yearly"

            [[plans]]
            id = "startup-basic-retired"
            name = "Startup Basic (Retired)"
            user_type = "startup"
            tier = "basic"
            base_price = "50.00"
            interval = "monthly"
            active = false
        "#
    }

    // ===== Plan id validation =====

    #[test]
    fn test_plan_id_accepts_valid_formats() {
        assert!(PlanId::new("startup-pro-monthly").is_ok());
        assert!(PlanId::new("plan_01").is_ok());
        assert!(PlanId::new("P").is_ok());
    }

    #[test]
    fn test_plan_id_rejects_empty() {
        let error = PlanId::new("").unwrap_err();
        assert!(error.to_string().contains("empty"));
    }

    #[test]
    fn test_plan_id_rejects_overlong() {
        let error = PlanId::new("x".repeat(65)).unwrap_err();
        assert!(error.to_string().contains("maximum length"));
    }

    #[test]
    fn test_plan_id_rejects_invalid_characters() {
        assert!(PlanId::new("plan with spaces").is_err());
        assert!(PlanId::new("plan/slash").is_err());
        assert!(PlanId::new("plan.dot").is_err());
    }

    // ===== Interval arithmetic =====

    #[test]
    fn test_monthly_advance() {
        let from = Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap();
        let until = BillingInterval::Monthly.advance(from).unwrap();
        assert_eq!(until, Utc.with_ymd_and_hms(2026, 4, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_yearly_advance() {
        let from = Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap();
        let until = BillingInterval::Yearly.advance(from).unwrap();
        assert_eq!(until, Utc.with_ymd_and_hms(2027, 3, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_advance_clamps_to_month_end() {
        let from = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        let until = BillingInterval::Monthly.advance(from).unwrap();
        assert_eq!(until, Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap());
    }

    // ===== Catalog lookup =====

    #[test]
    fn test_catalog_parses_from_toml() {
        let catalog = PlanCatalog::from_toml(sample_catalog_toml()).unwrap();
        assert_eq!(catalog.len(), 4);

        let id = PlanId::new("startup-pro-monthly-in").unwrap();
        let plan = catalog.get(&id).unwrap();
        assert_eq!(plan.base_price, Decimal::new(10000, 2));
        assert_eq!(plan.currency.as_deref(), Some("INR"));
        assert_eq!(plan.tax_percentage, Decimal::from(18));
        assert_eq!(plan.interval, BillingInterval::Monthly);

        let global = catalog.get(&PlanId::new("startup-pro-monthly").unwrap()).unwrap();
        assert!(global.currency.is_none());
    }

    #[test]
    fn test_plans_for_filters_role_country_and_active() {
        let catalog = PlanCatalog::from_toml(sample_catalog_toml()).unwrap();

        let from_india = catalog.plans_for(UserType::Startup, Some("IN"));
        assert_eq!(from_india.len(), 2);

        let from_us = catalog.plans_for(UserType::Startup, Some("US"));
        assert_eq!(from_us.len(), 1);
        assert_eq!(from_us[0].id.as_str(), "startup-pro-monthly");

        // Retired plan never shows up.
        assert!(
            from_india
                .iter()
                .all(|p| p.id.as_str() != "startup-basic-retired")
        );
    }

    #[test]
    fn test_find_prefers_country_scoped_plan() {
        let catalog = PlanCatalog::from_toml(sample_catalog_toml()).unwrap();

        let plan = catalog
            .find(
                UserType::Startup,
                PlanTier::Pro,
                BillingInterval::Monthly,
                Some("IN"),
            )
            .unwrap();
        assert_eq!(plan.id.as_str(), "startup-pro-monthly-in");

        let plan = catalog
            .find(
                UserType::Startup,
                PlanTier::Pro,
                BillingInterval::Monthly,
                Some("DE"),
            )
            .unwrap();
        assert_eq!(plan.id.as_str(), "startup-pro-monthly");
    }

    #[test]
    fn test_duplicate_plan_id_rejected() {
        let toml_str = r#"
            [[plans]]
            id = "dup"
            name = "A"
            user_type = "startup"
            tier = "pro"
            base_price = "10.00"
            interval = "monthly"

            [[plans]]
            id = "dup"
            name = "B"
            user_type = "startup"
            tier = "pro"
            base_price = "20.00"
            interval = "monthly"
        "#;

        let error = PlanCatalog::from_toml(toml_str).unwrap_err();
        assert!(error.to_string().contains("duplicate plan id"));
    }

    #[test]
    fn test_negative_price_rejected() {
        let toml_str = r#"
            [[plans]]
            id = "negative"
            name = "Broken"
            user_type = "startup"
            tier = "pro"
            base_price = "-5.00"
            interval = "monthly"
        "#;

        let error = PlanCatalog::from_toml(toml_str).unwrap_err();
        assert!(error.to_string().contains("negative base price"));
    }

    #[test]
    fn test_malformed_currency_rejected() {
        let toml_str = r#"
            [[plans]]
            id = "bad-currency"
            name = "Broken"
            user_type = "startup"
            tier = "pro"
            base_price = "10.00"
            currency = "rupees"
            interval = "monthly"
        "#;

        let error = PlanCatalog::from_toml(toml_str).unwrap_err();
        assert!(error.to_string().contains("invalid currency code"));
    }
}
