use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Provisioning,
    Active,
    Suspended,
    Deactivated,
    Migrating,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Deactivated => "deactivated",
            Self::Migrating => "migrating",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "provisioning" => Some(Self::Provisioning),
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "deactivated" => Some(Self::Deactivated),
            "migrating" => Some(Self::Migrating),
            _ => None,
        }
    }

    /// Whether requests for a tenant in this status may proceed past routing.
    pub fn admission(&self) -> Admission {
        match self {
            Self::Active => Admission::Admitted,
            Self::Provisioning | Self::Migrating => Admission::TemporarilyUnavailable,
            Self::Suspended | Self::Deactivated => Admission::Unavailable,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    TemporarilyUnavailable,
    Unavailable,
}

/// Operations the platform knows how to host. Anything else is treated as disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    InsuranceVerification,
    MedicalCoding,
    ClaimsGeneration,
    ClaimsStatusTracking,
    DenialManagement,
    PaymentPosting,
    PatientIntake,
    SmartScheduling,
    ClinicalDocumentation,
    LabResultsProcessing,
    AppointmentReminders,
    ReferralManagement,
    CarePlanManagement,
    AiHealthAdvisor,
    Triage,
    PrescriptionManagement,
}

impl OperationKind {
    pub const ALL: [OperationKind; 16] = [
        Self::InsuranceVerification,
        Self::MedicalCoding,
        Self::ClaimsGeneration,
        Self::ClaimsStatusTracking,
        Self::DenialManagement,
        Self::PaymentPosting,
        Self::PatientIntake,
        Self::SmartScheduling,
        Self::ClinicalDocumentation,
        Self::LabResultsProcessing,
        Self::AppointmentReminders,
        Self::ReferralManagement,
        Self::CarePlanManagement,
        Self::AiHealthAdvisor,
        Self::Triage,
        Self::PrescriptionManagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsuranceVerification => "insurance_verification",
            Self::MedicalCoding => "medical_coding",
            Self::ClaimsGeneration => "claims_generation",
            Self::ClaimsStatusTracking => "claims_status_tracking",
            Self::DenialManagement => "denial_management",
            Self::PaymentPosting => "payment_posting",
            Self::PatientIntake => "patient_intake",
            Self::SmartScheduling => "smart_scheduling",
            Self::ClinicalDocumentation => "clinical_documentation",
            Self::LabResultsProcessing => "lab_results_processing",
            Self::AppointmentReminders => "appointment_reminders",
            Self::ReferralManagement => "referral_management",
            Self::CarePlanManagement => "care_plan_management",
            Self::AiHealthAdvisor => "ai_health_advisor",
            Self::Triage => "triage",
            Self::PrescriptionManagement => "prescription_management",
        }
    }

    /// Accepts both `snake_case` and the `kebab-case` form used in route paths.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|kind| kind.as_str() == normalized)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored as a plain name → flag object; names this build does not know are dropped on load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, bool>", into = "BTreeMap<String, bool>")]
pub struct FeatureMap {
    operations: BTreeMap<OperationKind, bool>,
}

impl From<BTreeMap<String, bool>> for FeatureMap {
    fn from(raw: BTreeMap<String, bool>) -> Self {
        let operations = raw
            .into_iter()
            .filter_map(|(name, enabled)| OperationKind::parse(&name).map(|kind| (kind, enabled)))
            .collect();
        Self { operations }
    }
}

impl From<FeatureMap> for BTreeMap<String, bool> {
    fn from(features: FeatureMap) -> Self {
        features
            .operations
            .into_iter()
            .map(|(kind, enabled)| (kind.as_str().to_owned(), enabled))
            .collect()
    }
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known operation switched on; the provisioning default.
    pub fn all_enabled() -> Self {
        Self { operations: OperationKind::ALL.into_iter().map(|kind| (kind, true)).collect() }
    }

    pub fn with(mut self, kind: OperationKind, enabled: bool) -> Self {
        self.set(kind, enabled);
        self
    }

    pub fn set(&mut self, kind: OperationKind, enabled: bool) {
        self.operations.insert(kind, enabled);
    }

    pub fn is_enabled(&self, kind: OperationKind) -> bool {
        self.operations.get(&kind).copied().unwrap_or(false)
    }

    /// Lookup by raw name. Unknown names are disabled rather than an error.
    pub fn is_enabled_by_name(&self, name: &str) -> bool {
        OperationKind::parse(name).map(|kind| self.is_enabled(kind)).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperationKind, bool)> + '_ {
        self.operations.iter().map(|(kind, enabled)| (*kind, *enabled))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub operation_count: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub subdomain: String,
    pub primary_domain: Option<String>,
    pub status: TenantStatus,
    pub status_reason: Option<String>,
    /// Name of the isolated store owned by this tenant. Never shared.
    pub database_name: String,
    pub features: FeatureMap,
    pub usage: TenantUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// A freshly provisioned tenant with every operation enabled and `database_name`
    /// derived from `database_prefix` and the id.
    pub fn provisioned(
        id: impl Into<String>,
        name: impl Into<String>,
        subdomain: impl Into<String>,
        database_prefix: &str,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            database_name: format!("{database_prefix}{id}"),
            id: TenantId(id),
            name: name.into(),
            subdomain: subdomain.into().to_ascii_lowercase(),
            primary_domain: None,
            status: TenantStatus::Provisioning,
            status_reason: None,
            features: FeatureMap::all_enabled(),
            usage: TenantUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: TenantStatus, reason: Option<&str>) -> Self {
        self.status = status;
        self.status_reason = reason.map(str::to_owned);
        self
    }

    pub fn with_primary_domain(mut self, domain: impl Into<String>) -> Self {
        self.primary_domain = Some(domain.into().to_ascii_lowercase());
        self
    }

    pub fn with_features(mut self, features: FeatureMap) -> Self {
        self.features = features;
        self
    }
}
