//! Core types for scratchpool
//!
//! Defines the typed records exchanged with the remote store:
//! - [`ResourceInfo`]: one pool slot's lifecycle record
//! - [`ActiveResource`]: the live environment linked to a slot
//! - [`AllocatedHandle`]: connection details handed to a caller
//!
//! Remote rows are validated here; malformed rows are rejected with
//! [`PoolError::MalformedRecord`] instead of flowing on as untyped maps.

use crate::error::PoolError;
use crate::remote::Record;
use crate::schema::{self, field};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Remote record identifier (15 or 18 alphanumeric characters)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Parse and validate an identifier
    ///
    /// # Errors
    /// Returns the rejected input if it is not 15 or 18 ASCII alphanumerics.
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        let valid_len = raw.len() == 15 || raw.len() == 18;
        if valid_len && raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(raw))
        } else {
            Err(raw)
        }
    }

    /// The case-sensitive 15-character form
    #[inline]
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..15]
    }

    /// Raw identifier
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether two ids name the same record, regardless of 15/18-char form
    #[inline]
    #[must_use]
    pub fn same_record(&self, other: &RecordId) -> bool {
        self.short() == other.short()
    }
}

impl TryFrom<String> for RecordId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value).map_err(|raw| format!("invalid record id: {raw:?}"))
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provisioning request identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Ulid);

impl RequestId {
    /// Generate new request ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Created, not yet confirmed live
    New,
    /// Live and usable
    Active,
    /// Retired (terminal)
    Deleted,
    /// Created but post-create steps failed; never handed out
    Error,
}

impl ResourceStatus {
    /// Wire value
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Active => "Active",
            Self::Deleted => "Deleted",
            Self::Error => "Error",
        }
    }

    /// Parse a wire value
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "New" => Some(Self::New),
            "Active" => Some(Self::Active),
            "Deleted" => Some(Self::Deleted),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Deleted is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// Allocation state of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AllocationStatus {
    /// Free to claim (also the state of records with no allocation value)
    #[default]
    Unassigned,
    /// Claimed by a requester
    Assigned,
    /// Being prepared; not claimable
    InProgress,
}

impl AllocationStatus {
    /// Wire value
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "Unassigned",
            Self::Assigned => "Assigned",
            Self::InProgress => "In Progress",
        }
    }

    /// Parse a wire value; a missing value means Unassigned
    #[must_use]
    pub fn from_wire(s: Option<&str>) -> Option<Self> {
        match s {
            None | Some("" | "Unassigned" | "Available") => Some(Self::Unassigned),
            Some("Assigned") => Some(Self::Assigned),
            Some("In Progress" | "InProgress") => Some(Self::InProgress),
            Some(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedByRow {
    #[serde(rename = "Username", default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceInfoRow {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "ScratchOrg", default)]
    remote_id: Option<String>,
    #[serde(rename = "Pooltag__c", default)]
    tag: Option<String>,
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "Allocation_status__c", default)]
    allocation: Option<String>,
    #[serde(rename = "CreatedDate", default)]
    created_date: Option<String>,
    #[serde(rename = "LastModifiedDate", default)]
    last_modified: Option<String>,
    #[serde(rename = "ExpirationDate", default)]
    expiration_date: Option<String>,
    #[serde(rename = "SignupUsername", default)]
    signup_username: Option<String>,
    #[serde(rename = "SignupEmail", default)]
    signup_email: Option<String>,
    #[serde(rename = "LoginUrl", default)]
    login_url: Option<String>,
    #[serde(rename = "Password__c", default)]
    password: Option<String>,
    #[serde(rename = "Assignee__c", default)]
    assignee: Option<String>,
    #[serde(rename = "ConnectionAlias__c", default)]
    alias: Option<String>,
    #[serde(rename = "CreatedBy", default)]
    created_by: Option<CreatedByRow>,
}

/// One pool slot's lifecycle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    /// ResourceInfo record id
    pub id: RecordId,
    /// External environment id, known once the environment is live
    pub remote_resource_id: Option<RecordId>,
    /// Pool tag
    pub tag: Option<String>,
    /// Lifecycle status
    pub status: ResourceStatus,
    /// Allocation status
    pub allocation_status: AllocationStatus,
    /// Creation timestamp (FIFO ordering key)
    pub created_date: DateTime<Utc>,
    /// Last write timestamp, used as the claim precondition
    pub last_modified: Option<DateTime<Utc>>,
    /// Expiration date, fixed at creation
    pub expiration_date: Option<NaiveDate>,
    /// Environment admin username
    pub signup_username: Option<String>,
    /// Environment admin email
    pub signup_email: Option<String>,
    /// Login URL
    pub login_url: Option<String>,
    /// Generated credential
    pub generated_credential: Option<String>,
    /// Username of the pool owner who created the slot
    pub owner_username: Option<String>,
    /// Requester that claimed the slot
    pub assignee: Option<String>,
    /// Alias given at provisioning time
    pub alias: Option<String>,
}

impl ResourceInfo {
    /// Validate a remote row
    ///
    /// # Errors
    /// `PoolError::MalformedRecord` if required fields are missing or invalid.
    pub fn from_record(record: &Record) -> Result<Self, PoolError> {
        let malformed = |reason: String| PoolError::malformed(schema::RESOURCE_INFO, reason);

        let row: ResourceInfoRow = serde_json::from_value(serde_json::Value::Object(record.clone()))
            .map_err(|e| malformed(e.to_string()))?;

        let id = RecordId::parse(row.id).map_err(|raw| malformed(format!("bad Id {raw:?}")))?;

        let remote_resource_id = match row.remote_id {
            Some(raw) => Some(
                RecordId::parse(raw)
                    .map_err(|raw| malformed(format!("bad {} {raw:?}", field::REMOTE_ID)))?,
            ),
            None => None,
        };

        let status = row
            .status
            .as_deref()
            .and_then(ResourceStatus::from_wire)
            .ok_or_else(|| malformed(format!("record {id}: unknown status {:?}", row.status)))?;

        let allocation_status = AllocationStatus::from_wire(row.allocation.as_deref())
            .ok_or_else(|| {
                malformed(format!("record {id}: unknown allocation {:?}", row.allocation))
            })?;

        let created_date = row
            .created_date
            .as_deref()
            .and_then(schema::parse_datetime)
            .ok_or_else(|| malformed(format!("record {id}: missing or bad CreatedDate")))?;

        let expiration_date = match row.expiration_date.as_deref() {
            Some(raw) => Some(
                schema::parse_date(raw)
                    .ok_or_else(|| malformed(format!("record {id}: bad ExpirationDate {raw:?}")))?,
            ),
            None => None,
        };

        Ok(Self {
            id,
            remote_resource_id,
            tag: row.tag,
            status,
            allocation_status,
            created_date,
            last_modified: row.last_modified.as_deref().and_then(schema::parse_datetime),
            expiration_date,
            signup_username: row.signup_username,
            signup_email: row.signup_email,
            login_url: row.login_url,
            generated_credential: row.password,
            owner_username: row.created_by.and_then(|c| c.username),
            assignee: row.assignee,
            alias: row.alias,
        })
    }

    /// Whether the slot has expired as of `today`
    #[inline]
    #[must_use]
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiration_date.is_some_and(|d| d < today)
    }

    /// Whether the slot could be handed to a caller
    #[must_use]
    pub fn is_claimable(&self, today: NaiveDate) -> bool {
        self.status == ResourceStatus::Active
            && self.allocation_status == AllocationStatus::Unassigned
            && !self.is_expired(today)
    }
}

#[derive(Debug, Deserialize)]
struct ActiveResourceRow {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "ScratchOrgInfoId", default)]
    info_id: Option<String>,
    #[serde(rename = "SignupUsername", default)]
    signup_username: Option<String>,
    #[serde(rename = "SignupEmail", default)]
    signup_email: Option<String>,
}

/// Live environment record, linked 1:1 to a [`ResourceInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveResource {
    /// ActiveResource record id
    pub id: RecordId,
    /// Linked ResourceInfo id
    pub info_id: Option<RecordId>,
    /// Environment admin username
    pub signup_username: Option<String>,
    /// Environment admin email
    pub signup_email: Option<String>,
}

impl ActiveResource {
    /// Validate a remote row
    ///
    /// # Errors
    /// `PoolError::MalformedRecord` on missing or invalid ids.
    pub fn from_record(record: &Record) -> Result<Self, PoolError> {
        let malformed = |reason: String| PoolError::malformed(schema::ACTIVE_RESOURCE, reason);
        let row: ActiveResourceRow =
            serde_json::from_value(serde_json::Value::Object(record.clone()))
                .map_err(|e| malformed(e.to_string()))?;

        let id = RecordId::parse(row.id).map_err(|raw| malformed(format!("bad Id {raw:?}")))?;
        let info_id = match row.info_id {
            Some(raw) => Some(
                RecordId::parse(raw)
                    .map_err(|raw| malformed(format!("bad {} {raw:?}", field::INFO_ID)))?,
            ),
            None => None,
        };

        Ok(Self {
            id,
            info_id,
            signup_username: row.signup_username,
            signup_email: row.signup_email,
        })
    }
}

/// Connection details returned to a caller on a successful fetch
///
/// Never persisted; the caller owns it until the environment expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedHandle {
    /// Environment admin username
    pub username: String,
    /// Generated credential
    pub password: String,
    /// Login URL
    pub login_url: String,
    /// External environment id
    pub org_id: String,
    /// Local alias, if one was assigned at provisioning
    pub alias: Option<String>,
    /// ResourceInfo record id
    pub record_id: RecordId,
    /// Expiration date
    pub expiration_date: Option<NaiveDate>,
}

impl AllocatedHandle {
    /// Build a handle from a fully provisioned record
    ///
    /// # Errors
    /// `PoolError::MalformedRecord` if any connection detail is missing; a
    /// half-provisioned record never becomes a handle.
    pub fn from_resource(resource: &ResourceInfo) -> Result<Self, PoolError> {
        let missing = |what: &str| {
            PoolError::malformed(
                schema::RESOURCE_INFO,
                format!("record {} has no {what}", resource.id),
            )
        };

        Ok(Self {
            username: resource
                .signup_username
                .clone()
                .ok_or_else(|| missing(field::SIGNUP_USERNAME))?,
            password: resource
                .generated_credential
                .clone()
                .ok_or_else(|| missing(field::PASSWORD))?,
            login_url: resource
                .login_url
                .clone()
                .ok_or_else(|| missing(field::LOGIN_URL))?,
            org_id: resource
                .remote_resource_id
                .as_ref()
                .map(|id| id.short().to_string())
                .ok_or_else(|| missing(field::REMOTE_ID))?,
            alias: resource.alias.clone(),
            record_id: resource.id.clone(),
            expiration_date: resource.expiration_date,
        })
    }
}

/// One limit counter from the hub's limits endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LimitCounter {
    /// Maximum allowed
    #[serde(rename = "Max")]
    pub max: u64,
    /// Remaining
    #[serde(rename = "Remaining")]
    pub remaining: u64,
}

impl LimitCounter {
    /// Currently in use
    #[inline]
    #[must_use]
    pub fn in_use(&self) -> u64 {
        self.max.saturating_sub(self.remaining)
    }
}

/// Hub-wide environment limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnvironmentLimits {
    /// Concurrently active environments
    #[serde(rename = "ActiveScratchOrgs")]
    pub active: LimitCounter,
    /// Environments created per day
    #[serde(rename = "DailyScratchOrgs")]
    pub daily: LimitCounter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn full_row() -> Record {
        record(json!({
            "attributes": {"type": "ScratchOrgInfo"},
            "Id": "2SR5g000000abcdGAA",
            "ScratchOrg": "00D5g000004xyzA",
            "Pooltag__c": "core",
            "Status": "Active",
            "Allocation_status__c": null,
            "CreatedDate": "2024-05-01T10:00:00.000+0000",
            "LastModifiedDate": "2024-05-01T10:05:00.000+0000",
            "ExpirationDate": "2024-05-08",
            "SignupUsername": "test-abc@example.com",
            "SignupEmail": "dev@example.com",
            "LoginUrl": "https://ability-ruby-1234-dev-ed.my.salesforce.com",
            "Password__c": "s3cret!",
            "CreatedBy": {"Username": "hub@example.com"}
        }))
    }

    #[test]
    fn record_id_validation() {
        assert!(RecordId::parse("00D5g000004xyzA").is_ok());
        assert!(RecordId::parse("00D5g000004xyzAEAQ").is_ok());
        assert!(RecordId::parse("short").is_err());
        assert!(RecordId::parse("00D5g000004xy'A").is_err());

        let long = RecordId::parse("00D5g000004xyzAEAQ").unwrap();
        let short = RecordId::parse("00D5g000004xyzA").unwrap();
        assert_eq!(long.short(), "00D5g000004xyzA");
        assert!(long.same_record(&short));
    }

    #[test]
    fn parse_full_resource_info() {
        let info = ResourceInfo::from_record(&full_row()).unwrap();
        assert_eq!(info.status, ResourceStatus::Active);
        assert_eq!(info.allocation_status, AllocationStatus::Unassigned);
        assert_eq!(info.tag.as_deref(), Some("core"));
        assert_eq!(info.owner_username.as_deref(), Some("hub@example.com"));
        assert_eq!(
            info.expiration_date,
            NaiveDate::from_ymd_opt(2024, 5, 8)
        );
        assert!(info.is_claimable(NaiveDate::from_ymd_opt(2024, 5, 8).unwrap()));
        assert!(!info.is_claimable(NaiveDate::from_ymd_opt(2024, 5, 9).unwrap()));
    }

    #[test]
    fn reject_unknown_status() {
        let mut row = full_row();
        row.insert("Status".into(), json!("Exploded"));
        let err = ResourceInfo::from_record(&row).unwrap_err();
        assert!(matches!(err, PoolError::MalformedRecord { .. }));
    }

    #[test]
    fn reject_bad_id() {
        let mut row = full_row();
        row.insert("Id".into(), json!("nope"));
        assert!(ResourceInfo::from_record(&row).is_err());
    }

    #[test]
    fn handle_requires_credential() {
        let mut info = ResourceInfo::from_record(&full_row()).unwrap();
        let handle = AllocatedHandle::from_resource(&info).unwrap();
        assert_eq!(handle.org_id, "00D5g000004xyzA");
        assert_eq!(handle.password, "s3cret!");

        info.generated_credential = None;
        assert!(AllocatedHandle::from_resource(&info).is_err());
    }

    #[test]
    fn allocation_wire_values() {
        assert_eq!(AllocationStatus::from_wire(None), Some(AllocationStatus::Unassigned));
        assert_eq!(
            AllocationStatus::from_wire(Some("In Progress")),
            Some(AllocationStatus::InProgress)
        );
        assert_eq!(AllocationStatus::from_wire(Some("Lost")), None);
        assert_eq!(AllocationStatus::InProgress.as_str(), "In Progress");
    }

    #[test]
    fn limits_deserialize() {
        let limits: EnvironmentLimits = serde_json::from_value(json!({
            "ActiveScratchOrgs": {"Max": 40, "Remaining": 12},
            "DailyScratchOrgs": {"Max": 80, "Remaining": 70},
            "DailyApiRequests": {"Max": 15000, "Remaining": 14000}
        }))
        .unwrap();
        assert_eq!(limits.active.in_use(), 28);
        assert_eq!(limits.daily.remaining, 70);
    }
}
