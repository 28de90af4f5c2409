//! Remote object and field names, plus wire formats for dates
//!
//! The remote store exposes pool slots as `ScratchOrgInfo` records and live
//! environments as `ActiveScratchOrg` records. Custom fields carry the pool
//! tag, allocation state, generated credential and assignee.

use chrono::{DateTime, NaiveDate, Utc};

/// Pool slot lifecycle record
pub const RESOURCE_INFO: &str = "ScratchOrgInfo";
/// Live environment record
pub const ACTIVE_RESOURCE: &str = "ActiveScratchOrg";
/// Sandbox refresh/copy process (tooling API)
pub const SANDBOX_PROCESS: &str = "SandboxProcess";

/// Field names
pub mod field {
    pub const ID: &str = "Id";
    pub const REMOTE_ID: &str = "ScratchOrg";
    pub const STATUS: &str = "Status";
    pub const TAG: &str = "Pooltag__c";
    pub const ALLOCATION: &str = "Allocation_status__c";
    pub const ASSIGNEE: &str = "Assignee__c";
    pub const PASSWORD: &str = "Password__c";
    pub const CREATED_DATE: &str = "CreatedDate";
    pub const LAST_MODIFIED: &str = "LastModifiedDate";
    pub const EXPIRATION_DATE: &str = "ExpirationDate";
    pub const SIGNUP_USERNAME: &str = "SignupUsername";
    pub const SIGNUP_EMAIL: &str = "SignupEmail";
    pub const LOGIN_URL: &str = "LoginUrl";
    pub const CREATED_BY_USERNAME: &str = "CreatedBy.Username";
    pub const DURATION_DAYS: &str = "DurationDays";
    pub const DEFINITION: &str = "Definition__c";
    pub const ADMIN_EMAIL: &str = "AdminEmail";
    pub const CONNECTION_ALIAS: &str = "ConnectionAlias__c";
    pub const INFO_ID: &str = "ScratchOrgInfoId";
    pub const SANDBOX_NAME: &str = "SandboxName";
}

/// Fields selected whenever a full ResourceInfo is needed
pub const RESOURCE_INFO_FIELDS: &[&str] = &[
    field::ID,
    field::CREATED_DATE,
    field::LAST_MODIFIED,
    field::REMOTE_ID,
    field::STATUS,
    field::TAG,
    field::EXPIRATION_DATE,
    field::SIGNUP_USERNAME,
    field::SIGNUP_EMAIL,
    field::PASSWORD,
    field::ALLOCATION,
    field::ASSIGNEE,
    field::LOGIN_URL,
    field::CONNECTION_ALIAS,
    field::CREATED_BY_USERNAME,
];

/// Format a timestamp the way the remote store emits it (`2024-05-01T10:00:00.000+0000`)
#[must_use]
pub fn format_datetime(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f+0000").to_string()
}

/// Parse a remote timestamp; accepts both `+0000` and RFC 3339 offsets
#[must_use]
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a calendar date (`2024-05-08`)
#[must_use]
pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a calendar date
#[must_use]
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn datetime_wire_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let s = format_datetime(&ts);
        assert_eq!(s, "2024-05-01T10:00:00.000+0000");
        assert_eq!(parse_datetime(&s), Some(ts));
        assert_eq!(parse_datetime("2024-05-01T10:00:00Z"), Some(ts));
        assert_eq!(parse_datetime("yesterday"), None);
    }

    #[test]
    fn date_wire_format() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 8).unwrap();
        assert_eq!(format_date(&d), "2024-05-08");
        assert_eq!(parse_date("2024-05-08"), Some(d));
    }
}
