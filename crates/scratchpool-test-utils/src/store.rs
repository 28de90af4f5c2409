//! In-memory remote store
//!
//! Evaluates structured queries directly, keeps a logical clock so every
//! write gets a strictly later `LastModifiedDate`, honours update
//! preconditions, and emulates the hub side of environment creation
//! (including a login URL that may only appear a few queries later). Every
//! call yields to the scheduler first so concurrent callers interleave.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SubsecRound, Utc};
use parking_lot::Mutex;
use scratchpool_core::query::{CmpOp, Condition, Direction, Literal, SoqlQuery};
use scratchpool_core::remote::{Fields, Precondition, Record, RemoteClient};
use scratchpool_core::schema::{self, field};
use scratchpool_core::{AllocationStatus, RecordId, RemoteError, ResourceStatus};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Default hub session username
pub const HUB_USER: &str = "hub-admin@example.com";

/// Remote call kinds, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Query,
    Create,
    Update,
    Delete,
    Get,
    Post,
}

/// Pool record to seed directly into the store
#[derive(Debug, Clone)]
pub struct SeedRecord {
    pub tag: String,
    pub status: ResourceStatus,
    pub allocation: AllocationStatus,
    pub assignee: Option<String>,
    pub expires_in_days: i64,
    pub password: Option<String>,
    pub login_url: bool,
    pub created_by: Option<String>,
    pub signup_email: String,
    pub live: bool,
}

impl SeedRecord {
    /// Active, unassigned, fully provisioned record expiring in a week
    pub fn available(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            status: ResourceStatus::Active,
            allocation: AllocationStatus::Unassigned,
            assignee: None,
            expires_in_days: 7,
            password: Some("Secr3tPassw0rd".to_string()),
            login_url: true,
            created_by: None,
            signup_email: "dev@example.com".to_string(),
            live: true,
        }
    }

    pub fn assigned_to(mut self, requester: &str) -> Self {
        self.allocation = AllocationStatus::Assigned;
        self.assignee = Some(requester.to_string());
        self
    }

    pub fn in_progress(mut self) -> Self {
        self.allocation = AllocationStatus::InProgress;
        self
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn expires_in(mut self, days: i64) -> Self {
        self.expires_in_days = days;
        self
    }

    pub fn without_password(mut self) -> Self {
        self.password = None;
        self
    }

    pub fn created_by(mut self, username: &str) -> Self {
        self.created_by = Some(username.to_string());
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.signup_email = email.to_string();
        self
    }

    pub fn without_live_environment(mut self) -> Self {
        self.live = false;
        self
    }
}

struct State {
    tables: BTreeMap<String, Vec<Record>>,
    clock: DateTime<Utc>,
    next_id: u64,
    hub_username: String,
    faults: HashMap<RemoteOp, VecDeque<Option<RemoteError>>>,
    visibility_lag: u32,
    hidden: HashMap<String, u32>,
    login_url_lag: u32,
    pending_live: HashMap<String, (u32, Record)>,
    calls: HashMap<RemoteOp, usize>,
    resources: HashMap<String, Value>,
    posts: Vec<(String, Value)>,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += ChronoDuration::seconds(1);
        self.clock
    }

    fn today(&self) -> NaiveDate {
        self.clock.date_naive()
    }

    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012}AAA", self.next_id)
    }

    fn enter(&mut self, op: RemoteOp) -> Result<(), RemoteError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn insert_row(&mut self, object: &str, mut row: Record, lagged: bool) -> RecordId {
        let prefix = match object {
            schema::RESOURCE_INFO => "2SR",
            schema::ACTIVE_RESOURCE => "2AS",
            schema::SANDBOX_PROCESS => "0GR",
            _ => "a00",
        };
        let id = self.new_id(prefix);
        let now = schema::format_datetime(&self.tick());

        row.insert(field::ID.into(), Value::from(id.clone()));
        row.entry(field::CREATED_DATE.to_string())
            .or_insert_with(|| Value::from(now.clone()));
        row.insert(field::LAST_MODIFIED.into(), Value::from(now));
        row.insert(
            "attributes".into(),
            json!({
                "type": object,
                "url": format!("/services/data/v58.0/sobjects/{object}/{id}"),
            }),
        );
        self.tables.entry(object.to_string()).or_default().push(row);

        if lagged && self.visibility_lag > 0 {
            self.hidden.insert(id.clone(), self.visibility_lag);
        }
        RecordId::parse(id).expect("generated ids are valid")
    }

    fn find_mut(&mut self, object: &str, id: &RecordId) -> Option<&mut Record> {
        self.tables
            .get_mut(object)?
            .iter_mut()
            .find(|row| row_id(row).is_some_and(|r| r.same_record(id)))
    }

    fn create_environment(&mut self, fields: &Fields) -> Result<RecordId, RemoteError> {
        let username = fields
            .get("Username")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("user{}@scratch.example.com", self.next_id + 1));

        let taken = self
            .tables
            .get(schema::RESOURCE_INFO)
            .is_some_and(|rows| {
                rows.iter().any(|r| {
                    r.get(field::SIGNUP_USERNAME).and_then(Value::as_str) == Some(username.as_str())
                })
            });
        if taken {
            return Err(RemoteError::Validation {
                code: "DUPLICATE_USERNAME".into(),
                message: format!("duplicate username {username}"),
            });
        }

        let org_id = self.new_id("00D")[..15].to_string();
        let days = fields
            .get(field::DURATION_DAYS)
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let expiration = self.today() + ChronoDuration::days(days);

        let mut live = Record::new();
        live.insert(field::REMOTE_ID.into(), Value::from(org_id.clone()));
        live.insert(
            field::LOGIN_URL.into(),
            Value::from(format!("https://{}.scratch.example.com", org_id.to_lowercase())),
        );

        let mut row = fields.clone();
        row.insert(field::SIGNUP_USERNAME.into(), Value::from(username.clone()));
        if self.login_url_lag == 0 {
            row.extend(live.clone());
        }
        row.insert(
            field::EXPIRATION_DATE.into(),
            Value::from(schema::format_date(&expiration)),
        );
        row.entry(field::STATUS.to_string())
            .or_insert_with(|| Value::from(ResourceStatus::New.as_str()));
        let email = fields.get(field::ADMIN_EMAIL).cloned().unwrap_or(Value::Null);
        row.insert(field::SIGNUP_EMAIL.into(), email.clone());
        row.insert("CreatedBy".into(), json!({ "Username": self.hub_username }));

        let info_id = self.insert_row(schema::RESOURCE_INFO, row, true);
        if self.login_url_lag > 0 {
            self.pending_live
                .insert(info_id.as_str().to_string(), (self.login_url_lag, live));
        }

        let mut active = Record::new();
        active.insert(field::INFO_ID.into(), Value::from(info_id.as_str()));
        active.insert(field::SIGNUP_USERNAME.into(), Value::from(username));
        active.insert(field::SIGNUP_EMAIL.into(), email);
        active.insert(field::REMOTE_ID.into(), Value::from(org_id));
        self.insert_row(schema::ACTIVE_RESOURCE, active, true);

        Ok(info_id)
    }

    /// Rows of `query.object` matching its filter, sorted and limited
    fn select(&mut self, query: &SoqlQuery) -> Vec<Record> {
        let mut rows: Vec<Record> = self
            .tables
            .get(&query.object)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        let hidden = row_id(row).is_some_and(|id| self.hidden.contains_key(id.as_str()));
                        !hidden && query.filter.as_ref().map_or(true, |c| matches(c, row))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        self.after_query();

        rows.sort_by(|a, b| compare_rows(a, b, &query.order_by));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Count down lagging records; environments whose lag ran out go live
    fn after_query(&mut self) {
        self.hidden.retain(|_, remaining| {
            *remaining -= 1;
            *remaining > 0
        });

        let mut ready = Vec::new();
        self.pending_live.retain(|id, (remaining, live)| {
            *remaining -= 1;
            if *remaining == 0 {
                ready.push((id.clone(), std::mem::take(live)));
            }
            *remaining > 0
        });
        for (id, live) in ready {
            let Ok(id) = RecordId::parse(id) else { continue };
            let now = schema::format_datetime(&self.tick());
            if let Some(row) = self.find_mut(schema::RESOURCE_INFO, &id) {
                row.extend(live);
                row.insert(field::LAST_MODIFIED.into(), Value::from(now));
            }
        }
    }
}

/// [`RemoteClient`] backed by in-process tables
pub struct InMemoryRemote {
    state: Mutex<State>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Empty store with the clock at the current second
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tables: BTreeMap::new(),
                clock: Utc::now().trunc_subsecs(0),
                next_id: 0,
                hub_username: HUB_USER.to_string(),
                faults: HashMap::new(),
                visibility_lag: 0,
                hidden: HashMap::new(),
                login_url_lag: 0,
                pending_live: HashMap::new(),
                calls: HashMap::new(),
                resources: HashMap::new(),
                posts: Vec::new(),
            }),
        }
    }

    /// Records created through `create` stay invisible to this many queries
    pub fn with_visibility_lag(self, queries: u32) -> Self {
        self.state.lock().visibility_lag = queries;
        self
    }

    /// Created environments report no login URL or org id for this many queries
    pub fn with_login_url_lag(self, queries: u32) -> Self {
        self.state.lock().login_url_lag = queries;
        self
    }

    pub fn with_hub_username(self, username: &str) -> Self {
        self.state.lock().hub_username = username.to_string();
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().clock
    }

    pub fn today(&self) -> NaiveDate {
        self.state.lock().today()
    }

    /// Move the logical clock forward
    pub fn advance(&self, by: ChronoDuration) {
        self.state.lock().clock += by;
    }

    /// Fail the next call of kind `op` with `error`; queued errors fire in order
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.fail_after(op, 0, error);
    }

    /// Let `skip` further calls of kind `op` through, then fail one with `error`
    pub fn fail_after(&self, op: RemoteOp, skip: usize, error: RemoteError) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_with(|| None).take(skip));
        queue.push_back(Some(error));
    }

    /// Calls of kind `op` so far, including failed ones
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Serve `body` for GET (and POST) on `path`
    pub fn set_resource(&self, path: &str, body: Value) {
        self.state.lock().resources.insert(path.to_string(), body);
    }

    /// Bodies POSTed so far
    pub fn posts(&self) -> Vec<(String, Value)> {
        self.state.lock().posts.clone()
    }

    /// Insert a raw row, visible immediately
    pub fn insert(&self, object: &str, row: Value) -> RecordId {
        let row = row.as_object().cloned().unwrap_or_default();
        self.state.lock().insert_row(object, row, false)
    }

    /// Seed a pool record (and its live environment), visible immediately
    pub fn seed(&self, seed: SeedRecord) -> RecordId {
        let mut state = self.state.lock();
        let org_id = state.new_id("00D")[..15].to_string();
        let expiration = state.today() + ChronoDuration::days(seed.expires_in_days);
        let created_by = seed
            .created_by
            .clone()
            .unwrap_or_else(|| state.hub_username.clone());
        let username = format!("{}@{}.pool.example.com", org_id.to_lowercase(), seed.tag);

        let mut row = Record::new();
        row.insert(field::TAG.into(), Value::from(seed.tag.clone()));
        row.insert(field::STATUS.into(), Value::from(seed.status.as_str()));
        row.insert(field::ALLOCATION.into(), Value::from(seed.allocation.as_str()));
        row.insert(
            field::ASSIGNEE.into(),
            seed.assignee.clone().map_or(Value::Null, Value::from),
        );
        row.insert(
            field::EXPIRATION_DATE.into(),
            Value::from(schema::format_date(&expiration)),
        );
        row.insert(field::SIGNUP_USERNAME.into(), Value::from(username.clone()));
        row.insert(field::SIGNUP_EMAIL.into(), Value::from(seed.signup_email.clone()));
        row.insert(field::REMOTE_ID.into(), Value::from(org_id.clone()));
        row.insert(
            field::PASSWORD.into(),
            seed.password.clone().map_or(Value::Null, Value::from),
        );
        if seed.login_url {
            row.insert(
                field::LOGIN_URL.into(),
                Value::from(format!("https://{}.scratch.example.com", org_id.to_lowercase())),
            );
        }
        row.insert("CreatedBy".into(), json!({ "Username": created_by }));
        let info_id = state.insert_row(schema::RESOURCE_INFO, row, false);

        if seed.live {
            let mut active = Record::new();
            active.insert(field::INFO_ID.into(), Value::from(info_id.as_str()));
            active.insert(field::SIGNUP_USERNAME.into(), Value::from(username));
            active.insert(field::SIGNUP_EMAIL.into(), Value::from(seed.signup_email));
            active.insert(field::REMOTE_ID.into(), Value::from(org_id));
            state.insert_row(schema::ACTIVE_RESOURCE, active, false);
        }
        info_id
    }

    /// Current row for `id`, ignoring visibility lag
    pub fn record(&self, object: &str, id: &RecordId) -> Option<Record> {
        self.state.lock().find_mut(object, id).map(|row| row.clone())
    }

    /// All rows of `object`, ignoring visibility lag
    pub fn records(&self, object: &str) -> Vec<Record> {
        self.state
            .lock()
            .tables
            .get(object)
            .cloned()
            .unwrap_or_default()
    }

    /// Live environment rows linked to ResourceInfo `info_id`
    pub fn live_environments(&self, info_id: &RecordId) -> Vec<Record> {
        self.records(schema::ACTIVE_RESOURCE)
            .into_iter()
            .filter(|row| {
                row.get(field::INFO_ID)
                    .and_then(Value::as_str)
                    .and_then(|raw| RecordId::parse(raw).ok())
                    .is_some_and(|linked| linked.same_record(info_id))
            })
            .collect()
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn query(&self, query: &SoqlQuery) -> Result<Vec<Record>, RemoteError> {
        tokio::task::yield_now().await;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.enter(RemoteOp::Query)?;
        Ok(state.select(query))
    }

    async fn count(&self, query: &SoqlQuery) -> Result<usize, RemoteError> {
        tokio::task::yield_now().await;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.enter(RemoteOp::Query)?;
        Ok(state.select(query).len())
    }

    async fn create(&self, object: &str, fields: &Fields) -> Result<RecordId, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::Create)?;
        if object == schema::RESOURCE_INFO {
            state.create_environment(fields)
        } else {
            Ok(state.insert_row(object, fields.clone(), true))
        }
    }

    async fn update(
        &self,
        object: &str,
        id: &RecordId,
        fields: &Fields,
        precondition: Option<Precondition>,
    ) -> Result<(), RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::Update)?;
        let now = schema::format_datetime(&state.tick());

        let row = state
            .find_mut(object, id)
            .ok_or_else(|| RemoteError::NotFound(format!("{object} {id}")))?;

        if let Some(p) = precondition {
            let modified = row
                .get(field::LAST_MODIFIED)
                .and_then(Value::as_str)
                .and_then(schema::parse_datetime);
            if modified.is_some_and(|m| m > p.unmodified_since) {
                return Err(RemoteError::PreconditionFailed(format!(
                    "{object} {id} modified since {}",
                    p.unmodified_since
                )));
            }
        }

        for (key, value) in fields {
            row.insert(key.clone(), value.clone());
        }
        row.insert(field::LAST_MODIFIED.into(), Value::from(now));
        Ok(())
    }

    async fn delete(&self, object: &str, id: &RecordId) -> Result<(), RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::Delete)?;
        let rows = state.tables.entry(object.to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| !row_id(row).is_some_and(|r| r.same_record(id)));
        if rows.len() == before {
            return Err(RemoteError::NotFound(format!("entity is deleted: {id}")));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::Get)?;
        if let Some(body) = state.resources.get(path) {
            return Ok(body.clone());
        }
        state
            .tables
            .values()
            .flatten()
            .find(|row| {
                row.get("attributes")
                    .and_then(|a| a.get("url"))
                    .and_then(Value::as_str)
                    == Some(path)
            })
            .map(|row| Value::Object(row.clone()))
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::Post)?;
        state.posts.push((path.to_string(), body.clone()));
        Ok(state
            .resources
            .get(path)
            .cloned()
            .unwrap_or_else(|| json!([{ "isSuccess": true }])))
    }
}

fn row_id(row: &Record) -> Option<RecordId> {
    row.get(field::ID)
        .and_then(Value::as_str)
        .and_then(|raw| RecordId::parse(raw).ok())
}

/// Resolve a dotted path such as `CreatedBy.Username`
fn lookup<'a>(row: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = row.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare(actual: Option<&Value>, literal: &Literal) -> Option<Ordering> {
    let actual = actual?;
    match literal {
        Literal::Str(s) => actual.as_str().map(|a| a.cmp(s.as_str())),
        Literal::Int(i) => actual.as_i64().map(|a| a.cmp(i)),
        Literal::Bool(b) => actual.as_bool().map(|a| a.cmp(b)),
        Literal::Date(d) => actual
            .as_str()
            .and_then(schema::parse_date)
            .map(|a| a.cmp(d)),
        Literal::DateTime(t) => actual
            .as_str()
            .and_then(schema::parse_datetime)
            .map(|a| a.cmp(t)),
        Literal::Null => None,
    }
}

fn matches(condition: &Condition, row: &Record) -> bool {
    match condition {
        Condition::Cmp { field, op, value } => {
            let actual = lookup(row, field).filter(|v| !v.is_null());
            if *value == Literal::Null {
                return match op {
                    CmpOp::Eq => actual.is_none(),
                    CmpOp::Ne => actual.is_some(),
                    _ => false,
                };
            }
            match compare(actual, value) {
                Some(ord) => match op {
                    CmpOp::Eq => ord == Ordering::Equal,
                    CmpOp::Ne => ord != Ordering::Equal,
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                },
                // null compares unequal to everything
                None => *op == CmpOp::Ne,
            }
        }
        Condition::In {
            field,
            values,
            negated,
        } => {
            let actual = lookup(row, field).filter(|v| !v.is_null());
            let found = values
                .iter()
                .any(|v| compare(actual, v) == Some(Ordering::Equal));
            found != *negated
        }
        Condition::And(parts) => parts.iter().all(|c| matches(c, row)),
        Condition::Or(parts) => parts.iter().any(|c| matches(c, row)),
        Condition::Not(inner) => !matches(inner, row),
    }
}

fn sort_key(row: &Record, field: &str) -> Option<String> {
    match lookup(row, field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn compare_rows(a: &Record, b: &Record, keys: &[(String, Direction)]) -> Ordering {
    for (field, direction) in keys {
        let ord = sort_key(a, field).cmp(&sort_key(b, field));
        let ord = match direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evaluates_pool_filter() {
        let remote = InMemoryRemote::new();
        let free = remote.seed(SeedRecord::available("core"));
        remote.seed(SeedRecord::available("core").assigned_to("someone"));
        remote.seed(SeedRecord::available("other"));

        let query = SoqlQuery::from(schema::RESOURCE_INFO)
            .filter(Condition::eq(field::TAG, "core"))
            .filter(Condition::not_in(field::ALLOCATION, ["Assigned", "In Progress"]))
            .filter(Condition::eq(field::CREATED_BY_USERNAME, HUB_USER));
        let rows = remote.query(&query).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(row_id(&rows[0]), Some(free));
    }

    #[tokio::test]
    async fn stale_precondition_is_rejected() {
        let remote = InMemoryRemote::new();
        let id = remote.seed(SeedRecord::available("core"));
        let seen = remote.now();

        let mut fields = Fields::new();
        fields.insert(field::ASSIGNEE.into(), Value::from("a"));
        let guard = Some(Precondition { unmodified_since: seen });

        remote.update(schema::RESOURCE_INFO, &id, &fields, guard).await.unwrap();
        let second = remote.update(schema::RESOURCE_INFO, &id, &fields, guard).await;
        assert!(matches!(second, Err(RemoteError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn created_records_lag_behind() {
        let remote = InMemoryRemote::new().with_visibility_lag(2);
        let mut fields = Fields::new();
        fields.insert("Username".into(), Value::from("u@example.com"));
        remote.create(schema::RESOURCE_INFO, &fields).await.unwrap();

        let query = SoqlQuery::from(schema::RESOURCE_INFO);
        assert!(remote.query(&query).await.unwrap().is_empty());
        assert!(remote.query(&query).await.unwrap().is_empty());
        assert_eq!(remote.query(&query).await.unwrap().len(), 1);

        let dup = remote.create(schema::RESOURCE_INFO, &fields).await;
        assert_eq!(
            dup.unwrap_err().validation_code(),
            Some("DUPLICATE_USERNAME")
        );
    }
}
