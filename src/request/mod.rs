//! Signup request intake and state machine.
//!
//! A request moves `draft → submitted → validated → processing → completed`,
//! with `failed` and `cancelled` as the off-ramps and `failed → validated`
//! on retry. Validation collects every problem before reporting; processing
//! creates the instance record and queues it for the provisioning sweep.

pub mod validate;

use chrono::Utc;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ProvisionerConfig;
use crate::error::{Error, ResourceKind, Result};
use crate::instance;
use crate::storage::{self, NewInstance, NewRequest, RequestRow, Storage};

/// Minutes quoted to the caller when a request is accepted.
pub const ESTIMATED_PROCESSING_MINUTES: i64 = 30;

const PASSWORD_LEN: usize = 12;
const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

// ─── States ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Draft,
    Submitted,
    Validated,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Draft => "draft",
            RequestState::Submitted => "submitted",
            RequestState::Validated => "validated",
            RequestState::Processing => "processing",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(RequestState::Draft),
            "submitted" => Some(RequestState::Submitted),
            "validated" => Some(RequestState::Validated),
            "processing" => Some(RequestState::Processing),
            "completed" => Some(RequestState::Completed),
            "failed" => Some(RequestState::Failed),
            "cancelled" => Some(RequestState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn state_of(row: &RequestRow) -> RequestState {
    RequestState::parse(&row.state).unwrap_or(RequestState::Draft)
}

// ─── Signup payload ───────────────────────────────────────────────────────────

/// Incoming signup body. Optional fields are defaulted during intake:
/// database name from the subdomain, admin email from the customer email,
/// admin password generated.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SignupPayload {
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub company_name: Option<String>,
    pub plan_code: Option<String>,
    pub subdomain: Option<String>,
    pub database_name: Option<String>,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    /// low | normal | high | urgent (default: normal)
    pub priority: Option<String>,
    /// portal | manual | api (default: api)
    pub source: Option<String>,
}

/// Names of required fields that are absent or empty.
pub fn missing_fields(payload: &SignupPayload) -> Vec<&'static str> {
    fn empty(v: &Option<String>) -> bool {
        v.as_deref().map(str::trim).unwrap_or("").is_empty()
    }
    let mut missing = Vec::new();
    if empty(&payload.customer_email) {
        missing.push("customer_email");
    }
    if empty(&payload.customer_name) {
        missing.push("customer_name");
    }
    if empty(&payload.company_name) {
        missing.push("company_name");
    }
    if empty(&payload.plan_code) {
        missing.push("plan_code");
    }
    if empty(&payload.subdomain) {
        missing.push("subdomain");
    }
    missing
}

fn normalize_priority(p: Option<&str>) -> &'static str {
    match p {
        Some("low") => "low",
        Some("high") => "high",
        Some("urgent") => "urgent",
        _ => "normal",
    }
}

fn normalize_source(s: Option<&str>) -> &'static str {
    match s {
        Some("portal") => "portal",
        Some("manual") => "manual",
        _ => "api",
    }
}

/// `REQ-` + UTC timestamp + 4 hex chars of entropy. The suffix keeps two
/// same-second signups from colliding.
pub fn generate_request_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = OsRng.next_u32() & 0xffff;
    format!("REQ-{stamp}-{suffix:04x}")
}

/// 12 characters drawn from letters, digits, and `!@#$%^&*`.
pub fn generate_password() -> String {
    let mut rng = OsRng;
    (0..PASSWORD_LEN)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % PASSWORD_ALPHABET.len();
            PASSWORD_ALPHABET[idx] as char
        })
        .collect()
}

// ─── Intake ───────────────────────────────────────────────────────────────────

/// Create a request from a signup payload and run it through validation and
/// processing. Required-field presence must already have been checked via
/// [`missing_fields`]. Returns the request in its final state; validation
/// and processing failures surface as errors after the row is updated.
pub async fn create_from_signup(
    storage: &Storage,
    cfg: &ProvisionerConfig,
    payload: &SignupPayload,
) -> Result<RequestRow> {
    let customer_email = payload.customer_email.clone().unwrap_or_default();
    let subdomain = payload.subdomain.clone().unwrap_or_default();
    let database_name = payload
        .database_name
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| validate::database_name_from_subdomain(&subdomain));
    let admin_email = payload
        .admin_email
        .clone()
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| customer_email.clone());
    let admin_password = payload
        .admin_password
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(generate_password);

    let raw_data = serde_json::to_string(payload).ok();

    let row = storage
        .create_request(NewRequest {
            request_id: generate_request_id(),
            source: normalize_source(payload.source.as_deref()).to_string(),
            customer_email,
            customer_name: payload.customer_name.clone().unwrap_or_default(),
            customer_phone: payload.customer_phone.clone().filter(|p| !p.is_empty()),
            company_name: payload.company_name.clone().unwrap_or_default(),
            plan_code: payload.plan_code.clone().unwrap_or_default(),
            subdomain,
            database_name,
            admin_email,
            admin_password,
            priority: normalize_priority(payload.priority.as_deref()).to_string(),
            state: RequestState::Submitted.as_str().to_string(),
            raw_data,
            submitted_at: Some(storage::now_rfc3339()),
        })
        .await?;

    validate(storage, &row).await?;
    let row = process(storage, cfg, &row).await?;
    Ok(row)
}

// ─── State machine ────────────────────────────────────────────────────────────

/// Move a draft request to `submitted` and validate it immediately.
pub async fn submit(storage: &Storage, req: &RequestRow) -> Result<()> {
    if !storage.mark_request_submitted(&req.id).await? {
        return Err(Error::invalid_state("Only draft requests can be submitted"));
    }
    let fresh = storage
        .get_request(&req.id)
        .await?
        .ok_or_else(|| Error::not_found(ResourceKind::Request, &req.request_id))?;
    validate(storage, &fresh).await
}

/// Validate a submitted request. Every failure is collected; on any failure
/// the request moves to `failed` with the full list recorded.
pub async fn validate(storage: &Storage, req: &RequestRow) -> Result<()> {
    match state_of(req) {
        RequestState::Submitted | RequestState::Validated => {}
        _ => {
            return Err(Error::invalid_state(
                "Only submitted requests can be validated",
            ))
        }
    }

    let mut errors = Vec::new();

    if let Some(issue) = validate::check_subdomain(&req.subdomain) {
        errors.push(issue.message().to_string());
    } else if storage.subdomain_in_use(&req.subdomain).await? {
        errors.push(format!("Subdomain \"{}\" is already in use", req.subdomain));
    }

    if let Some(msg) = validate::check_database_name(&req.database_name) {
        errors.push(msg.to_string());
    } else if storage.database_name_in_use(&req.database_name).await? {
        errors.push(format!(
            "Database name \"{}\" is already in use",
            req.database_name
        ));
    }

    match storage.get_plan(&req.plan_code).await? {
        Some(plan) if plan.active => {}
        _ => errors.push("Selected service plan is not available".to_string()),
    }

    if !validate::is_valid_email(&req.customer_email) {
        errors.push("Invalid customer email format".to_string());
    }
    if !validate::is_valid_email(&req.admin_email) {
        errors.push("Invalid admin email format".to_string());
    }

    if errors.is_empty() {
        storage.mark_request_validated(&req.id).await?;
        Ok(())
    } else {
        storage
            .mark_request_validation_failed(&req.id, &errors.join("\n"))
            .await?;
        Err(Error::Validation(errors))
    }
}

/// Process a validated request: find-or-create the customer, create the
/// instance record, and queue it for provisioning. The processing claim is
/// atomic — a request is processed at most once.
pub async fn process(
    storage: &Storage,
    cfg: &ProvisionerConfig,
    req: &RequestRow,
) -> Result<RequestRow> {
    if !storage.claim_request_for_processing(&req.id).await? {
        return Err(Error::invalid_state(
            "Only validated requests can be processed",
        ));
    }

    match create_instance_for(storage, cfg, req).await {
        Ok(()) => {}
        Err(e) => {
            let notes = format!("Processing failed: {e}");
            storage.mark_request_failed(&req.id, &notes).await?;
            return Err(e);
        }
    }

    storage
        .get_request(&req.id)
        .await?
        .ok_or_else(|| Error::not_found(ResourceKind::Request, &req.request_id))
}

async fn create_instance_for(
    storage: &Storage,
    cfg: &ProvisionerConfig,
    req: &RequestRow,
) -> Result<()> {
    let plan = storage
        .get_plan(&req.plan_code)
        .await?
        .ok_or_else(|| Error::not_found(ResourceKind::Plan, &req.plan_code))?;

    let customer = match storage.find_customer_by_email(&req.customer_email).await? {
        Some(c) => c,
        None => {
            storage
                .create_customer(
                    &req.company_name,
                    &req.customer_name,
                    &req.customer_email,
                    req.customer_phone.as_deref(),
                )
                .await?
        }
    };

    let created = storage
        .create_instance(
            NewInstance {
                name: format!("{} - {}", req.company_name, plan.name),
                subdomain: req.subdomain.clone(),
                database_name: req.database_name.clone(),
                plan_code: req.plan_code.clone(),
                app_version: cfg.app_version.clone(),
                admin_email: req.admin_email.clone(),
                admin_password: req.admin_password.clone(),
                company_name: req.company_name.clone(),
                storage_limit_gb: plan.storage_limit_gb,
                customer_id: Some(customer.id.clone()),
                request_id: Some(req.id.clone()),
            },
            cfg.first_instance_port,
        )
        .await;

    let instance_row = match created {
        Ok(row) => row,
        Err(e) if storage::is_unique_violation(&e) => {
            // Lost the race for the subdomain or database name between
            // validation and insert. The unique index is the arbiter.
            return Err(Error::Validation(vec![format!(
                "Subdomain \"{}\" is already in use",
                req.subdomain
            )]));
        }
        Err(e) => return Err(Error::Operational(e)),
    };

    if !storage
        .claim_instance_for_provisioning(&instance_row.id)
        .await?
    {
        warn!(instance_id = %instance_row.id, "freshly created instance was not in draft");
    }

    storage
        .mark_request_completed(
            &req.id,
            "Instance created and provisioning queued",
            &instance_row.id,
            &customer.id,
        )
        .await?;
    Ok(())
}

/// Cancel a request. A draft instance the request created is removed; an
/// instance that already entered provisioning is left alone.
pub async fn cancel(storage: &Storage, req: &RequestRow) -> Result<()> {
    match state_of(req) {
        RequestState::Completed | RequestState::Cancelled => {
            return Err(Error::invalid_state(
                "Completed or already cancelled requests cannot be cancelled",
            ))
        }
        _ => {}
    }

    if let Some(instance_id) = &req.instance_id {
        if let Some(inst) = storage.get_instance(instance_id).await? {
            if inst.state == instance::InstanceState::Draft.as_str() {
                storage.delete_instance(instance_id).await?;
            }
        }
    }

    storage.mark_request_cancelled(&req.id).await?;
    Ok(())
}

/// Retry a failed request: back to `validated`, then process again.
pub async fn retry(
    storage: &Storage,
    cfg: &ProvisionerConfig,
    req: &RequestRow,
) -> Result<RequestRow> {
    if !storage.reset_request_for_retry(&req.id).await? {
        return Err(Error::invalid_state("Only failed requests can be retried"));
    }
    let fresh = storage
        .get_request(&req.id)
        .await?
        .ok_or_else(|| Error::not_found(ResourceKind::Request, &req.request_id))?;
    process(storage, cfg, &fresh).await
}

// ─── Summary ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub request_id: String,
    pub state: String,
    pub customer_name: String,
    pub company_name: String,
    pub subdomain: String,
    pub plan_name: String,
    pub submitted_at: Option<String>,
    pub estimated_minutes: i64,
    pub actual_minutes: i64,
    pub instance_url: Option<String>,
}

/// Minutes between processing start and completion; 0 while in flight.
fn actual_minutes(req: &RequestRow) -> i64 {
    let (Some(start), Some(end)) = (&req.processing_started_at, &req.completed_at) else {
        return 0;
    };
    let (Ok(start), Ok(end)) = (
        chrono::DateTime::parse_from_rfc3339(start),
        chrono::DateTime::parse_from_rfc3339(end),
    ) else {
        return 0;
    };
    (end - start).num_minutes().max(0)
}

pub async fn summary(
    storage: &Storage,
    cfg: &ProvisionerConfig,
    req: &RequestRow,
) -> Result<RequestSummary> {
    let plan_name = storage
        .get_plan(&req.plan_code)
        .await?
        .map(|p| p.name)
        .unwrap_or_else(|| req.plan_code.clone());

    let instance_url = match &req.instance_id {
        Some(id) => storage
            .get_instance(id)
            .await?
            .map(|i| instance::instance_url(&i.subdomain, i.ssl_enabled, &cfg.base_domain)),
        None => None,
    };

    Ok(RequestSummary {
        request_id: req.request_id.clone(),
        state: req.state.clone(),
        customer_name: req.customer_name.clone(),
        company_name: req.company_name.clone(),
        subdomain: req.subdomain.clone(),
        plan_name,
        submitted_at: req.submitted_at.clone(),
        estimated_minutes: ESTIMATED_PROCESSING_MINUTES,
        actual_minutes: actual_minutes(req),
        instance_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_carry_prefix_and_entropy() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert!(a.starts_with("REQ-"));
        assert_eq!(a.len(), "REQ-20250101120000-abcd".len());
        assert_ne!(a, b);
    }

    #[test]
    fn generated_passwords_use_the_alphabet() {
        let pw = generate_password();
        assert_eq!(pw.len(), 12);
        assert!(pw
            .bytes()
            .all(|b| PASSWORD_ALPHABET.contains(&b)));
    }

    #[test]
    fn missing_fields_reports_each_absent_required_field() {
        let payload = SignupPayload {
            customer_email: Some("a@b.co".to_string()),
            subdomain: Some("".to_string()),
            ..Default::default()
        };
        let missing = missing_fields(&payload);
        assert_eq!(
            missing,
            vec!["customer_name", "company_name", "plan_code", "subdomain"]
        );
    }

    #[test]
    fn priority_and_source_normalize() {
        assert_eq!(normalize_priority(Some("urgent")), "urgent");
        assert_eq!(normalize_priority(Some("bogus")), "normal");
        assert_eq!(normalize_priority(None), "normal");
        assert_eq!(normalize_source(Some("portal")), "portal");
        assert_eq!(normalize_source(None), "api");
    }
}
