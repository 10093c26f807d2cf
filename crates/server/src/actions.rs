use async_trait::async_trait;
use router::{
    sanitize::unescape_html, ActionHandler, ActionOptions, ActionRegistry, ActionRequest,
    HandlerError, HandlerResult, RegistryError,
};
use serde_json::{json, Value};
use shared::domain::SubmissionId;
use storage::{NewSubmission, Storage};

use crate::app_state::MANAGE_OPTIONS;

const DEFAULT_FORM_ID: &str = "contact";
const DEFAULT_PER_PAGE: i64 = 20;
const MAX_PER_PAGE: i64 = 100;
const MAX_NAME_CHARS: usize = 100;
const MAX_SUBJECT_CHARS: usize = 200;
const MAX_MESSAGE_CHARS: usize = 5000;
const MAX_EMAIL_BYTES: usize = 254;

/// Startup registration table for every action the endpoint serves.
pub(crate) fn register_actions(storage: &Storage) -> Result<ActionRegistry, RegistryError> {
    let mut registry = ActionRegistry::new();
    registry.register(
        "echo",
        EchoAction,
        ActionOptions::new("Return the sanitized payload unchanged"),
    )?;
    registry.register(
        "submit_contact_form",
        SubmitContactForm {
            storage: storage.clone(),
        },
        ActionOptions::new("Store a contact form submission")
            .require_auth_token()
            .validator(contact_form_is_valid)
            .log_requests(),
    )?;
    registry.register(
        "get_submission",
        GetSubmission {
            storage: storage.clone(),
        },
        ActionOptions::new("Fetch one stored form submission")
            .require_auth_token()
            .capability(MANAGE_OPTIONS)
            .validator(|request: &ActionRequest| {
                request.i64_field("submission_id").is_some_and(|id| id > 0)
            }),
    )?;
    registry.register(
        "list_submissions",
        ListSubmissions {
            storage: storage.clone(),
        },
        ActionOptions::new("List stored form submissions, newest first")
            .require_auth_token()
            .capability(MANAGE_OPTIONS),
    )?;
    Ok(registry)
}

struct EchoAction;

#[async_trait]
impl ActionHandler for EchoAction {
    async fn call(&self, request: &ActionRequest) -> HandlerResult {
        Ok(Value::Object(request.payload.clone()))
    }
}

struct SubmitContactForm {
    storage: Storage,
}

#[async_trait]
impl ActionHandler for SubmitContactForm {
    async fn call(&self, request: &ActionRequest) -> HandlerResult {
        let submission = NewSubmission {
            form_id: request
                .str_field("form_id")
                .unwrap_or(DEFAULT_FORM_ID)
                .to_string(),
            name: required_text(request, "name")?,
            email: required_text(request, "email")?,
            subject: request.str_field("subject").map(str::to_string),
            message: required_text(request, "message")?,
        };
        let submission_id = self.storage.insert_submission(&submission).await?;
        Ok(json!({
            "submission_id": submission_id.0,
            "message": "Thank you! Your message has been sent.",
        }))
    }
}

struct GetSubmission {
    storage: Storage,
}

#[async_trait]
impl ActionHandler for GetSubmission {
    async fn call(&self, request: &ActionRequest) -> HandlerResult {
        let submission_id = request
            .i64_field("submission_id")
            .map(SubmissionId)
            .ok_or_else(|| {
                HandlerError::rejected("missing_submission_id", "submission_id is required")
            })?;
        let Some(submission) = self.storage.load_submission(submission_id).await? else {
            return Err(
                HandlerError::rejected("submission_not_found", "Submission not found")
                    .with_data(json!({ "submission_id": submission_id.0 })),
            );
        };
        serde_json::to_value(submission).map_err(|e| HandlerError::Internal(e.into()))
    }
}

struct ListSubmissions {
    storage: Storage,
}

#[async_trait]
impl ActionHandler for ListSubmissions {
    async fn call(&self, request: &ActionRequest) -> HandlerResult {
        let page = request.i64_field("page").filter(|page| *page > 0).unwrap_or(1);
        let per_page = request
            .i64_field("per_page")
            .filter(|per_page| *per_page > 0)
            .unwrap_or(DEFAULT_PER_PAGE)
            .min(MAX_PER_PAGE);
        let offset = (page - 1).saturating_mul(per_page);

        let items = self
            .storage
            .list_submissions(
                u32::try_from(per_page).unwrap_or(u32::MAX),
                u32::try_from(offset).unwrap_or(u32::MAX),
            )
            .await?;
        let total = self.storage.count_submissions().await?;
        Ok(json!({
            "items": items,
            "page": page,
            "per_page": per_page,
            "total": total,
        }))
    }
}

fn required_text(request: &ActionRequest, key: &str) -> Result<String, HandlerError> {
    request
        .str_field(key)
        .map(str::to_string)
        .ok_or_else(|| HandlerError::rejected("missing_field", format!("{key} is required")))
}

/// Fields arrive HTML-escaped; limits and the email check apply to the text the
/// visitor typed.
fn contact_form_is_valid(request: &ActionRequest) -> bool {
    let (Some(name), Some(email), Some(message)) = (
        request.str_field("name"),
        request.str_field("email"),
        request.str_field("message"),
    ) else {
        return false;
    };
    let within = |text: &str, max_chars: usize| unescape_html(text).chars().count() <= max_chars;
    let subject_ok = request
        .str_field("subject")
        .map_or(true, |subject| within(subject, MAX_SUBJECT_CHARS));

    within(name, MAX_NAME_CHARS)
        && within(message, MAX_MESSAGE_CHARS)
        && subject_ok
        && looks_like_email(&unescape_html(email))
}

fn looks_like_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_BYTES || email.contains(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@')
}
