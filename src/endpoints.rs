//! Typed wrappers for the backend routes
//!
//! JSON routes go through [`ApiClient::request`] and take part in the
//! refresh-and-retry cycle. Check-in and check-out upload a photo as
//! multipart form data and are sent exactly once.

use crate::client::{bearer, decode, ApiClient, RequestOptions};
use crate::error::{ApiError, Result};
use crate::token_store::TokenStorage;
use crate::types::*;
use bytes::Bytes;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};

/// Photo taken for a check-in or check-out
#[derive(Debug, Clone)]
pub struct Photo {
    data: Bytes,
    content_type: String,
}

impl Photo {
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }

    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self::new(data, "image/jpeg")
    }

    /// Read a photo from disk; the content type follows the file extension
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let content_type = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            Some("heic") => "image/heic",
            _ => "image/jpeg",
        };
        Ok(Self::new(data, content_type))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

#[derive(Debug, Clone, Copy)]
enum Punch {
    In,
    Out,
}

impl Punch {
    fn endpoint(self) -> &'static str {
        match self {
            Self::In => "/timelog/checkin",
            Self::Out => "/timelog/checkout",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::In => "checkin.jpg",
            Self::Out => "checkout.jpg",
        }
    }
}

impl<S: TokenStorage> ApiClient<S> {
    /// Log in and store the returned tokens
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let options = RequestOptions::post().with_json(json!({ "email": email, "password": password }));
        let response = self.sign_in("/auth/login", &options).await?;
        info!("Logged in");
        Ok(response)
    }

    /// Create an account and store the returned tokens
    pub async fn register(&self, data: &RegisterData) -> Result<AuthResponse> {
        let options = RequestOptions::post().with_json(serde_json::to_value(data)?);
        let response = self.sign_in("/auth/register", &options).await?;
        info!("Registered new account");
        Ok(response)
    }

    /// Create a manager account together with its company
    pub async fn register_manager(&self, data: &ManagerRegisterData) -> Result<AuthResponse> {
        let options = RequestOptions::post().with_json(serde_json::to_value(data)?);
        let response = self.sign_in("/auth/register-manager", &options).await?;
        info!(company = %data.company.name, "Registered manager account");
        Ok(response)
    }

    /// Sign up with an invitation code
    ///
    /// When the company requires approval the response has
    /// `requires_approval` set and carries no tokens; the caller stays
    /// signed out until a manager approves the account.
    pub async fn register_employee(&self, data: &EmployeeRegisterData) -> Result<AuthResponse> {
        let options = RequestOptions::post().with_json(serde_json::to_value(data)?);
        let response = self.sign_in("/auth/register-employee", &options).await?;
        if response.requires_approval {
            info!("Employee registered, awaiting manager approval");
        } else {
            info!("Registered employee account");
        }
        Ok(response)
    }

    /// Post credentials and keep the tokens, if the server issued both
    async fn sign_in(&self, endpoint: &str, options: &RequestOptions) -> Result<AuthResponse> {
        let response: AuthResponse = self.request(endpoint, options, false).await?;
        match response.tokens() {
            Some(tokens) => self.set_tokens(&tokens.access_token, &tokens.refresh_token).await,
            None => debug!(endpoint = %endpoint, "No tokens in auth response"),
        }
        Ok(response)
    }

    /// Exchange the stored refresh token for a new pair
    ///
    /// Joins a refresh that is already in flight instead of sending another.
    pub async fn refresh_tokens(&self) -> Result<TokenPair> {
        self.join_refresh().await.map_err(|failure| ApiError::Auth {
            reason: failure.reason,
            message: failure.detail.clone(),
            cause: failure.detail,
        })
    }

    /// Invalidate the session server-side, then forget the tokens
    pub async fn logout(&self) -> Result<MessageResponse> {
        let response = self.request("/auth/logout", &RequestOptions::post(), true).await?;
        self.clear_tokens().await;
        info!("Logged out");
        Ok(response)
    }

    pub async fn profile(&self) -> Result<ProfileResponse> {
        self.request("/auth/profile", &RequestOptions::get(), true).await
    }

    pub async fn check_in(&self, photo: Photo, position: Coordinates) -> Result<TimeLogResponse> {
        self.upload_punch(Punch::In, photo, position).await
    }

    pub async fn check_out(&self, photo: Photo, position: Coordinates) -> Result<TimeLogResponse> {
        self.upload_punch(Punch::Out, photo, position).await
    }

    /// Time logs of the signed-in user
    pub async fn time_logs(&self) -> Result<Vec<TimeLog>> {
        self.request("/timelog", &RequestOptions::get(), true).await
    }

    /// Photo uploads are not replayed after a refresh: a 401 here is
    /// returned to the caller like any other status.
    async fn upload_punch(&self, punch: Punch, photo: Photo, position: Coordinates) -> Result<TimeLogResponse> {
        let endpoint = punch.endpoint();
        let size = photo.len();

        let part = Part::bytes(photo.data.to_vec())
            .file_name(punch.file_name())
            .mime_str(&photo.content_type)
            .map_err(|e| ApiError::Configuration(format!("invalid photo content type: {e}")))?;
        let form = Form::new()
            .part("photo", part)
            .text("latitude", position.latitude.to_string())
            .text("longitude", position.longitude.to_string());

        // no Content-Type here: reqwest sets multipart/form-data with its boundary
        let mut builder = self.http().post(self.url(endpoint)).multipart(form);
        if let Some(token) = self.access_token().await {
            builder = builder.header(AUTHORIZATION, bearer(&token)?);
        }

        info!(
            endpoint = %endpoint,
            photo_bytes = %size,
            latitude = %position.latitude,
            longitude = %position.longitude,
            "Uploading time log photo"
        );
        let body = self.dispatch(endpoint, builder, self.config().upload_timeout).await?;
        decode(endpoint, &body)
    }

    pub async fn company(&self) -> Result<CompanyResponse> {
        self.request("/company", &RequestOptions::get(), true).await
    }

    pub async fn update_company(&self, data: &UpdateCompanyData) -> Result<CompanyResponse> {
        let options = RequestOptions::put().with_json(serde_json::to_value(data)?);
        self.request("/company", &options, true).await
    }

    /// One page of the company's invitations, optionally filtered by status
    pub async fn invitations(&self, page: u32, limit: u32, status: Option<&str>) -> Result<InvitationPage> {
        let mut options = RequestOptions::get().with_query("page", page).with_query("limit", limit);
        if let Some(status) = status {
            options = options.with_query("status", status);
        }
        self.request("/invitations", &options, true).await
    }

    pub async fn create_invitation(&self, data: &CreateInvitationData) -> Result<InvitationResponse> {
        let options = RequestOptions::post().with_json(serde_json::to_value(data)?);
        let response = self.request("/invitations", &options, true).await?;
        debug!(email = %data.email, "Invitation created");
        Ok(response)
    }

    pub async fn cancel_invitation(&self, invitation_id: i64) -> Result<MessageResponse> {
        self.request(&format!("/invitations/{invitation_id}"), &RequestOptions::delete(), true)
            .await
    }

    /// Employees waiting for a manager's approval
    pub async fn pending_employees(
        &self,
        page: u32,
        limit: u32,
        search: Option<&str>,
    ) -> Result<PendingEmployeesPage> {
        let mut options = RequestOptions::get().with_query("page", page).with_query("limit", limit);
        if let Some(search) = search.filter(|s| !s.is_empty()) {
            options = options.with_query("search", search);
        }
        self.request("/users/pending", &options, true).await
    }

    pub async fn approve_employee(&self, employee_id: &str, approved: bool, notes: Option<&str>) -> Result<MessageResponse> {
        let body = ApprovalRequest {
            approved,
            approval_notes: notes.filter(|n| !n.is_empty()),
        };
        let options = RequestOptions::patch().with_json(serde_json::to_value(&body)?);
        self.request(&format!("/users/{employee_id}/approval"), &options, true)
            .await
    }
}
