use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{multipart, Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::models::{
    AuthResponse, Conversation, FeedPage, LikeState, LoginCredentials, Message,
    NotificationList, Paginated, Post, ProfileUpdate, RegisterData, User,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api/";

/// Supplies the bearer token attached to authenticated requests.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Token provider for requests made before anyone has signed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl TokenProvider for Anonymous {
    fn access_token(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api: transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api: invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api: unauthorized")]
    Unauthorized,
    #[error("api: forbidden: {0}")]
    Forbidden(String),
    #[error("api: not found: {0}")]
    NotFound(String),
    #[error("api: conflict: {0}")]
    Conflict(String),
    #[error("api: rate limited: {0}")]
    RateLimited(String),
    #[error("api: error {status}: {message}")]
    Status { status: u16, message: String },
    #[error("api: request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    /// True when the server understood the request and refused it, as opposed
    /// to the request never completing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ApiError::Forbidden(_)
                | ApiError::NotFound(_)
                | ApiError::Conflict(_)
                | ApiError::Rejected(_)
        )
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

enum Body {
    Empty,
    Json(Value),
    Form(multipart::Form),
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: User,
}

fn default_success() -> bool {
    true
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> ApiResult<Self> {
        let base = config
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&normalize_base(&base))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };
        let user_agent = if config.user_agent.trim().is_empty() {
            format!("murmur/{}", crate::VERSION)
        } else {
            config.user_agent
        };

        Ok(Client {
            token_provider,
            http,
            user_agent,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Same endpoint and HTTP stack, different credentials.
    pub fn with_token_provider(&self, token_provider: Arc<dyn TokenProvider>) -> Self {
        Client {
            token_provider,
            http: self.http.clone(),
            user_agent: self.user_agent.clone(),
            base_url: self.base_url.clone(),
        }
    }

    // auth

    pub fn login(&self, credentials: &LoginCredentials) -> ApiResult<AuthResponse> {
        let body = serde_json::to_value(credentials).map_err(encode_error)?;
        self.send_raw(Method::POST, "auth/login", &[], Body::Json(body))
    }

    pub fn register(&self, data: &RegisterData) -> ApiResult<AuthResponse> {
        let body = serde_json::to_value(data).map_err(encode_error)?;
        self.send_raw(Method::POST, "auth/register", &[], Body::Json(body))
    }

    pub fn logout(&self) -> ApiResult<()> {
        self.send_unit(Method::POST, "auth/logout", Body::Empty)
    }

    pub fn me(&self) -> ApiResult<User> {
        let envelope: UserEnvelope = self.send_raw(Method::GET, "auth/me", &[], Body::Empty)?;
        Ok(envelope.user)
    }

    pub fn update_profile(&self, patch: &ProfileUpdate) -> ApiResult<User> {
        let body = serde_json::to_value(patch).map_err(encode_error)?;
        let envelope: UserEnvelope =
            self.send_raw(Method::PUT, "users/profile", &[], Body::Json(body))?;
        Ok(envelope.user)
    }

    pub fn forgot_password(&self, email: &str) -> ApiResult<()> {
        self.send_unit(
            Method::POST,
            "auth/forgot-password",
            Body::Json(json!({ "email": email })),
        )
    }

    pub fn reset_password(&self, token: &str, password: &str) -> ApiResult<()> {
        self.send_unit(
            Method::PUT,
            &format!("auth/reset-password/{}", token),
            Body::Json(json!({ "password": password })),
        )
    }

    pub fn verify_email(&self, token: &str) -> ApiResult<()> {
        self.send_unit(
            Method::POST,
            &format!("auth/verify-email/{}", token),
            Body::Empty,
        )
    }

    // posts

    pub fn feed(&self, page: u32) -> ApiResult<FeedPage> {
        let params = [("page".to_string(), page.to_string())];
        let listing: Paginated<Post> =
            self.send_raw(Method::GET, "posts/feed", &params, Body::Empty)?;
        Ok(listing.into_feed_page(page))
    }

    pub fn user_posts(&self, username: &str, page: u32) -> ApiResult<FeedPage> {
        let params = [("page".to_string(), page.to_string())];
        let path = format!("users/profile/{}/posts", username);
        let listing: Paginated<Post> = self.send_raw(Method::GET, &path, &params, Body::Empty)?;
        Ok(listing.into_feed_page(page))
    }

    pub fn post(&self, post_id: &str) -> ApiResult<Post> {
        self.send(Method::GET, &format!("posts/{}", post_id), Body::Empty)
    }

    pub fn create_post(&self, content: &str) -> ApiResult<Post> {
        let form = multipart::Form::new().text("content", content.to_string());
        self.send(Method::POST, "posts", Body::Form(form))
    }

    pub fn update_post(&self, post_id: &str, content: &str) -> ApiResult<Post> {
        self.send(
            Method::PUT,
            &format!("posts/{}", post_id),
            Body::Json(json!({ "content": content })),
        )
    }

    pub fn delete_post(&self, post_id: &str) -> ApiResult<()> {
        self.send_unit(Method::DELETE, &format!("posts/{}", post_id), Body::Empty)
    }

    /// The server toggles the caller's like and answers with the new liker set.
    pub fn like_post(&self, post_id: &str) -> ApiResult<LikeState> {
        self.send(
            Method::POST,
            &format!("posts/{}/like", post_id),
            Body::Empty,
        )
    }

    pub fn comment_on_post(&self, post_id: &str, content: &str) -> ApiResult<Value> {
        self.send(
            Method::POST,
            &format!("posts/{}/comments", post_id),
            Body::Json(json!({ "content": content })),
        )
    }

    pub fn share_post(&self, post_id: &str, content: Option<&str>) -> ApiResult<Post> {
        self.send(
            Method::POST,
            &format!("posts/{}/share", post_id),
            Body::Json(json!({ "content": content })),
        )
    }

    // messages

    pub fn conversations(&self) -> ApiResult<Vec<Conversation>> {
        self.send(Method::GET, "messages/conversations", Body::Empty)
    }

    pub fn conversation_with(&self, user_id: &str) -> ApiResult<Conversation> {
        self.send(
            Method::GET,
            &format!("messages/conversation/{}", user_id),
            Body::Empty,
        )
    }

    pub fn messages(&self, conversation_id: &str) -> ApiResult<Vec<Message>> {
        self.send(
            Method::GET,
            &format!("messages/conversation/{}/messages", conversation_id),
            Body::Empty,
        )
    }

    pub fn send_message(&self, conversation_id: &str, content: &str) -> ApiResult<Message> {
        if content.trim().is_empty() {
            return Err(ApiError::Rejected("message content is required".into()));
        }
        let form = multipart::Form::new()
            .text("conversationId", conversation_id.to_string())
            .text("content", content.to_string());
        self.send(Method::POST, "messages", Body::Form(form))
    }

    pub fn edit_message(&self, message_id: &str, content: &str) -> ApiResult<Message> {
        self.send(
            Method::PUT,
            &format!("messages/{}", message_id),
            Body::Json(json!({ "content": content })),
        )
    }

    pub fn delete_message(&self, message_id: &str) -> ApiResult<()> {
        self.send_unit(
            Method::DELETE,
            &format!("messages/{}", message_id),
            Body::Empty,
        )
    }

    pub fn add_reaction(&self, message_id: &str, emoji: &str) -> ApiResult<Message> {
        self.send(
            Method::POST,
            &format!("messages/{}/reaction", message_id),
            Body::Json(json!({ "emoji": emoji })),
        )
    }

    // notifications

    pub fn notifications(&self) -> ApiResult<NotificationList> {
        self.send(Method::GET, "notifications", Body::Empty)
    }

    pub fn mark_notification_read(&self, notification_id: &str) -> ApiResult<()> {
        self.send_unit(
            Method::PUT,
            &format!("notifications/{}/read", notification_id),
            Body::Empty,
        )
    }

    pub fn mark_all_notifications_read(&self) -> ApiResult<()> {
        self.send_unit(Method::PUT, "notifications/read-all", Body::Empty)
    }

    pub fn delete_notification(&self, notification_id: &str) -> ApiResult<()> {
        self.send_unit(
            Method::DELETE,
            &format!("notifications/{}", notification_id),
            Body::Empty,
        )
    }

    /// Sends a request and unwraps the `{ success, data }` envelope.
    fn send<T>(&self, method: Method, path: &str, body: Body) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let envelope: Envelope<T> = self.send_raw(method, path, &[], body)?;
        if !envelope.success {
            return Err(ApiError::Rejected(
                envelope.message.unwrap_or_else(|| "request failed".into()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| ApiError::Rejected(format!("{}: response carried no data", path)))
    }

    fn send_unit(&self, method: Method, path: &str, body: Body) -> ApiResult<()> {
        let resp = self.request(method, path, &[], body)?;
        let text = resp.text()?;
        if text.trim().is_empty() {
            return Ok(());
        }
        if let Ok(envelope) = serde_json::from_str::<Envelope<Value>>(&text) {
            if !envelope.success {
                return Err(ApiError::Rejected(
                    envelope.message.unwrap_or_else(|| "request failed".into()),
                ));
            }
        }
        Ok(())
    }

    fn send_raw<T>(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Body,
    ) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(method, path, params, body)?;
        Ok(resp.json()?)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Body,
    ) -> ApiResult<Response> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        debug!("api request {} {}", method, url);
        let mut req: RequestBuilder = self.http.request(method, url);
        req = req.header(USER_AGENT, self.user_agent.clone());
        req = req.header(ACCEPT, "application/json");
        if let Some(token) = self.token_provider.access_token() {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        req = match body {
            Body::Empty => req,
            Body::Json(value) => req.json(&value),
            Body::Form(form) => req.multipart(form),
        };

        let resp = req.send()?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        let message = error_message(&text);
        Err(match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            429 => ApiError::RateLimited(message),
            code => ApiError::Status {
                status: code,
                message,
            },
        })
    }
}

fn normalize_base(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed
            .message
            .or(parsed.error)
            .unwrap_or_else(|| body.trim().to_string()),
        Err(_) => body.trim().to_string(),
    }
}

fn encode_error(err: serde_json::Error) -> ApiError {
    ApiError::Rejected(format!("encode request body: {}", err))
}
