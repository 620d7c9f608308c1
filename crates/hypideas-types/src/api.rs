use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ValidationError;
use crate::models::{BanType, ChatTarget, ReactionType};

// Limits
pub const MAX_TITLE_LENGTH: usize = 200;
pub const MAX_COMMENT_LENGTH: usize = 1000;
pub const MAX_MESSAGE_LENGTH: usize = 1000;
pub const MAX_DISPLAY_NAME_LENGTH: usize = 50;
pub const MIN_PHONE_DIGITS: usize = 10;
pub const OTP_LENGTH: usize = 6;

/// Deepest comment level stored by the backend.
pub const MAX_COMMENT_DEPTH: u8 = 3;

pub const FEED_PAGE_SIZE: usize = 20;
pub const MESSAGE_PAGE_SIZE: usize = 50;

pub const MIN_SEARCH_LENGTH: usize = 2;
/// Results per kind for a targeted search; a mixed search returns half.
pub const SEARCH_LIMIT: usize = 10;

// -- JWT Claims --

/// Claims carried by the backend's access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

// -- Auth --

#[derive(Debug, Clone)]
pub struct ProfileSetup {
    pub display_name: String,
    pub interests: Vec<String>,
}

impl ProfileSetup {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = self.display_name.trim();
        if name.is_empty() {
            return Err(ValidationError::Required("display name"));
        }
        if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
            return Err(ValidationError::TooLong {
                field: "display name",
                max: MAX_DISPLAY_NAME_LENGTH,
            });
        }
        if self.interests.iter().all(|i| i.trim().is_empty()) {
            return Err(ValidationError::Required("at least one interest"));
        }
        Ok(())
    }
}

/// Strip formatting from a phone number and check it has enough digits.
/// Returns the number in `+<digits>` form.
pub fn normalize_phone(raw: &str) -> Result<String, ValidationError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        return Err(ValidationError::Invalid {
            field: "phone number",
            reason: format!("must contain at least {} digits", MIN_PHONE_DIGITS),
        });
    }
    Ok(format!("+{}", digits))
}

pub fn validate_otp(code: &str) -> Result<(), ValidationError> {
    if code.len() != OTP_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::Invalid {
            field: "verification code",
            reason: format!("must be {} digits", OTP_LENGTH),
        });
    }
    Ok(())
}

// -- Posts --

#[derive(Debug, Clone)]
pub struct NewPost {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub category: Option<String>,
}

impl NewPost {
    /// Build a post from raw form input; `tags` is a comma separated list.
    pub fn from_form(title: &str, content: &str, tags: &str, category: Option<&str>) -> Self {
        NewPost {
            title: title.trim().to_string(),
            content: content.trim().to_string(),
            tags: parse_tags(tags),
            category: category
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("title", &self.title, MAX_TITLE_LENGTH)?;
        if self.content.trim().is_empty() {
            return Err(ValidationError::Required("content"));
        }
        Ok(())
    }
}

pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// -- Search --

/// What a search box entry asks for: `@name` finds people, `t/topic` finds
/// posts, anything else finds both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    Users(String),
    Posts(String),
    Everything(String),
}

impl SearchQuery {
    /// `None` until there is enough input to search on.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.chars().count() < MIN_SEARCH_LENGTH {
            return None;
        }
        let query = if let Some(term) = raw.strip_prefix('@') {
            SearchQuery::Users(term.trim().to_string())
        } else if let Some(term) = raw.strip_prefix("t/") {
            SearchQuery::Posts(term.trim().to_string())
        } else {
            SearchQuery::Everything(raw.to_string())
        };
        (!query.term().is_empty()).then_some(query)
    }

    pub fn term(&self) -> &str {
        match self {
            Self::Users(t) | Self::Posts(t) | Self::Everything(t) => t,
        }
    }
}

// -- Comments --

#[derive(Debug, Clone)]
pub struct NewComment {
    pub post_id: Uuid,
    pub parent_comment_id: Option<Uuid>,
    pub content: String,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("comment", &self.content, MAX_COMMENT_LENGTH)
    }
}

// -- Messages --

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub target: ChatTarget,
    pub content: String,
    pub reply_to_message_id: Option<Uuid>,
}

impl NewMessage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("message", &self.content, MAX_MESSAGE_LENGTH)
    }
}

#[derive(Debug, Clone)]
pub struct NewFileMessage {
    pub target: ChatTarget,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl NewFileMessage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.file_name.trim().is_empty() {
            return Err(ValidationError::Required("file name"));
        }
        if self.bytes.is_empty() {
            return Err(ValidationError::Required("file contents"));
        }
        Ok(())
    }

    pub fn extension(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .unwrap_or("bin")
    }
}

// -- Reactions --

/// Outcome of a reaction toggle as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToggleReactionResponse {
    pub reaction_type: ReactionType,
    pub added: bool,
    pub count: usize,
}

// -- Admin --

#[derive(Debug, Clone, Default)]
pub struct UserFilters {
    pub search: Option<String>,
    pub banned: bool,
}

#[derive(Debug, Clone)]
pub struct BanRequest {
    pub user_id: Uuid,
    pub ban_type: BanType,
    pub reason: String,
    /// Length of a temporary ban; `None` means no end time.
    pub duration: Option<chrono::Duration>,
}

impl BanRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.reason.trim().is_empty() {
            return Err(ValidationError::Required("ban reason"));
        }
        if self.ban_type == BanType::Temporary && self.duration.is_none() {
            return Err(ValidationError::Required("ban duration"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewAnnouncement {
    pub title: String,
    pub content: String,
    pub announcement_type: String,
    pub target_audience: String,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl NewAnnouncement {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("title", &self.title, MAX_TITLE_LENGTH)?;
        if self.content.trim().is_empty() {
            return Err(ValidationError::Required("content"));
        }
        Ok(())
    }
}

fn require_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Required(field));
    }
    if trimmed.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}
