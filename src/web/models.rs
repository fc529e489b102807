use serde::{Deserialize, Serialize};

fn default_max_new_tokens() -> i64 {
    96
}

fn default_top_p() -> f64 {
    1.0
}

// One retrieved knowledge snippet. Order matters: items are numbered in the
// rendered context block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    #[serde(default)]
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub context: Option<Vec<ContextItem>>,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: i64,
    // Accepted for schema compatibility; decoding is always deterministic,
    // so these are never forwarded to the generation call.
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}
