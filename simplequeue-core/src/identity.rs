// simplequeue-core/src/identity.rs
//! Process identity used in consumer tags and correlation tokens.

use once_cell::sync::Lazy;
use uuid::Uuid;

const MAX_LABEL_LEN: usize = 64;
const MAX_HOST_LEN: usize = 64;

// Host name plus a random token, fixed for the life of the process.
static NODE: Lazy<String> = Lazy::new(|| {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| sanitize(&h, MAX_HOST_LEN))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let token = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &token[..8])
});

/// `<label>-<pid>-<host>-<token>`. Stable for the process, distinct across
/// co-located processes, safe as an AMQP short string.
pub fn machine_string(label: &str) -> String {
    format!(
        "{}-{}-{}",
        short_label(label),
        std::process::id(),
        NODE.as_str()
    )
}

pub fn consumer_tag(label: &str) -> String {
    format!("csm-{}", machine_string(label))
}

/// Identity plus a per-call unique suffix.
pub fn correlation_token(label: &str) -> String {
    format!("{}-{}", machine_string(label), Uuid::new_v4().simple())
}

// Type paths like `my_app::jobs::SendMail` keep only `SendMail`.
fn short_label(label: &str) -> String {
    let last = label.rsplit("::").next().unwrap_or(label);
    sanitize(last, MAX_LABEL_LEN)
}

fn sanitize(raw: &str, max_len: usize) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect()
}
