use time::OffsetDateTime;

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Join a base URL and a path, tolerating trailing/leading slashes and a
/// version segment already present on the base.
pub fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    for version in ["v1", "v1beta", "v4"] {
        let with_slash = format!("{version}/");
        if base.ends_with(&format!("/{version}")) && path.starts_with(&with_slash) {
            path = &path[with_slash.len()..];
        }
    }
    format!("{base}/{path}")
}

pub fn chat_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn response_id() -> String {
    format!("resp_{}", uuid::Uuid::new_v4().simple())
}

pub fn message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub fn call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

pub fn reasoning_id() -> String {
    format!("rs_{}", uuid::Uuid::new_v4().simple())
}
