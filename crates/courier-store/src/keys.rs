//! Cache key layout.
//!
//! Projection tables record their staleness timestamp under the same keys so
//! `is_data_stale` works uniformly for entries and projections.

pub fn messages(chat_id: &str) -> String {
    format!("messages:{chat_id}")
}

pub fn chat_previews(owner_id: &str) -> String {
    format!("chat_previews:{owner_id}")
}

pub fn typing(chat_id: &str, user_id: &str) -> String {
    format!("typing:{chat_id}:{user_id}")
}

pub fn profile(user_id: &str) -> String {
    format!("profile:{user_id}")
}
