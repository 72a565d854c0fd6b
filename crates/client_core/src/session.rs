use shared::domain::UserId;

/// Explicit session state, constructed once at session start and threaded
/// into the components that need it. There is no process-wide "current
/// user" anywhere in this layer.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: UserId,
    pub device_label: String,
}

impl SessionContext {
    pub fn new(user_id: UserId, device_label: impl Into<String>) -> Self {
        Self {
            user_id,
            device_label: device_label.into(),
        }
    }
}
