//! Console notices for user presence and renames.

use super::context::SubscriptionEventContext;
use super::DbConnection;
use crate::error::SyncError;
use crate::schema::User;

/// "`<name>` is online" for a newly seen online user.
pub fn insert_notice(user: &User) -> Option<String> {
    user.online
        .then(|| format!("{} is online", user.name_or_identity()))
}

/// Rename and presence notices for one user update, rename first.
pub fn update_notices(old: &User, new: &User) -> Vec<String> {
    let mut notices = Vec::new();
    if old.name != new.name {
        notices.push(format!(
            "{} renamed to {}",
            old.name_or_identity(),
            new.name.as_deref().unwrap_or_default()
        ));
    }
    if old.online != new.online {
        let verb = if new.online { "connected" } else { "disconnected" };
        notices.push(format!("{} {}.", new.name_or_identity(), verb));
    }
    notices
}

pub fn rename_failure_notice(name: &str, reason: &str) -> String {
    format!("Failed to change name to {}: {}", name, reason)
}

/// "Connected" followed by one line per cached user.
pub fn applied_notices(ctx: &SubscriptionEventContext<'_>) -> Vec<String> {
    let mut notices = vec!["Connected".to_string()];
    for user in ctx.db.iter::<User>() {
        let rendered = serde_json::to_string(user).unwrap_or_else(|_| format!("{:?}", user));
        notices.push(format!("{} updated!", rendered));
    }
    notices
}

pub fn disconnect_notice(error: Option<&SyncError>) -> String {
    match error {
        Some(e) => format!("Disconnected abnormally: {}", e),
        None => "Disconnected normally.".to_string(),
    }
}

pub fn connect_error_notice(error: &SyncError) -> String {
    format!("Error while connecting: {}", error)
}

/// Wire the user notices into `conn`, sending each line to `sink`.
///
/// Rename failures are only reported for this client's own calls.
pub fn register<S>(conn: &mut DbConnection, sink: S)
where
    S: Fn(String) + Clone + Send + 'static,
{
    let out = sink.clone();
    conn.on_insert::<User>(move |_, user| {
        if let Some(notice) = insert_notice(user) {
            out(notice);
        }
    });

    let out = sink.clone();
    conn.on_update::<User>(move |_, old, new| {
        update_notices(old, new).into_iter().for_each(&out);
    });

    conn.on_set_user_name(move |ctx, name| {
        if let (true, Some(reason)) = (ctx.is_own_call(), ctx.event.status.failure()) {
            sink(rename_failure_notice(name, reason));
        }
    });
}
