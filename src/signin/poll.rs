use std::time::Duration;

use crate::store::DelegatedTokenStore;
use crate::token::DelegatedToken;

/// Poll the store until a usable token for `subject` appears.
///
/// Hosted sign-in completes in another process, which deposits the token in
/// the shared backend. Read failures are logged and retried on the next
/// tick. The loop never ends on its own; callers bound it with a deadline.
pub async fn poll_for_token(
    store: &DelegatedTokenStore,
    subject: &str,
    interval: Duration,
) -> DelegatedToken {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match store.peek(subject).await {
            Ok(Some(mut token)) if token.is_usable() => {
                if token.subject.is_empty() {
                    token.subject = subject.to_string();
                }
                tracing::debug!(subject, "hosted sign-in token found");
                return token;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(subject, "hosted sign-in poll read failed: {e}"),
        }
    }
}
