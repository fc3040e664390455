//! Background purge of expired sessions
//!
//! Validation already deletes an expired session when it is presented, but
//! sessions that are never presented again would stay in storage forever.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::session::SessionService;

/// Spawn a task that calls [`SessionService::purge_expired`] every `every`.
///
/// Returns `None` when `every` is zero. The first purge runs immediately.
/// Failures are logged and the task keeps going.
pub fn spawn_expired_session_sweeper(
    service: Arc<SessionService>,
    every: Duration,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        tracing::info!("Expired session sweeper disabled");
        return None;
    }

    tracing::info!(interval_secs = every.as_secs(), "Starting expired session sweeper");

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match service.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Purged expired sessions"),
                Err(e) => tracing::warn!(error = %e, "Expired session sweep failed"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::MemorySessionRepository;
    use crate::services::clock::ManualClock;
    use chrono::Utc;

    #[tokio::test]
    async fn test_zero_interval_disables_sweeper() {
        let service = Arc::new(SessionService::new(MemorySessionRepository::boxed()));
        assert!(spawn_expired_session_sweeper(service, Duration::ZERO).is_none());
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_sessions() {
        let d0 = Utc::now();
        let repo = MemorySessionRepository::new();
        let clock = Arc::new(ManualClock::new(d0));
        let service = Arc::new(
            SessionService::new(Arc::new(repo.clone())).with_clock(clock.clone()),
        );

        service.create_session(1).await.unwrap();
        service.create_session(2).await.unwrap();
        clock.advance(chrono::Duration::days(31));

        let handle = spawn_expired_session_sweeper(service, Duration::from_millis(10))
            .expect("sweeper should start");

        for _ in 0..100 {
            if repo.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweeper_survives_failures() {
        let repo = MemorySessionRepository::new();
        let service = Arc::new(SessionService::new(Arc::new(repo.clone())));
        repo.faults().fail_begin(true);

        let handle = spawn_expired_session_sweeper(service, Duration::from_millis(5))
            .expect("sweeper should start");
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!handle.is_finished());
        handle.abort();
    }
}
