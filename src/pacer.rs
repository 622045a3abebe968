//! Per-account call-budget pacing.
//!
//! The platform enforces two caps per external account: a burst cap per
//! 60-second window and a daily allotment (UTC calendar day). Budget is
//! reserved *before* the call goes out: the reservation is a guarded counter
//! update, so two workers racing on the same account can never both spend the
//! last slot. A failed call still burns its reservation; that keeps the
//! quota invariant unconditional at the cost of occasional under-use.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::instrument;

use crate::config::Limits;
use crate::db::{self, Pool};

// Each lost race means another worker applied an update, so the loop makes
// global progress; the bound only guards against pathological contention.
const CAS_ATTEMPTS: usize = 32;

/// Which window rejected the reservation. The day window forces multi-day
/// continuation; the minute window is a short pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedWindow {
    Minute,
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied {
        resume_at: DateTime<Utc>,
        window: DeniedWindow,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    pub minute_cap: i64,
    pub day_cap: i64,
}

impl Pacer {
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            minute_cap: limits.minute_cap,
            day_cap: limits.day_cap,
        }
    }

    /// Reserve one creation call for `account_ref`, or report when capacity
    /// returns. The ledger row is shared by every job targeting the account.
    #[instrument(skip_all)]
    pub async fn try_reserve(
        &self,
        pool: &Pool,
        account_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let today = now.date_naive();
        db::ensure_ledger_row(pool, account_ref, now, today).await?;

        for _ in 0..CAS_ATTEMPTS {
            let snap = db::ledger_snapshot(pool, account_ref)
                .await?
                .ok_or_else(|| anyhow!("ledger row missing for {}", account_ref))?;

            // Effective counters after window expiry.
            let minute_expired = now - snap.minute_window_start >= Duration::seconds(60);
            let (minute_start, minute_count) = if minute_expired {
                (now, 0)
            } else {
                (snap.minute_window_start, snap.minute_count)
            };
            let (day, day_count) = if snap.day_date != today {
                (today, 0)
            } else {
                (snap.day_date, snap.day_count)
            };

            let minute_full = minute_count >= self.minute_cap;
            let day_full = day_count >= self.day_cap;
            if minute_full || day_full {
                let minute_resume = minute_start + Duration::seconds(60);
                let day_resume = next_day_start(day);
                // When both windows are exhausted the later instant governs.
                let (resume_at, window) = if day_full && (!minute_full || day_resume >= minute_resume)
                {
                    (day_resume, DeniedWindow::Day)
                } else {
                    (minute_resume, DeniedWindow::Minute)
                };
                return Ok(Decision::Denied { resume_at, window });
            }

            let applied = db::cas_update_ledger(
                pool,
                account_ref,
                minute_start,
                minute_count + 1,
                day,
                day_count + 1,
                snap.minute_count,
                snap.day_count,
            )
            .await?;
            if applied {
                return Ok(Decision::Allowed);
            }
            // Lost the race with another worker; re-read and retry.
        }
        Err(anyhow!(
            "ledger contention for {} exceeded {} attempts",
            account_ref,
            CAS_ATTEMPTS
        ))
    }
}

fn next_day_start(day: NaiveDate) -> DateTime<Utc> {
    let next = day.succ_opt().unwrap_or(day);
    next.and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_pool() -> Pool {
        // One connection: a pooled `sqlite::memory:` would hand each
        // connection its own empty database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn pacer() -> Pacer {
        Pacer {
            minute_cap: 15,
            day_cap: 100,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn allows_until_minute_cap_then_names_resume_time() {
        let pool = setup_pool().await;
        let p = pacer();
        let start = at(9, 0, 0);

        for i in 0..15 {
            let now = start + Duration::seconds(i);
            assert_eq!(
                p.try_reserve(&pool, "acct", now).await.unwrap(),
                Decision::Allowed
            );
        }

        match p.try_reserve(&pool, "acct", start + Duration::seconds(20)).await.unwrap() {
            Decision::Denied { resume_at, window } => {
                assert_eq!(window, DeniedWindow::Minute);
                // Window anchors at the first call, not the denied one.
                assert_eq!(resume_at, start + Duration::seconds(60));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn minute_window_resets_after_sixty_seconds() {
        let pool = setup_pool().await;
        let p = pacer();
        let start = at(9, 0, 0);

        for _ in 0..15 {
            p.try_reserve(&pool, "acct", start).await.unwrap();
        }
        assert!(matches!(
            p.try_reserve(&pool, "acct", start + Duration::seconds(59)).await.unwrap(),
            Decision::Denied { .. }
        ));
        assert_eq!(
            p.try_reserve(&pool, "acct", start + Duration::seconds(60))
                .await
                .unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn day_cap_denies_until_next_utc_midnight() {
        let pool = setup_pool().await;
        let p = Pacer {
            minute_cap: 1000,
            day_cap: 100,
        };
        let start = at(9, 0, 0);

        for _ in 0..100 {
            assert_eq!(
                p.try_reserve(&pool, "acct", start).await.unwrap(),
                Decision::Allowed
            );
        }
        match p.try_reserve(&pool, "acct", start).await.unwrap() {
            Decision::Denied { resume_at, window } => {
                assert_eq!(window, DeniedWindow::Day);
                assert_eq!(resume_at, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // A new calendar day restores capacity.
        let tomorrow = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 1).unwrap();
        assert_eq!(
            p.try_reserve(&pool, "acct", tomorrow).await.unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn day_denial_wins_when_both_windows_are_full() {
        let pool = setup_pool().await;
        let p = Pacer {
            minute_cap: 5,
            day_cap: 5,
        };
        let start = at(23, 0, 0);
        for _ in 0..5 {
            p.try_reserve(&pool, "acct", start).await.unwrap();
        }
        match p.try_reserve(&pool, "acct", start).await.unwrap() {
            Decision::Denied { window, resume_at } => {
                assert_eq!(window, DeniedWindow::Day);
                assert!(resume_at > start + Duration::seconds(60));
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accounts_do_not_share_budget() {
        let pool = setup_pool().await;
        let p = Pacer {
            minute_cap: 1,
            day_cap: 100,
        };
        let now = at(12, 0, 0);

        assert_eq!(
            p.try_reserve(&pool, "acct-a", now).await.unwrap(),
            Decision::Allowed
        );
        assert!(matches!(
            p.try_reserve(&pool, "acct-a", now).await.unwrap(),
            Decision::Denied { .. }
        ));
        assert_eq!(
            p.try_reserve(&pool, "acct-b", now).await.unwrap(),
            Decision::Allowed
        );
    }

    #[tokio::test]
    async fn concurrent_reservations_never_exceed_cap() {
        let pool = setup_pool().await;
        let p = Pacer {
            minute_cap: 10,
            day_cap: 100,
        };
        let now = at(15, 0, 0);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                p.try_reserve(&pool, "acct", now).await.unwrap()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() == Decision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);

        let snap = db::ledger_snapshot(&pool, "acct").await.unwrap().unwrap();
        assert_eq!(snap.minute_count, 10);
        assert_eq!(snap.day_count, 10);
    }
}
