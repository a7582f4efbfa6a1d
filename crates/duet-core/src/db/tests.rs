//! Database tests

use super::*;
use crate::models::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::merchant::MerchantCandidate;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn merchant(db: &Database, name: &str) -> Merchant {
        db.resolve_merchant(&MerchantCandidate::new(name).unwrap())
            .unwrap()
    }

    fn new_tx(merchant_id: i64, channel: Channel, amount: Decimal, at: DateTime<Utc>) -> NewTransaction {
        NewTransaction {
            user_id: "user-1".to_string(),
            raw_text: format!("Rs.{} paid", amount),
            amount,
            merchant_id,
            channel,
            sender_info: None,
            transaction_date: at,
        }
    }

    fn pending(expires: DateTime<Utc>) -> NewMetadata {
        NewMetadata {
            product_details: None,
            direction: TransactionDirection::Debit,
            payment_mode: PaymentMode::Unknown,
            match_expires_at: expires,
        }
    }

    fn schedule(kind: JobKind, not_before: DateTime<Utc>) -> JobSchedule {
        JobSchedule {
            kind,
            not_before,
            max_attempts: 3,
            backoff_ms: 3000,
        }
    }

    fn create(db: &Database, channel: Channel, amount: i64, at: DateTime<Utc>) -> Transaction {
        let m = merchant(db, "SWIGGY");
        db.create_transaction_with_metadata(
            &new_tx(m.id, channel, Decimal::new(amount, 0), at),
            &pending(at + Duration::minutes(10)),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_in_memory_db() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.count_transactions().unwrap(), 0);
        assert_eq!(db.count_merchants().unwrap(), 0);
        assert!(db.list_jobs(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_schema_exists() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('merchants', 'transactions', 'transaction_metadata', 'enrichment_jobs', 'absorbed_submissions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);

        let live_index: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_jobs_live_key'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(live_index, 1, "one-live-job-per-key index should exist");
    }

    // =========================================================================
    // Merchants
    // =========================================================================

    #[test]
    fn test_merchant_reuse_by_key_and_name() {
        let db = Database::in_memory().unwrap();

        let a = merchant(&db, "Zomato");
        let b = merchant(&db, "ZOMATO");
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "Zomato", "first spelling is kept");
        assert_eq!(db.count_merchants().unwrap(), 1);

        let c = merchant(&db, "ZOMATO LTD");
        assert_ne!(a.id, c.id);
        assert_eq!(db.count_merchants().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_merchant_resolution_creates_one_row() {
        let db = Database::in_memory().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || merchant(&db, "BIGBASKET").id)
            })
            .collect();
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(db.count_merchants().unwrap(), 1);
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    #[test]
    fn test_create_transaction_with_metadata() {
        let db = Database::in_memory().unwrap();
        let at = t0();
        let tx = create(&db, Channel::Fast, 500, at);

        let stored = db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(stored.amount, Decimal::new(500, 0));
        assert_eq!(stored.channel, Channel::Fast);
        assert_eq!(stored.transaction_date, at);
        assert!(!stored.processed);

        let meta = db.get_metadata(tx.id).unwrap().unwrap();
        assert_eq!(meta.match_status, MatchStatus::Pending);
        assert_eq!(meta.match_expires_at, Some(at + Duration::minutes(10)));
        assert_eq!(meta.direction, TransactionDirection::Debit);

        // No follow-up requested
        assert!(db.live_job_for(tx.id).unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_non_positive_amount() {
        let db = Database::in_memory().unwrap();
        let m = merchant(&db, "SWIGGY");
        let result = db.create_transaction_with_metadata(
            &new_tx(m.id, Channel::Fast, Decimal::ZERO, t0()),
            &pending(t0()),
            None,
        );
        assert!(matches!(result, Err(Error::InvalidData(_))));
        assert_eq!(db.count_transactions().unwrap(), 0);
    }

    #[test]
    fn test_create_truncates_long_text() {
        let db = Database::in_memory().unwrap();
        let m = merchant(&db, "SWIGGY");
        let mut long = new_tx(m.id, Channel::Slow, Decimal::ONE, t0());
        long.raw_text = "₹".repeat(MAX_RAW_TEXT_LEN + 50);
        long.sender_info = Some("s".repeat(MAX_SENDER_LEN + 1));

        let tx = db
            .create_transaction_with_metadata(&long, &pending(t0()), None)
            .unwrap();
        let stored = db.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(stored.raw_text.chars().count(), MAX_RAW_TEXT_LEN);
        assert_eq!(stored.sender_info.unwrap().len(), MAX_SENDER_LEN);
    }

    #[test]
    fn test_create_with_follow_up_job() {
        let db = Database::in_memory().unwrap();
        let m = merchant(&db, "SWIGGY");
        let at = t0();
        let tx = db
            .create_transaction_with_metadata(
                &new_tx(m.id, Channel::Fast, Decimal::new(250, 0), at),
                &pending(at + Duration::minutes(10)),
                Some(&schedule(JobKind::RetryMatch, at + Duration::minutes(1))),
            )
            .unwrap();

        let job = db.live_job_for(tx.id).unwrap().unwrap();
        assert_eq!(job.kind, JobKind::RetryMatch);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.not_before, at + Duration::minutes(1));
        assert_eq!(job.payload.amount, Decimal::new(250, 0));
        assert_eq!(job.payload.user_id, "user-1");
    }

    #[test]
    fn test_find_similar_transactions_bounds() {
        let db = Database::in_memory().unwrap();
        let at = t0();
        let tx = create(&db, Channel::Fast, 1000, at);
        let m = tx.merchant_id;

        let found = db
            .find_similar_transactions(
                "user-1",
                m,
                Channel::Fast,
                Decimal::new(995, 0),
                Decimal::new(1005, 0),
                at,
                at + Duration::minutes(10),
            )
            .unwrap();
        assert_eq!(found.len(), 1, "window bounds are inclusive");

        let other_channel = db
            .find_similar_transactions(
                "user-1",
                m,
                Channel::Slow,
                Decimal::new(995, 0),
                Decimal::new(1005, 0),
                at,
                at,
            )
            .unwrap();
        assert!(other_channel.is_empty());

        let out_of_range = db
            .find_similar_transactions(
                "user-1",
                m,
                Channel::Fast,
                Decimal::new(1001, 0),
                Decimal::new(1010, 0),
                at,
                at,
            )
            .unwrap();
        assert!(out_of_range.is_empty());
    }

    #[test]
    fn test_complete_enrichment_only_once() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());

        assert!(db
            .complete_enrichment(tx.id, "fp", "sig", Some("Food & Dining"))
            .unwrap());
        assert!(!db.complete_enrichment(tx.id, "fp2", "sig2", None).unwrap());

        let stored = db.get_transaction(tx.id).unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.fingerprint.as_deref(), Some("fp"));
        assert_eq!(stored.category.as_deref(), Some("Food & Dining"));
        assert_eq!(db.count_processed().unwrap(), (1, 0));
    }

    // =========================================================================
    // Match state
    // =========================================================================

    #[test]
    fn test_claim_match_is_single_use() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        let enrichment = MatchEnrichment {
            product_details: Some("Masala Dosa".to_string()),
            direction: TransactionDirection::Unknown,
            payment_mode: PaymentMode::Upi,
        };

        let now = t0() + Duration::minutes(2);
        assert!(db.claim_match(tx.id, &enrichment, now).unwrap());
        assert!(!db.claim_match(tx.id, &enrichment, now).unwrap());

        let meta = db.get_metadata(tx.id).unwrap().unwrap();
        assert_eq!(meta.match_status, MatchStatus::Matched);
        assert_eq!(meta.match_expires_at, None);
        assert_eq!(meta.product_details.as_deref(), Some("Masala Dosa"));
        // UNKNOWN from the submission keeps the stored direction
        assert_eq!(meta.direction, TransactionDirection::Debit);
        assert_eq!(meta.payment_mode, PaymentMode::Upi);
    }

    #[test]
    fn test_claim_match_refuses_expired() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());

        let at_expiry = t0() + Duration::minutes(10);
        assert!(!db
            .claim_match(tx.id, &MatchEnrichment::default(), at_expiry)
            .unwrap());
        assert_eq!(
            db.get_metadata(tx.id).unwrap().unwrap().match_status,
            MatchStatus::Pending
        );
    }

    #[test]
    fn test_pending_candidates_exclude_expired_and_matched() {
        let db = Database::in_memory().unwrap();
        let a = create(&db, Channel::Fast, 500, t0());
        let b = create(&db, Channel::Fast, 500, t0() + Duration::minutes(1));

        let search = |now| {
            db.find_pending_candidates(
                "user-1",
                Channel::Fast,
                Decimal::new(495, 0),
                Decimal::new(505, 0),
                t0() - Duration::minutes(15),
                t0() + Duration::minutes(15),
                now,
            )
            .unwrap()
            .into_iter()
            .map(|c| c.transaction.id)
            .collect::<Vec<_>>()
        };

        assert_eq!(search(t0() + Duration::minutes(5)), vec![a.id, b.id]);
        // a expires at +10, b at +11
        assert_eq!(search(t0() + Duration::seconds(630)), vec![b.id]);

        db.claim_match(b.id, &MatchEnrichment::default(), t0() + Duration::minutes(5))
            .unwrap();
        assert_eq!(search(t0() + Duration::minutes(5)), vec![a.id]);
    }

    fn absorbed(merchant_id: i64, amount: i64, at: DateTime<Utc>) -> NewAbsorbedSubmission {
        NewAbsorbedSubmission {
            user_id: "user-1".to_string(),
            merchant_id,
            channel: Channel::Slow,
            amount: Decimal::new(amount, 0),
            raw_text: format!("Order total INR {}", amount),
            observed_at: at,
        }
    }

    #[test]
    fn test_claim_and_absorb_records_submission() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        let now = t0() + Duration::minutes(2);
        let submission = absorbed(tx.merchant_id, 500, now);

        assert!(db
            .claim_and_absorb(tx.id, &MatchEnrichment::default(), &submission, now)
            .unwrap());
        // A losing claim leaves no absorbed row behind
        assert!(!db
            .claim_and_absorb(tx.id, &MatchEnrichment::default(), &submission, now)
            .unwrap());

        let rows = db.list_absorbed_submissions(tx.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel, Channel::Slow);
        assert_eq!(rows[0].amount, Decimal::new(500, 0));
        assert_eq!(rows[0].observed_at, now);

        let found = db
            .find_absorbed_submissions(
                "user-1",
                tx.merchant_id,
                Channel::Slow,
                Decimal::new(495, 0),
                Decimal::new(505, 0),
                now - Duration::minutes(10),
                now,
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transaction_id, tx.id);

        // Other channel or amount out of range
        assert!(db
            .find_absorbed_submissions(
                "user-1",
                tx.merchant_id,
                Channel::Fast,
                Decimal::new(495, 0),
                Decimal::new(505, 0),
                now - Duration::minutes(10),
                now,
            )
            .unwrap()
            .is_empty());
        assert!(db
            .find_absorbed_submissions(
                "user-1",
                tx.merchant_id,
                Channel::Slow,
                Decimal::new(600, 0),
                Decimal::new(610, 0),
                now - Duration::minutes(10),
                now,
            )
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_absorb_late_record_is_atomic() {
        let db = Database::in_memory().unwrap();
        let fast = create(&db, Channel::Fast, 500, t0());
        let slow = create(&db, Channel::Slow, 500, t0() + Duration::minutes(1));
        let now = t0() + Duration::minutes(2);

        // The late record is taken first; the canonical one must not be left
        // half-claimed
        assert!(db.claim_match(slow.id, &MatchEnrichment::default(), now).unwrap());
        assert!(!db
            .absorb_late_record(fast.id, slow.id, &MatchEnrichment::default(), now)
            .unwrap());
        assert_eq!(
            db.get_metadata(fast.id).unwrap().unwrap().match_status,
            MatchStatus::Pending
        );
    }

    #[test]
    fn test_absorbed_record_is_hidden_and_never_enriched() {
        let db = Database::in_memory().unwrap();
        let fast = create(&db, Channel::Fast, 500, t0());
        let slow = create(&db, Channel::Slow, 500, t0() + Duration::minutes(1));
        let now = t0() + Duration::minutes(2);
        let fields = MatchEnrichment {
            product_details: Some("Masala Dosa".to_string()),
            direction: TransactionDirection::Unknown,
            payment_mode: PaymentMode::CreditCard,
        };

        assert!(db.absorb_late_record(fast.id, slow.id, &fields, now).unwrap());

        let canonical = db.get_metadata(fast.id).unwrap().unwrap();
        assert_eq!(canonical.match_status, MatchStatus::Matched);
        assert_eq!(canonical.absorbed_into, None);
        assert_eq!(canonical.product_details.as_deref(), Some("Masala Dosa"));
        assert_eq!(canonical.payment_mode, PaymentMode::CreditCard);

        let late = db.get_metadata(slow.id).unwrap().unwrap();
        assert_eq!(late.match_status, MatchStatus::Matched);
        assert_eq!(late.absorbed_into, Some(fast.id));

        assert_eq!(db.count_transactions().unwrap(), 1);
        assert_eq!(db.count_processed().unwrap(), (0, 1));
        let listed: Vec<i64> = db
            .list_transactions(None, 10)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(listed, vec![fast.id]);

        assert!(!db.complete_enrichment(slow.id, "fp", "sig", None).unwrap());
        assert!(!db.get_transaction(slow.id).unwrap().unwrap().processed);
    }

    #[test]
    fn test_absorb_refuses_processed_late_record() {
        let db = Database::in_memory().unwrap();
        let fast = create(&db, Channel::Fast, 500, t0());
        let slow = create(&db, Channel::Slow, 500, t0() + Duration::minutes(1));
        assert!(db.complete_enrichment(slow.id, "fp", "sig", None).unwrap());

        let now = t0() + Duration::minutes(2);
        assert!(!db
            .absorb_late_record(fast.id, slow.id, &MatchEnrichment::default(), now)
            .unwrap());
        assert_eq!(
            db.get_metadata(fast.id).unwrap().unwrap().match_status,
            MatchStatus::Pending
        );
        assert_eq!(db.count_processed().unwrap(), (1, 1));
    }

    // =========================================================================
    // Job queue
    // =========================================================================

    #[test]
    fn test_enqueue_merges_into_live_job() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());

        let first = db
            .enqueue_job(&NewJob::for_transaction(
                &tx,
                &schedule(JobKind::RetryMatch, t0() + Duration::minutes(1)),
            ))
            .unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));

        let second = db
            .enqueue_job(&NewJob::for_transaction(&tx, &schedule(JobKind::Enrich, t0())))
            .unwrap();
        assert_eq!(second, EnqueueOutcome::Merged(first.job_id()));

        let job = db.get_job(first.job_id()).unwrap().unwrap();
        assert_eq!(job.kind, JobKind::Enrich, "queued retry is upgraded");
        assert_eq!(job.not_before, t0(), "earlier schedule wins");
        assert_eq!(db.list_jobs(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_enqueue_after_terminal_creates_new_job() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        let job = NewJob::for_transaction(&tx, &schedule(JobKind::Enrich, t0()));

        let first = db.enqueue_job(&job).unwrap().job_id();
        let leased = db.lease_jobs(t0(), Duration::minutes(5), 10).unwrap();
        assert_eq!(leased.len(), 1);
        db.ack_job(first).unwrap();

        let second = db.enqueue_job(&job).unwrap();
        assert!(matches!(second, EnqueueOutcome::Enqueued(id) if id != first));
    }

    #[test]
    fn test_lease_respects_not_before() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        db.enqueue_job(&NewJob::for_transaction(
            &tx,
            &schedule(JobKind::RetryMatch, t0() + Duration::minutes(1)),
        ))
        .unwrap();

        assert!(db.lease_jobs(t0(), Duration::minutes(5), 10).unwrap().is_empty());

        let leased = db
            .lease_jobs(t0() + Duration::minutes(1), Duration::minutes(5), 10)
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].status, JobStatus::Running);
        assert_eq!(leased[0].attempts, 1);
        assert_eq!(
            leased[0].leased_until,
            Some(t0() + Duration::minutes(6))
        );

        // Running jobs are not handed out twice
        assert!(db
            .lease_jobs(t0() + Duration::minutes(2), Duration::minutes(5), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_fail_job_backoff_then_terminal() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        let id = db
            .enqueue_job(&NewJob::for_transaction(&tx, &schedule(JobKind::Enrich, t0())))
            .unwrap()
            .job_id();

        let mut now = t0();
        let mut delays = Vec::new();
        loop {
            let leased = db.lease_jobs(now, Duration::minutes(5), 1).unwrap();
            assert_eq!(leased.len(), 1);
            match db.fail_job(id, "timeout", true, now).unwrap() {
                FailOutcome::Retrying(at) => {
                    delays.push((at - now).num_milliseconds());
                    now = at;
                }
                FailOutcome::Failed => break,
            }
        }

        assert_eq!(delays, vec![3000, 6000]);
        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        assert!(db.live_job_for(tx.id).unwrap().is_none());
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        let id = db
            .enqueue_job(&NewJob::for_transaction(&tx, &schedule(JobKind::Enrich, t0())))
            .unwrap()
            .job_id();

        db.lease_jobs(t0(), Duration::minutes(5), 1).unwrap();
        assert_eq!(
            db.fail_job(id, "bad request", false, t0()).unwrap(),
            FailOutcome::Failed
        );
        assert_eq!(
            db.list_jobs(Some(JobStatus::Failed), 10).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_ack_requires_running_job() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        let id = db
            .enqueue_job(&NewJob::for_transaction(&tx, &schedule(JobKind::Enrich, t0())))
            .unwrap()
            .job_id();

        assert!(matches!(db.ack_job(id), Err(Error::Queue(_))));
    }

    #[test]
    fn test_expired_lease_is_requeued() {
        let db = Database::in_memory().unwrap();
        let tx = create(&db, Channel::Fast, 500, t0());
        let id = db
            .enqueue_job(&NewJob::for_transaction(&tx, &schedule(JobKind::Enrich, t0())))
            .unwrap()
            .job_id();

        db.lease_jobs(t0(), Duration::minutes(5), 1).unwrap();
        assert_eq!(db.requeue_expired_leases(t0() + Duration::minutes(4)).unwrap(), 0);

        // A crashed worker never acks; the lease lapses and the job comes back
        let again = db
            .lease_jobs(t0() + Duration::minutes(5), Duration::minutes(5), 1)
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].attempts, 2);
    }

    #[test]
    fn test_count_jobs_by_status() {
        let db = Database::in_memory().unwrap();
        let a = create(&db, Channel::Fast, 500, t0());
        let b = create(&db, Channel::Slow, 700, t0());
        for tx in [&a, &b] {
            db.enqueue_job(&NewJob::for_transaction(tx, &schedule(JobKind::Enrich, t0())))
                .unwrap();
        }
        db.lease_jobs(t0(), Duration::minutes(5), 1).unwrap();

        let counts = db.count_jobs_by_status().unwrap();
        assert!(counts.contains(&(JobStatus::Queued, 1)));
        assert!(counts.contains(&(JobStatus::Running, 1)));
    }
}
