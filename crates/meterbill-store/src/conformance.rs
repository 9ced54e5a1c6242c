//! Behaviour every `Store` backend must share.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use meterbill_core::{
    apply_credits, calculate_bill, BillStatus, BillingCycle, CreditApplication, Discount,
    RevenueSnapshot, RunPhase, TenantId, Tier, TierChangeEvent, UsageRecord,
};
use rust_decimal_macros::dec;

use crate::Store;

fn tenant(s: &str) -> TenantId {
    TenantId::new(s).unwrap()
}

fn pro() -> Tier {
    Tier::new("pro", dec!(299), 10_000, dec!(0.05))
}

pub fn usage_upsert_and_listing(store: &dyn Store) {
    let now = Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap();
    let may = BillingCycle::from_datetime(now);
    let april = may.previous();

    assert!(store.get_usage(&tenant("a"), may).unwrap().is_none());

    let record = store
        .upsert_usage(&tenant("a"), may, now, &mut |r| r.weighted_calls += 5)
        .unwrap();
    assert_eq!(record.weighted_calls, 5);
    assert_eq!(record.last_updated, now);
    let record = store
        .upsert_usage(&tenant("a"), may, now, &mut |r| r.weighted_calls += 5)
        .unwrap();
    assert_eq!(record.weighted_calls, 10);

    store
        .upsert_usage(&tenant("b"), may, now, &mut |r| r.total_calls += 1)
        .unwrap();
    store
        .put_usage(&UsageRecord::empty(tenant("a"), april, now))
        .unwrap();

    let may_records = store.list_usage_by_cycle(may).unwrap();
    let tenants: Vec<_> = may_records.iter().map(|r| r.tenant_id.as_str()).collect();
    assert_eq!(tenants, vec!["a", "b"]);

    let a_records = store.list_usage_by_tenant(&tenant("a")).unwrap();
    let cycles: Vec<_> = a_records.iter().map(|r| r.billing_cycle).collect();
    assert_eq!(cycles, vec![april, may]);

    assert!(store.archive_usage(&tenant("a"), may, now).unwrap());
    assert!(!store.archive_usage(&tenant("zzz"), may, now).unwrap());
    assert!(store.get_usage(&tenant("a"), may).unwrap().unwrap().is_archived());
}

pub fn concurrent_upserts_lose_nothing(store: Arc<dyn Store>) {
    let now = Utc::now();
    let cycle = BillingCycle::from_datetime(now);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..250 {
                    store
                        .upsert_usage(&tenant("hot"), cycle, now, &mut |r| {
                            r.total_calls += 1;
                            r.weighted_calls += 3;
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let record = store.get_usage(&tenant("hot"), cycle).unwrap().unwrap();
    assert_eq!(record.total_calls, 2_000);
    assert_eq!(record.weighted_calls, 6_000);
}

pub fn bills_and_credits(store: &dyn Store) {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let may = BillingCycle::new(2024, 5).unwrap();
    let t = tenant("acme");

    store
        .push_credit(&t, &Discount::new("Proration credit: pro → starter", dec!(40)))
        .unwrap();
    store
        .push_credit(&t, &Discount::new("Proration credit: pro → free", dec!(5)))
        .unwrap();
    let credits = store.pending_credits(&t).unwrap();
    assert_eq!(credits.len(), 2);

    let record = UsageRecord::empty(t.clone(), may, now);
    let applied = CreditApplication {
        applied: credits[..1].to_vec(),
        consumed: 1,
        carry_over: None,
    };
    let bill = calculate_bill(&record, &pro(), &applied.applied, now, "USD");
    store.create_bill(&bill, &applied).unwrap();

    let remaining = store.pending_credits(&t).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].amount, dec!(5));

    let stored = store.get_bill(&t, may).unwrap().unwrap();
    assert_eq!(stored.total, dec!(259.00));

    let mut failed = stored.clone();
    failed.mark_failed("card declined").unwrap();
    store.put_bill(&failed).unwrap();

    let june_record = UsageRecord::empty(t.clone(), may.next(), now);
    let june = calculate_bill(&june_record, &pro(), &[], now, "USD");
    store.create_bill(&june, &CreditApplication::default()).unwrap();

    assert_eq!(store.list_bills_by_cycle(may).unwrap().len(), 1);
    let by_tenant = store.list_bills_by_tenant(&t).unwrap();
    assert_eq!(by_tenant.len(), 2);
    assert_eq!(by_tenant[1].billing_cycle, may.next());

    let failed = store.list_bills_with_status(BillStatus::Failed).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure_reason.as_deref(), Some("card declined"));
}

pub fn split_credit_stays_first_in_line(store: &dyn Store) {
    let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
    let june = BillingCycle::new(2024, 6).unwrap();
    let t = tenant("globex");
    let starter = Tier::new("starter", dec!(49), 5_000, dec!(0.08));

    store
        .push_credit(&t, &Discount::new("Proration credit: enterprise → starter", dec!(80)))
        .unwrap();
    store
        .push_credit(&t, &Discount::new("goodwill", dec!(10)))
        .unwrap();

    let credits = store.pending_credits(&t).unwrap();
    let applied = apply_credits(dec!(49), &credits);
    let record = UsageRecord::empty(t.clone(), june, now);
    let bill = calculate_bill(&record, &starter, &applied.applied, now, "USD");
    store.create_bill(&bill, &applied).unwrap();

    assert_eq!(store.get_bill(&t, june).unwrap().unwrap().total, dec!(0));
    let remaining = store.pending_credits(&t).unwrap();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].amount, dec!(31));
    assert_eq!(remaining[0].reason, "Proration credit: enterprise → starter");
    assert_eq!(remaining[1].reason, "goodwill");
}

pub fn tier_changes_in_order(store: &dyn Store) {
    let t = tenant("acme");
    let now = Utc.with_ymd_and_hms(2024, 6, 16, 0, 0, 0).unwrap();
    let starter = Tier::new("starter", dec!(49), 5_000, dec!(0.08));

    let first = TierChangeEvent::new(t.clone(), &starter, &pro(), now);
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = TierChangeEvent::new(t.clone(), &pro(), &starter, now);
    store.append_tier_change(&first).unwrap();
    store.append_tier_change(&second).unwrap();
    store
        .append_tier_change(&TierChangeEvent::new(tenant("other"), &starter, &pro(), now))
        .unwrap();

    let history = store.list_tier_changes(&t).unwrap();
    assert_eq!(history, vec![first, second]);
}

pub fn singletons(store: &dyn Store) {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    assert!(store.get_revenue().unwrap().is_none());
    assert!(store.get_scheduler_state().unwrap().is_none());

    let snapshot = store
        .update_revenue(now, &mut |s: &mut RevenueSnapshot| s.paid_bills += 1)
        .unwrap();
    assert_eq!(snapshot.paid_bills, 1);
    assert_eq!(store.get_revenue().unwrap(), Some(snapshot));

    let state = store
        .update_scheduler_state(now, &mut |s| s.phase = RunPhase::Running)
        .unwrap();
    assert_eq!(state.phase, RunPhase::Running);
    assert_eq!(
        store.get_scheduler_state().unwrap().unwrap().next_daily_run,
        Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()
    );

    store.flush().unwrap();
}
