//! Ledger invariants that every backend must uphold.

use std::sync::Arc;

use avatarbank_core::{
    verify_ledger, Generation, GenerationStatus, Transition, TransactionType, User, UserId,
};
use avatarbank_store::{MemoryStore, Reservation, Store, StoreError, TransitionOutcome};

async fn funded(store: &dyn Store, balance: i64) -> User {
    let user = User::new(UserId::generate(), "buyer@example.com", "buyer");
    store.create_user(&user).await.unwrap();
    store
        .add_credits(&user.id, balance, "seed".into())
        .await
        .unwrap();
    store.get_user(&user.id).await.unwrap().unwrap()
}

async fn concurrent_submissions_never_overdraw(store: Arc<dyn Store>) {
    let buyer = funded(store.as_ref(), 5).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let generation = Generation::pending(buyer.id, None, format!("prompt {i}"), 3, None);
                store.reserve_generation(&generation).await
            })
        })
        .collect();

    let mut won = 0;
    let mut lost = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Reservation::Created { .. }) => won += 1,
            Err(StoreError::InsufficientCredits { .. }) => lost += 1,
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(lost, 7);

    let user = store.get_user(&buyer.id).await.unwrap().unwrap();
    assert_eq!(user.credit_balance, 2);
    let ledger = store.ledger_for_user(&buyer.id).await.unwrap();
    assert_eq!(verify_ledger(&ledger, user.credit_balance), Ok(2));
}

async fn concurrent_failures_refund_once(store: Arc<dyn Store>) {
    let buyer = funded(store.as_ref(), 5).await;
    let generation = Generation::pending(buyer.id, None, "a lighthouse", 3, None);
    store.reserve_generation(&generation).await.unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let store = Arc::clone(&store);
            let id = generation.id;
            tokio::spawn(async move {
                let transition = if i % 2 == 0 {
                    Transition::Fail {
                        reason: "provider error".into(),
                    }
                } else {
                    Transition::Cancel {
                        reason: "canceled".into(),
                    }
                };
                store.apply_transition(&id, transition).await
            })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        if let TransitionOutcome::Applied { refund, .. } = handle.await.unwrap().unwrap() {
            assert!(refund.is_some());
            applied += 1;
        }
    }
    assert_eq!(applied, 1);

    let ledger = store.ledger_for_user(&buyer.id).await.unwrap();
    let refunds: Vec<_> = ledger
        .iter()
        .filter(|tx| tx.transaction_type == TransactionType::Refund)
        .collect();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, 3);
    assert_eq!(refunds[0].reference_id, Some(generation.id.to_string()));

    let user = store.get_user(&buyer.id).await.unwrap().unwrap();
    assert_eq!(user.credit_balance, 5);
    assert_eq!(verify_ledger(&ledger, 5), Ok(5));
}

async fn success_leaves_the_debit_in_place(store: Arc<dyn Store>) {
    let buyer = funded(store.as_ref(), 5).await;
    let generation = Generation::pending(buyer.id, None, "a lighthouse", 3, None);
    store.reserve_generation(&generation).await.unwrap();

    store
        .apply_transition(&generation.id, Transition::Start)
        .await
        .unwrap();
    let done = store
        .apply_transition(
            &generation.id,
            Transition::Complete(avatarbank_core::GeneratedImage {
                image_url: "https://cdn.example.com/lh.png".into(),
                seed: Some("99".into()),
                nsfw_flag: false,
            }),
        )
        .await
        .unwrap();
    assert!(matches!(done, TransitionOutcome::Applied { refund: None, .. }));

    // A late failure report must not refund a successful generation.
    let late = store
        .apply_transition(
            &generation.id,
            Transition::Fail {
                reason: "late timeout".into(),
            },
        )
        .await
        .unwrap();
    assert!(matches!(late, TransitionOutcome::AlreadySettled(ref g) if g.status == GenerationStatus::Success));

    let user = store.get_user(&buyer.id).await.unwrap().unwrap();
    assert_eq!(user.credit_balance, 2);
}

async fn stale_listing_skips_terminal_generations(store: Arc<dyn Store>) {
    let buyer = funded(store.as_ref(), 10).await;
    let open = Generation::pending(buyer.id, None, "open", 1, None);
    let closed = Generation::pending(buyer.id, None, "closed", 1, None);
    store.reserve_generation(&open).await.unwrap();
    store.reserve_generation(&closed).await.unwrap();
    store
        .apply_transition(
            &closed.id,
            Transition::Cancel {
                reason: "user".into(),
            },
        )
        .await
        .unwrap();

    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
    let stale = store.list_stale_generations(cutoff, 10).await.unwrap();
    let ids: Vec<_> = stale.iter().map(|g| g.id).collect();
    assert!(ids.contains(&open.id));
    assert!(!ids.contains(&closed.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_invariants() {
    concurrent_submissions_never_overdraw(Arc::new(MemoryStore::new())).await;
    concurrent_failures_refund_once(Arc::new(MemoryStore::new())).await;
    success_leaves_the_debit_in_place(Arc::new(MemoryStore::new())).await;
    stale_listing_skips_terminal_generations(Arc::new(MemoryStore::new())).await;
}

#[cfg(feature = "rocksdb-backend")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rocks_store_invariants() {
    use avatarbank_store::RocksStore;

    for check in 0..4 {
        let dir = tempfile::TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        match check {
            0 => concurrent_submissions_never_overdraw(store).await,
            1 => concurrent_failures_refund_once(store).await,
            2 => success_leaves_the_debit_in_place(store).await,
            _ => stale_listing_skips_terminal_generations(store).await,
        }
    }
}
