/// Unit of Work Tests
///
/// Lifecycle, nesting, shared transactions and tenant filters, driven end to
/// end through the in-memory store.
/// Run with: cargo test --test unit_of_work_tests

use rustuow::memory::{Entity, JournalEntry, MemoryDatabase, MemorySession, MemorySessionResolver};
use rustuow::{
    ActiveUnitOfWork, AmbientContext, AmbientSession, ConnectionResolveArgs,
    ConnectionStringsConfig, DataFilterConfiguration, DataFilters, DefaultConnectionStringResolver,
    FilterParameters, MultiTenancySide, SessionType, StaticIdentity, UnitOfWorkDefaultOptions,
    UnitOfWorkManager, UnitOfWorkOptions, UnitOfWorkState, UowError,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ORDERS: SessionType = SessionType::new("Orders");
const AUDIT: SessionType = SessionType::new("Audit");

struct Fixture {
    host_db: Arc<MemoryDatabase>,
    tenant_db: Arc<MemoryDatabase>,
    sessions: Arc<MemorySessionResolver>,
    manager: UnitOfWorkManager,
}

fn fixture() -> Fixture {
    fixture_with(UnitOfWorkDefaultOptions::default(), AmbientSession::anonymous())
}

fn fixture_with(defaults: UnitOfWorkDefaultOptions, session: AmbientSession) -> Fixture {
    let host_db = MemoryDatabase::new("host");
    let tenant_db = MemoryDatabase::new("tenantdb");
    let sessions = Arc::new(
        MemorySessionResolver::new()
            .with_database("mem://host", host_db.clone())
            .with_database("mem://tenantdb", tenant_db.clone()),
    );
    let connection_strings = DefaultConnectionStringResolver::new(
        ConnectionStringsConfig::new("mem://host")
            .company(7, "mem://tenantdb")
            .named("ghost", "mem://ghost"),
    );
    let manager =
        UnitOfWorkManager::new(defaults, Arc::new(connection_strings), sessions.clone(), session)
            .unwrap();

    Fixture {
        host_db,
        tenant_db,
        sessions,
        manager,
    }
}

async fn session(uow: &ActiveUnitOfWork, session_type: SessionType) -> Arc<MemorySession> {
    uow.get_or_create::<MemorySession>(session_type, ConnectionResolveArgs::new(), None)
        .await
        .unwrap()
}

fn company_parameter(uow: &ActiveUnitOfWork) -> Option<Value> {
    uow.context()
        .filter_parameter(DataFilters::MUST_HAVE_COMPANY, FilterParameters::COMPANY_ID)
        .unwrap()
}

/// Commit one order through its own unit of work and return the stored row
async fn seed_order(fx: &Fixture, qty: i64) -> Entity {
    let mut handle = fx.manager.begin(UnitOfWorkOptions::requires_new()).unwrap();
    let orders = session(handle.unit_of_work(), ORDERS).await;
    let id = orders.insert("orders", Entity::new(json!({ "qty": qty })));
    handle.complete().await.unwrap();
    handle.dispose().await.unwrap();

    fx.host_db
        .committed_rows("orders")
        .await
        .into_iter()
        .find(|e| e.id == id)
        .unwrap()
}

#[tokio::test]
async fn test_end_to_end_tenant_scenario() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let mut handle = fx.manager.begin_default().unwrap();
            let uow = handle.unit_of_work().clone();
            let defaults = uow.filters();

            {
                let _company = uow.set_company_id(Some(7), true).unwrap();
                let tenant = || ConnectionResolveArgs::new().side(MultiTenancySide::Tenant);

                let first = uow
                    .get_or_create::<MemorySession>(ORDERS, tenant(), None)
                    .await
                    .unwrap();
                let second = uow
                    .get_or_create::<MemorySession>(ORDERS, tenant(), None)
                    .await
                    .unwrap();
                assert!(Arc::ptr_eq(&first, &second));
                assert_eq!(company_parameter(&uow), Some(json!(7)));

                first.insert("orders", Entity::new(json!({"sku": "A-1"})).must_have_company());
                uow.save_changes().await.unwrap();
                assert_eq!(company_parameter(&uow), Some(json!(7)));

                handle.complete().await.unwrap();
                assert_eq!(company_parameter(&uow), Some(json!(7)));
            }
            handle.dispose().await.unwrap();

            assert_eq!(fx.sessions.resolved_count(), 1);
            assert_eq!(fx.sessions.released_count(), 1);
            assert_eq!(fx.tenant_db.commit_count(), 1);

            let rows = fx.tenant_db.committed_rows("orders").await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].company_id, Some(7));
            assert!(fx.host_db.committed_rows("orders").await.is_empty());

            assert_eq!(uow.filters(), defaults);
            assert_eq!(uow.company_id(), None);
            assert_eq!(uow.state(), UnitOfWorkState::Disposed);
        })
        .await;
}

#[tokio::test]
async fn test_session_identity_by_name() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let handle = fx.manager.begin_default().unwrap();
            let uow = handle.unit_of_work();

            let plain = uow
                .get_or_create_session(ORDERS, ConnectionResolveArgs::new(), None)
                .await
                .unwrap();
            let again = uow
                .get_or_create_session(ORDERS, ConnectionResolveArgs::new(), None)
                .await
                .unwrap();
            let named = uow
                .get_or_create_session(ORDERS, ConnectionResolveArgs::new(), Some("reporting"))
                .await
                .unwrap();

            assert!(Arc::ptr_eq(&plain, &again));
            assert!(!Arc::ptr_eq(&plain, &named));
            assert_eq!(uow.session_count().await, 2);

            handle.dispose().await.unwrap();
            assert_eq!(fx.sessions.open_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_shared_transaction_rolls_back_together() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let stale = seed_order(&fx, 1).await;

            // someone else changes the row first
            let mut other = fx.manager.begin(UnitOfWorkOptions::requires_new()).unwrap();
            let mut fresh = stale.clone();
            fresh.set("qty", 2);
            session(other.unit_of_work(), ORDERS).await.update("orders", fresh);
            other.complete().await.unwrap();
            other.dispose().await.unwrap();

            let begun = fx.host_db.transactions_begun();
            let mut handle = fx.manager.begin_default().unwrap();
            let uow = handle.unit_of_work().clone();
            let failures = Arc::new(Mutex::new(Vec::new()));
            let seen = failures.clone();
            uow.on_failed(move |err, retriable| {
                seen.lock().unwrap().push((err.cloned(), retriable));
            });

            let orders = session(&uow, ORDERS).await;
            let audit = session(&uow, AUDIT).await;
            assert_eq!(orders.transaction_id(), audit.transaction_id());

            orders.insert("orders", Entity::new(json!({"qty": 10})));
            audit.update("orders", stale);

            let err = handle.complete().await.unwrap_err();
            assert!(matches!(err, UowError::Concurrency(_)));
            assert!(err.is_retriable());
            handle.dispose().await.unwrap();

            assert_eq!(fx.host_db.transactions_begun() - begun, 1);
            let rows = fx.host_db.committed_rows("orders").await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("qty"), Some(&json!(2)));

            let failures = failures.lock().unwrap();
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].0, Some(UowError::Concurrency(_))));
            assert!(failures[0].1);
        })
        .await;
}

#[tokio::test]
async fn test_complete_saves_before_commit() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let mut handle = fx.manager.begin_default().unwrap();
            let orders = session(handle.unit_of_work(), ORDERS).await;
            orders.insert("orders", Entity::new(json!({})));

            handle.complete().await.unwrap();
            assert!(matches!(
                handle.complete().await,
                Err(UowError::CompleteCalledTwice(_))
            ));
            handle.dispose().await.unwrap();

            let journal = fx.host_db.journal();
            let saved = journal
                .iter()
                .position(|e| matches!(e, JournalEntry::ChangesSaved { .. }))
                .unwrap();
            let committed = journal
                .iter()
                .position(|e| matches!(e, JournalEntry::Committed { .. }))
                .unwrap();
            assert!(saved < committed);
            assert_eq!(fx.host_db.committed_rows("orders").await.len(), 1);
        })
        .await;
}

#[tokio::test]
async fn test_nested_required_does_not_end_outer() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let mut outer = fx.manager.begin_default().unwrap();

            let mut inner = fx.manager.begin(UnitOfWorkOptions::required()).unwrap();
            assert!(Arc::ptr_eq(outer.unit_of_work(), inner.unit_of_work()));
            session(inner.unit_of_work(), ORDERS)
                .await
                .insert("orders", Entity::new(json!({})));
            inner.complete().await.unwrap();
            inner.dispose().await.unwrap();

            assert_eq!(outer.unit_of_work().state(), UnitOfWorkState::Active);
            assert!(fx.host_db.committed_rows("orders").await.is_empty());
            let current = fx.manager.current().unwrap();
            assert!(Arc::ptr_eq(&current, outer.unit_of_work()));

            outer.complete().await.unwrap();
            outer.dispose().await.unwrap();
            assert_eq!(fx.host_db.committed_rows("orders").await.len(), 1);
            assert_eq!(fx.host_db.commit_count(), 1);
        })
        .await;
}

#[tokio::test]
async fn test_inner_dispose_without_complete_blocks_outer_commit() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let mut outer = fx.manager.begin_default().unwrap();
            session(outer.unit_of_work(), ORDERS)
                .await
                .insert("orders", Entity::new(json!({})));

            let inner = fx.manager.begin_default().unwrap();
            assert_eq!(inner.dispose().await, Err(UowError::InnerNotCompleted));

            assert_eq!(outer.complete().await, Err(UowError::InnerNotCompleted));
            outer.dispose().await.unwrap();
            assert!(fx.host_db.committed_rows("orders").await.is_empty());
            assert_eq!(fx.host_db.commit_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_requires_new_is_independent() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let outer = fx.manager.begin_default().unwrap();
            session(outer.unit_of_work(), ORDERS)
                .await
                .insert("orders", Entity::new(json!({"from": "outer"})));

            let mut inner = fx.manager.begin(UnitOfWorkOptions::requires_new()).unwrap();
            assert!(!Arc::ptr_eq(outer.unit_of_work(), inner.unit_of_work()));
            let current = fx.manager.current().unwrap();
            assert!(Arc::ptr_eq(&current, inner.unit_of_work()));

            session(inner.unit_of_work(), ORDERS)
                .await
                .insert("orders", Entity::new(json!({"from": "inner"})));
            inner.complete().await.unwrap();
            inner.dispose().await.unwrap();

            let current = fx.manager.current().unwrap();
            assert!(Arc::ptr_eq(&current, outer.unit_of_work()));

            // outer never completes
            outer.dispose().await.unwrap();

            let rows = fx.host_db.committed_rows("orders").await;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("from"), Some(&json!("inner")));
            assert!(fx.manager.current().is_none());
        })
        .await;
}

#[tokio::test]
async fn test_suppress_is_not_transactional() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let outer = fx.manager.begin_default().unwrap();
            let suppressed = fx.manager.begin(UnitOfWorkOptions::suppress()).unwrap();
            assert!(suppressed.is_root());
            assert!(!suppressed.unit_of_work().is_transactional());

            let orders = session(suppressed.unit_of_work(), ORDERS).await;
            assert_eq!(orders.transaction_id(), None);
            orders.insert("orders", Entity::new(json!({})));
            suppressed.unit_of_work().save_changes().await.unwrap();

            // written immediately, without a transaction
            assert_eq!(fx.host_db.committed_rows("orders").await.len(), 1);
            assert_eq!(fx.host_db.transactions_begun(), 0);

            suppressed.dispose().await.unwrap();
            outer.dispose().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_dispose_without_complete_rolls_back() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let handle = fx.manager.begin_default().unwrap();
            let uow = handle.unit_of_work().clone();
            let events = Arc::new(Mutex::new(Vec::new()));
            let (failed, disposed, completed) = (events.clone(), events.clone(), events.clone());
            uow.on_failed(move |err, retriable| {
                failed
                    .lock()
                    .unwrap()
                    .push(format!("failed:{}:{}", err.is_some(), retriable));
            });
            uow.on_disposed(move || disposed.lock().unwrap().push("disposed".to_string()));
            uow.on_completed(move || completed.lock().unwrap().push("completed".to_string()));

            let orders = session(&uow, ORDERS).await;
            orders.insert("orders", Entity::new(json!({})));
            uow.save_changes().await.unwrap();
            let transaction = orders.transaction_id().unwrap();

            handle.dispose().await.unwrap();

            assert!(fx.host_db.committed_rows("orders").await.is_empty());
            assert!(fx
                .host_db
                .journal()
                .contains(&JournalEntry::RolledBack { transaction }));
            assert_eq!(
                *events.lock().unwrap(),
                vec!["failed:false:false".to_string(), "disposed".to_string()]
            );
            assert_eq!(fx.sessions.open_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_non_transactional_dispose_discards_tracked_changes() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let handle = fx
                .manager
                .begin(UnitOfWorkOptions::new().transactional(false))
                .unwrap();
            let orders = session(handle.unit_of_work(), ORDERS).await;
            orders.insert("orders", Entity::new(json!({})));

            handle.dispose().await.unwrap();

            assert_eq!(orders.tracked_count(), 0);
            assert!(fx.host_db.committed_rows("orders").await.is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_completed_event_and_no_failure() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let mut handle = fx.manager.begin_default().unwrap();
            let events = Arc::new(Mutex::new(Vec::new()));
            let (failed, completed) = (events.clone(), events.clone());
            handle
                .unit_of_work()
                .on_failed(move |_, _| failed.lock().unwrap().push("failed"));
            handle
                .unit_of_work()
                .on_completed(move || completed.lock().unwrap().push("completed"));

            handle.complete().await.unwrap();
            handle.dispose().await.unwrap();
            assert_eq!(*events.lock().unwrap(), vec!["completed"]);
        })
        .await;
}

#[tokio::test]
async fn test_resource_error_fails_unit_of_work() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let handle = fx.manager.begin_default().unwrap();
            let uow = handle.unit_of_work().clone();

            let err = uow
                .get_or_create_session(ORDERS, ConnectionResolveArgs::new().named("ghost"), None)
                .await
                .err()
                .unwrap();
            assert!(matches!(err, UowError::Resource(_)));
            assert!(matches!(uow.failure(), Some(UowError::Resource(_))));

            let unknown = uow
                .get_or_create_session(ORDERS, ConnectionResolveArgs::new().named("archive"), None)
                .await
                .err()
                .unwrap();
            assert!(matches!(unknown, UowError::Configuration(_)));

            handle.dispose().await.unwrap();
            assert_eq!(uow.state(), UnitOfWorkState::Disposed);
        })
        .await;
}

#[tokio::test]
async fn test_transaction_timeout() {
    let fx = fixture_with(
        UnitOfWorkDefaultOptions::new().timeout(Duration::from_millis(10)),
        AmbientSession::anonymous(),
    );
    AmbientContext::new()
        .scope(async {
            let mut handle = fx.manager.begin_default().unwrap();
            session(handle.unit_of_work(), ORDERS)
                .await
                .insert("orders", Entity::new(json!({})));
            tokio::time::sleep(Duration::from_millis(40)).await;

            assert!(matches!(
                handle.complete().await,
                Err(UowError::Transaction(_))
            ));
            handle.dispose().await.unwrap();
            assert!(fx.host_db.committed_rows("orders").await.is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_company_and_user_seeded_from_session() {
    let fx = fixture_with(
        UnitOfWorkDefaultOptions::default(),
        AmbientSession::new(Arc::new(StaticIdentity::new(Some(3), Some(9)))),
    );
    AmbientContext::new()
        .scope(async {
            let handle = fx.manager.begin_default().unwrap();
            assert_eq!(handle.unit_of_work().company_id(), Some(3));
            assert_eq!(handle.unit_of_work().context().user_id(), Some(9));
            handle.dispose().await.unwrap();

            let run_as = fx.manager.session().use_override(Some(7), Some(1)).unwrap();
            let handle = fx.manager.begin_default().unwrap();
            assert_eq!(handle.unit_of_work().company_id(), Some(7));
            assert_eq!(handle.unit_of_work().context().user_id(), Some(1));
            handle.dispose().await.unwrap();
            run_as.release().unwrap();

            assert_eq!(fx.manager.session().company_id(), Some(3));
        })
        .await;
}

#[tokio::test]
async fn test_filter_overrides_from_options() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let options = UnitOfWorkOptions::new()
                .filter_override(DataFilterConfiguration::new(DataFilters::SOFT_DELETE, false));
            let handle = fx.manager.begin(options).unwrap();
            assert!(!handle
                .unit_of_work()
                .is_filter_enabled(DataFilters::SOFT_DELETE)
                .unwrap());
            handle.dispose().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_filters_apply_to_reads() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            // rows of two companies on the host database
            let mut setup = fx.manager.begin_default().unwrap();
            let orders = session(setup.unit_of_work(), ORDERS).await;
            orders.insert("orders", Entity::new(json!({})).must_have_company().company(3));
            orders.insert("orders", Entity::new(json!({})).must_have_company().company(4));
            setup.complete().await.unwrap();
            setup.dispose().await.unwrap();

            let handle = fx.manager.begin_default().unwrap();
            let uow = handle.unit_of_work().clone();
            let orders = session(&uow, ORDERS).await;

            // host context: must-have filter disabled, every row visible
            {
                let _host = uow.set_company_id(None, true).unwrap();
                assert_eq!(orders.list("orders").await.len(), 2);
            }
            {
                let _company = uow.set_company_id(Some(3), true).unwrap();
                let rows = orders.list("orders").await;
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].company_id, Some(3));

                let _all = uow.disable_filter(&[DataFilters::MUST_HAVE_COMPANY]).unwrap();
                assert_eq!(orders.list("orders").await.len(), 2);
            }
            handle.dispose().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_concurrent_chains_are_isolated() {
    let fx = Arc::new(fixture());

    let run = |company: i32| {
        let fx = fx.clone();
        AmbientContext::new().scope(async move {
            let handle = fx.manager.begin_default().unwrap();
            let _company = handle.unit_of_work().set_company_id(Some(company), true).unwrap();
            let id = handle.unit_of_work().id();

            for _ in 0..5 {
                tokio::task::yield_now().await;
                let current = fx.manager.current().unwrap();
                assert_eq!(current.id(), id);
                assert_eq!(current.company_id(), Some(company));
            }
            drop(_company);
            handle.dispose().await.unwrap();
        })
    };

    tokio::join!(run(3), run(4));
    let spawned = tokio::spawn(run(5));
    spawned.await.unwrap();
}

#[tokio::test]
async fn test_joined_branches_keep_their_own_unit_of_work() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let slow = AmbientContext::branch(async {
                let handle = fx.manager.begin(UnitOfWorkOptions::requires_new()).unwrap();
                let uow = handle.unit_of_work().clone();
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(Arc::ptr_eq(&fx.manager.current().unwrap(), &uow));
                handle.dispose().await
            });
            let fast = AmbientContext::branch(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let seen = fx.manager.current().map(|u| u.id());
                let handle = fx.manager.begin(UnitOfWorkOptions::required()).unwrap();
                let root = handle.is_root();
                (seen, root, handle.dispose().await)
            });

            let (slow_disposed, (seen, root, fast_disposed)) = tokio::join!(slow, fast);

            assert_eq!(seen, None);
            assert!(root);
            assert_eq!(slow_disposed, Ok(()));
            assert_eq!(fast_disposed, Ok(()));
            assert!(fx.manager.current().is_none());
        })
        .await;
}

#[tokio::test]
async fn test_spawned_task_sees_current_unit_of_work() {
    let fx = Arc::new(fixture());
    let inner = fx.clone();
    AmbientContext::new()
        .scope(async move {
            let handle = inner.manager.begin_default().unwrap();
            let id = handle.unit_of_work().id();

            let child = inner.clone();
            let seen = rustuow::spawn(async move { child.manager.current().map(|u| u.id()) })
                .await
                .unwrap();
            assert_eq!(seen, Some(id));

            handle.dispose().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn test_dropped_handle_is_disposed() {
    let fx = fixture();
    AmbientContext::new()
        .scope(async {
            let handle = fx.manager.begin_default().unwrap();
            let uow = handle.unit_of_work().clone();
            session(&uow, ORDERS)
                .await
                .insert("orders", Entity::new(json!({})));
            drop(handle);

            assert!(fx.manager.current().is_none());
            for _ in 0..20 {
                if uow.state() == UnitOfWorkState::Disposed {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert_eq!(uow.state(), UnitOfWorkState::Disposed);
            assert_eq!(fx.sessions.open_count(), 0);
            assert!(fx.host_db.committed_rows("orders").await.is_empty());
        })
        .await;
}

#[test]
fn test_blocking_lifecycle() {
    let fx = fixture();
    AmbientContext::new().sync_scope(|| {
        let mut handle = fx.manager.begin_default().unwrap();
        let orders = futures::executor::block_on(session(handle.unit_of_work(), ORDERS));
        orders.insert("orders", Entity::new(json!({})));
        handle.unit_of_work().save_changes_blocking().unwrap();

        handle.complete_blocking().unwrap();
        handle.dispose_blocking().unwrap();
    });

    let rows = futures::executor::block_on(fx.host_db.committed_rows("orders"));
    assert_eq!(rows.len(), 1);
}

#[test]
fn test_begin_outside_call_chain_fails() {
    let fx = fixture();
    assert!(matches!(
        fx.manager.begin_default(),
        Err(UowError::NoAmbientContext)
    ));
}
