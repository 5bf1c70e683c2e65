//! Bulk policy updates against the fake agent

mod common;

use common::*;
use dbguard_foundation::{Error, PolicySource};
use dbguard_privilege::{BulkPolicyService, PolicyChange};
use dbguard_task::JobStatus;
use std::sync::Arc;

fn change(actor_id: i64, template_id: i64, enable: bool) -> PolicyChange {
    PolicyChange {
        actor_id,
        database_id: 0,
        object_id: 0,
        template_id,
        enable,
    }
}

fn five_changes(store: &dbguard_foundation::PolicyStore) -> Vec<PolicyChange> {
    let app = actor_id(store, "app");
    let report = actor_id(store, "report");
    let sales = database_id(store, "sales");
    let orders = object_id(store, "orders");
    vec![
        change(app, SELECT_ANY, true),
        change(app, SHOW_DATABASES, true),
        PolicyChange {
            database_id: sales,
            ..change(app, SELECT_ON_DB, true)
        },
        change(report, SELECT_ANY, true),
        PolicyChange {
            database_id: sales,
            object_id: orders,
            ..change(report, SELECT_ON_TABLE, true)
        },
    ]
}

#[tokio::test]
async fn test_all_succeed_persists_manual_policies() {
    let agent = Arc::new(FakeAgent::default());
    let store = store();
    let service = BulkPolicyService::new(store.clone(), remote(&agent));

    let report = service
        .apply(CONNECTION, five_changes(&store))
        .await
        .unwrap();
    assert_eq!(report.applied, 5);
    assert_eq!(report.enabled, 5);

    let policies = store.list_policies(CONNECTION).unwrap();
    assert_eq!(policies.len(), 5);
    assert!(policies
        .iter()
        .all(|p| p.source == PolicySource::Manual && p.enabled));

    let queries = agent.executed_queries();
    assert_eq!(queries.len(), 5);
    assert!(queries.contains(&"GRANT SELECT ON `sales`.`orders` TO 'report'@'%'".to_string()));
}

#[tokio::test]
async fn test_two_of_five_failing_mutates_nothing() {
    let agent = Arc::new(FakeAgent::default());
    agent.reject_containing.lock().push("'report'".to_string());
    let store = store();
    let service = BulkPolicyService::new(store.clone(), remote(&agent));

    let err = service
        .apply(CONNECTION, five_changes(&store))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BulkUpdateFailed { failed: 2, total: 5 }));
    assert_eq!(store.count_policies(CONNECTION).unwrap(), 0);
    // every statement was still attempted
    assert_eq!(agent.executed_queries().len(), 5);
}

#[tokio::test]
async fn test_revoke_flips_existing_policy() {
    let agent = Arc::new(FakeAgent::default());
    let store = store();
    let service = BulkPolicyService::new(store.clone(), remote(&agent));
    let app = actor_id(&store, "app");

    service
        .apply(CONNECTION, vec![change(app, SELECT_ANY, true)])
        .await
        .unwrap();
    let report = service
        .apply(CONNECTION, vec![change(app, SELECT_ANY, false)])
        .await
        .unwrap();
    assert_eq!(report.disabled, 1);

    let policies = store.list_policies(CONNECTION).unwrap();
    assert_eq!(policies.len(), 1);
    assert!(!policies[0].enabled);
    assert_eq!(
        agent.executed_queries().last().map(String::as_str),
        Some("REVOKE SELECT ON *.* FROM 'app'@'%'")
    );
}

#[tokio::test]
async fn test_validation_errors_abort_before_execution() {
    let agent = Arc::new(FakeAgent::default());
    let store = store();
    let service = BulkPolicyService::new(store.clone(), remote(&agent));
    let app = actor_id(&store, "app");

    // super template has no grant statement
    let err = service
        .apply(
            CONNECTION,
            vec![change(app, SELECT_ANY, true), change(app, SUPER_TEMPLATE, true)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Template { template_id: SUPER_TEMPLATE, .. }));

    // revoke statement missing
    let err = service
        .apply(CONNECTION, vec![change(app, SHOW_DATABASES, false)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("revoke"));

    // ${database} left unresolved without a database
    let err = service
        .apply(CONNECTION, vec![change(app, SELECT_ON_DB, true)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("database"));

    // unknown template and oracle template on a mysql connection
    assert!(matches!(
        service.apply(CONNECTION, vec![change(app, 404, true)]).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        service.apply(CONNECTION, vec![change(app, 2, true)]).await,
        Err(Error::Template { template_id: 2, .. })
    ));

    assert!(agent.executed_queries().is_empty());
    assert_eq!(store.count_policies(CONNECTION).unwrap(), 0);
}

#[tokio::test]
async fn test_submit_tracks_outcome_as_job() {
    let agent = Arc::new(FakeAgent::default());
    agent.reject_containing.lock().push("'report'".to_string());
    let store = store();
    let jobs = jobs(&agent);
    let service = BulkPolicyService::new(store.clone(), remote(&agent));

    let job = service
        .submit(&jobs, CONNECTION, five_changes(&store))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!((job.completed, job.failed, job.total), (3, 2, 5));
    assert!(job.message.contains("2 of 5"));
    assert!(job.resolved);
    assert!(!job.needs_polling());

    agent.reject_containing.lock().clear();
    let job = service
        .submit(&jobs, CONNECTION, five_changes(&store))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(store.count_policies(CONNECTION).unwrap(), 5);
}
