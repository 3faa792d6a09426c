use crate::common::{FailingRegistry, SlowRegistry};
use hub_device_sim::device::IdentityProvisioner;
use hub_device_sim::error::{ErrorKind, HubError};
use std::sync::Arc;

#[tokio::test]
async fn test_ensure_twice_returns_the_same_identity() {
    let registry = Arc::new(SlowRegistry::new());
    let provisioner = IdentityProvisioner::new(registry.clone());

    let first = provisioner.ensure_device("sensor-01").await.unwrap();
    let second = provisioner.ensure_device("sensor-01").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(registry.add_calls(), 2);
    assert_eq!(registry.get_calls(), 1);
}

#[tokio::test]
async fn test_parallel_ensure_converges_on_one_identity() {
    let registry = Arc::new(SlowRegistry::new());
    let provisioner = Arc::new(IdentityProvisioner::new(registry.clone()));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let provisioner = provisioner.clone();
        handles.push(tokio::spawn(async move {
            provisioner.ensure_device("racer").await
        }));
    }

    let mut credentials = Vec::new();
    for handle in handles {
        credentials.push(handle.await.unwrap().unwrap());
    }

    let first = &credentials[0];
    assert!(credentials.iter().all(|c| c == first));
    assert_eq!(registry.add_calls(), 16);
    assert_eq!(registry.get_calls(), 15);
}

#[tokio::test]
async fn test_registry_errors_are_propagated_unchanged() {
    let provisioner = IdentityProvisioner::new(FailingRegistry(|| HubError::transient("503")));
    let err = provisioner.ensure_device("sensor-01").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    let provisioner = IdentityProvisioner::new(FailingRegistry(|| HubError::fatal("401")));
    let err = provisioner.ensure_device("sensor-01").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[tokio::test]
async fn test_conflict_followed_by_failed_fetch_is_an_error() {
    let provisioner =
        IdentityProvisioner::new(FailingRegistry(|| HubError::AlreadyExists("ghost".to_string())));
    let err = provisioner.ensure_device("ghost").await.unwrap_err();
    assert!(matches!(err, HubError::AlreadyExists(_)));
}
