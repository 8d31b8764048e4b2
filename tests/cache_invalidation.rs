mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use urbanvital_client::transport::{Method, RawResponse};
use urbanvital_client::{ApiRequest, Resource};

fn counting_backend() -> (Arc<AtomicUsize>, Arc<urbanvital_client::transport::ScriptedTransport>) {
    let version = Arc::new(AtomicUsize::new(0));
    let v = version.clone();
    let transport = transport(move |req| match (req.method, req.path.as_str()) {
        (_, LOGIN) => login_ok("A1", "R1"),
        (Method::Get, path) => ok(json!({"path": path, "version": v.load(Ordering::SeqCst)})),
        (_, "/patients/9/") => Ok(RawResponse::json(404, &json!({"detail": "Not found."}))),
        _ => {
            v.fetch_add(1, Ordering::SeqCst);
            ok(json!({"id": 1}))
        }
    });
    (version, transport)
}

#[tokio::test]
async fn cached_read_is_served_without_network() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    let first = client.resource(Resource::Patients).list(&[]).await.unwrap();
    let second = client.resource(Resource::Patients).list(&[]).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.count("/patients/"), 1);
}

#[tokio::test]
async fn filter_order_does_not_split_the_cache() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    let patients = client.resource(Resource::Patients);
    patients
        .list(&[("search", "ama"), ("gender", "F")])
        .await
        .unwrap();
    patients
        .list(&[("gender", "F"), ("search", "ama")])
        .await
        .unwrap();
    patients.list(&[("search", "kofi")]).await.unwrap();

    assert_eq!(transport.count("/patients/"), 2);
    assert_eq!(client.cache().len().await, 2);
}

#[tokio::test]
async fn write_invalidates_its_resource_only() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    let before = client.resource(Resource::Patients).list(&[]).await.unwrap();
    client.resource(Resource::Patients).get(3).await.unwrap();
    client.resource(Resource::Inventory).list(&[]).await.unwrap();
    assert_eq!(before["version"], 0);

    client
        .resource(Resource::Patients)
        .create(json!({"first_name": "Ama"}))
        .await
        .unwrap();

    let after = client.resource(Resource::Patients).list(&[]).await.unwrap();
    assert_eq!(after["version"], 1);
    assert_eq!(transport.count("/patients/"), 3);

    // Untouched resource still served from cache.
    client.resource(Resource::Inventory).list(&[]).await.unwrap();
    assert_eq!(transport.count("/inventory/"), 1);
}

#[tokio::test]
async fn failed_write_keeps_cache() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    client.resource(Resource::Patients).list(&[]).await.unwrap();
    let err = client
        .resource(Resource::Patients)
        .delete(9)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));

    client.resource(Resource::Patients).list(&[]).await.unwrap();
    assert_eq!(transport.count("/patients/"), 1);
}

#[tokio::test]
async fn uncached_reads_always_hit_the_network() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    client.request(ApiRequest::get("/visits/active/")).await.unwrap();
    client.request(ApiRequest::get("/visits/active/")).await.unwrap();
    assert_eq!(transport.count("/visits/active/"), 2);
    assert!(client.cache().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn cached_entries_expire_after_ttl() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    client.resource(Resource::Staff).list(&[]).await.unwrap();
    tokio::time::advance(Duration::from_secs(299)).await;
    client.resource(Resource::Staff).list(&[]).await.unwrap();
    assert_eq!(transport.count("/staff/"), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    client.resource(Resource::Staff).list(&[]).await.unwrap();
    assert_eq!(transport.count("/staff/"), 2);
}

#[tokio::test]
async fn login_starts_with_an_empty_cache() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();
    client.resource(Resource::Billing).list(&[]).await.unwrap();
    assert_eq!(client.cache().len().await, 1);

    client.login("kofi", "pw").await.unwrap();
    assert!(client.cache().is_empty().await);
}

#[tokio::test]
async fn manual_clear_by_prefix() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    client.resource(Resource::Lab).list(&[]).await.unwrap();
    client.resource(Resource::Visits).list(&[]).await.unwrap();

    assert_eq!(client.clear_cache(Some("lab")).await, 1);
    assert_eq!(client.cache().len().await, 1);
    assert_eq!(client.clear_cache(None).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_in_flight_across_a_write_is_not_cached() {
    let (_, transport) = counting_backend();
    let client = client_with(transport.clone());
    client.login("ama", "pw").await.unwrap();

    let gate = transport.gate("/patients/");
    let reader = client.clone();
    let read = tokio::spawn(async move { reader.resource(Resource::Patients).list(&[]).await });
    wait_for_sends(&transport, |r| r.path == "/patients/", 1).await;

    client
        .resource(Resource::Patients)
        .update(3, json!({"first_name": "Ama"}))
        .await
        .unwrap();
    gate.open();

    // The read began before the write, so its answer is handed back but not kept.
    read.await.unwrap().unwrap();
    assert!(client.cache().is_empty().await);

    let fresh = client.resource(Resource::Patients).list(&[]).await.unwrap();
    assert_eq!(fresh["version"], 1);
    assert_eq!(transport.count("/patients/"), 2);
    assert_eq!(client.cache().len().await, 1);
}
