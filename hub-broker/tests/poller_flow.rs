//! Session poller flows: startup snapshot, new-session registration,
//! session-gone handling.

use std::sync::Arc;
use std::time::Duration;

use hub_broker::metrics::Metrics;
use hub_broker::paths::HubPaths;
use hub_broker::poller::SessionPoller;
use hub_broker::registrar::Registrar;
use hub_broker::relay::RelayClient;
use hub_broker::session_cache::SessionCache;
use hub_broker::store::StateStore;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Setup {
    _tmp: tempfile::TempDir,
    server: MockServer,
    store: Arc<StateStore>,
    poller: SessionPoller,
}

async fn setup() -> Setup {
    let tmp = tempfile::tempdir().unwrap();
    let paths = HubPaths::new(tmp.path().join("hub"));
    paths.ensure_dirs().unwrap();

    let server = MockServer::start().await;
    let metrics = Metrics::new();
    let store = Arc::new(StateStore::load(paths.clone()).unwrap());
    let relay = Arc::new(RelayClient::new(server.uri(), Duration::from_secs(2)));
    // Zero TTL so every tick refetches and the mock sequence advances.
    let cache = Arc::new(SessionCache::new(Duration::ZERO, metrics.clone()));
    let registrar = Arc::new(Registrar::new(
        store.clone(),
        relay.clone(),
        metrics.clone(),
        paths,
        1,
        3600,
        false,
    ));
    let poller = SessionPoller::new(
        relay,
        cache,
        store.clone(),
        registrar,
        metrics,
        Duration::from_secs(5),
    );

    Setup {
        _tmp: tmp,
        server,
        store,
        poller,
    }
}

async fn mount_listing_once(server: &MockServer, ids: &[&str]) {
    let body: Vec<_> = ids
        .iter()
        .map(|id| json!({ "id": id, "slug": id.trim_start_matches("ses_"), "directory": "/w" }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn preexisting_sessions_are_never_oriented() {
    let s = setup().await;

    // No POST mock is mounted with an expectation of zero injections.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&s.server)
        .await;

    mount_listing_once(&s.server, &["ses_pre"]).await;
    s.poller.tick().await;

    assert!(s.store.session_known("ses_pre"));
    assert!(!s.store.is_oriented("ses_pre"), "pre-existing stays un-oriented");

    // Second tick with the same listing: still nothing new.
    mount_listing_once(&s.server, &["ses_pre"]).await;
    s.poller.tick().await;
    assert!(!s.store.is_oriented("ses_pre"));
}

#[tokio::test]
async fn preexisting_mapped_session_bootstraps_as_oriented() {
    let s = setup().await;
    s.store.map_session("ses_pre", "old-friend").unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&s.server)
        .await;

    mount_listing_once(&s.server, &["ses_pre"]).await;
    s.poller.tick().await;

    assert!(
        s.store.is_oriented("ses_pre"),
        "mapped pre-existing sessions bootstrap into the oriented set without injection"
    );
}

#[tokio::test]
async fn new_session_is_registered_and_oriented() {
    let s = setup().await;

    Mock::given(method("POST"))
        .and(path("/session/ses_new/prompt_async"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&s.server)
        .await;

    mount_listing_once(&s.server, &["ses_pre"]).await;
    s.poller.tick().await;

    mount_listing_once(&s.server, &["ses_pre", "ses_new"]).await;
    s.poller.tick().await;

    assert_eq!(s.store.agent_for_session("ses_new").as_deref(), Some("new"));
    assert!(s.store.is_oriented("ses_new"));
    assert!(s.store.agent("new").is_some());
}

#[tokio::test]
async fn gone_session_leaves_agent_but_drops_oriented_entry() {
    let s = setup().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&s.server)
        .await;

    mount_listing_once(&s.server, &[]).await;
    s.poller.tick().await; // empty snapshot

    mount_listing_once(&s.server, &["ses_a"]).await;
    s.poller.tick().await;
    assert!(s.store.is_oriented("ses_a"));

    mount_listing_once(&s.server, &[]).await;
    s.poller.tick().await;

    assert!(!s.store.session_known("ses_a"));
    assert!(!s.store.is_oriented("ses_a"), "oriented entry removed with session");
    assert!(s.store.agent("a").is_some(), "agent record is GC's job, not the poller's");
    assert_eq!(s.store.agent_for_session("ses_a").as_deref(), Some("a"));
}

#[tokio::test]
async fn failed_poll_marks_nothing_gone() {
    let s = setup().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&s.server)
        .await;

    mount_listing_once(&s.server, &[]).await;
    s.poller.tick().await;
    mount_listing_once(&s.server, &["ses_a"]).await;
    s.poller.tick().await;
    assert!(s.store.session_known("ses_a"));

    // Relay flaps: 503 on the next poll.
    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&s.server)
        .await;
    s.poller.tick().await;

    assert!(s.store.session_known("ses_a"), "unavailable poll is not evidence of absence");
    assert!(s.store.is_oriented("ses_a"));
}

#[tokio::test]
async fn session_that_returns_after_gone_is_reoriented() {
    let s = setup().await;

    Mock::given(method("POST"))
        .and(path("/session/ses_a/prompt_async"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2) // once on arrival, once on return
        .mount(&s.server)
        .await;

    mount_listing_once(&s.server, &[]).await;
    s.poller.tick().await;

    mount_listing_once(&s.server, &["ses_a"]).await;
    s.poller.tick().await;
    let first_id = s.store.agent_for_session("ses_a");
    assert!(first_id.is_some());

    mount_listing_once(&s.server, &[]).await;
    s.poller.tick().await;

    mount_listing_once(&s.server, &["ses_a"]).await;
    s.poller.tick().await;

    // Same identity, fresh orientation.
    assert_eq!(s.store.agent_for_session("ses_a"), first_id);
    assert!(s.store.is_oriented("ses_a"));
}
