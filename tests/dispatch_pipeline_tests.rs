//! End-to-end dispatch pipeline: executor → dispatch channel → publisher →
//! webhook sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use timemachine::executor::Executor;
use timemachine::job::{current_millis, Job};
use timemachine::publisher::Publisher;
use timemachine::route::Route;
use timemachine::route_table::RouteTable;

fn job(id: &str, trigger_ms: i64) -> Job {
    Job {
        id: id.into(),
        trigger_ms,
        meta: serde_json::json!({"foo": "bar"}),
        route: "R1".into(),
    }
}

async fn webhook_server(expected_posts: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(body_json(serde_json::json!({"foo": "bar"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(expected_posts)
        .mount(&server)
        .await;
    server
}

fn pipeline(server_uri: &str) -> (Arc<Executor>, Publisher) {
    let routes = Arc::new(RouteTable::new());
    routes.add(Route::http("R1", format!("{}/cb", server_uri)));

    let (executor, dispatch_rx) = Executor::start(
        Duration::from_secs(3),
        Duration::from_millis(50),
        64,
    );
    let publisher = Publisher::start(routes, dispatch_rx, 2, Duration::from_secs(5));
    (executor, publisher)
}

#[tokio::test]
async fn write_then_fire_posts_exactly_once() {
    let server = webhook_server(1).await;
    let (executor, publisher) = pipeline(&server.uri());

    executor.queue(job("job-1", current_millis() + 1_000)).unwrap();

    sleep(Duration::from_millis(2_500)).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "expected exactly one webhook delivery");
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&requests[0].body).unwrap(),
        serde_json::json!({"foo": "bar"})
    );

    executor.close().await;
    publisher.wait().await;
}

#[tokio::test]
async fn update_moves_the_fire_time() {
    let server = webhook_server(1).await;
    let (executor, publisher) = pipeline(&server.uri());

    let t0 = current_millis();
    executor.queue(job("j3", t0 + 800)).unwrap();
    // Before the first trigger passes, push the job out.
    executor.queue(job("j3", t0 + 2_000)).unwrap();

    // After the original trigger, nothing has fired yet.
    sleep(Duration::from_millis(1_300)).await;
    assert!(server.received_requests().await.unwrap().is_empty());

    // After the updated trigger, exactly one delivery happened.
    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    executor.close().await;
    publisher.wait().await;
}

#[tokio::test]
async fn delete_suppresses_the_fire() {
    let server = webhook_server(0).await;
    let (executor, publisher) = pipeline(&server.uri());

    executor.queue(job("j4", current_millis() + 800)).unwrap();
    executor.delete("j4").unwrap();

    sleep(Duration::from_millis(1_800)).await;
    assert!(server.received_requests().await.unwrap().is_empty());

    executor.close().await;
    publisher.wait().await;
}

#[tokio::test]
async fn failed_sink_does_not_stall_the_pool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (executor, publisher) = pipeline(&server.uri());

    // Two jobs against a failing sink: both attempts happen, neither blocks
    // shutdown.
    executor.queue(job("a", current_millis() + 300)).unwrap();
    executor.queue(job("b", current_millis() + 400)).unwrap();

    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    executor.close().await;
    publisher.wait().await;
}
