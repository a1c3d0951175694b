#![allow(missing_docs)]
#![allow(dead_code)]
use std::sync::{Arc, Once};
use tokio::time::{sleep, Duration};

use weir::Runtime;

mod dependencies;
use dependencies::{capture, metagen, stall};

static REGISTER: Once = Once::new();

fn register_test_plugins() {
    REGISTER.call_once(|| {
        capture::register_capture().unwrap();
        metagen::register_metagen().unwrap();
        stall::register_stall().unwrap();
    });
}

#[tokio::test]
async fn broadcast_fans_out_to_every_producer() {
    let config = "consumers:
  - stream: s
    generator:
      messages: [a, b, c]
routers:
  - stream: s
    broadcast: {}
producers:
  - label: first
    stream: s
    capture:
      key: bc_first
  - label: second
    stream: s
    capture:
      key: bc_second";

    register_test_plugins();

    let pipeline = Runtime::from_config(config).await.unwrap();
    pipeline.run().await.unwrap();

    let expected = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    assert_eq!(capture::captured("bc_first"), expected);
    assert_eq!(capture::captured("bc_second"), expected);
}

#[tokio::test]
async fn round_robin_alternates_between_producers() {
    let config = "consumers:
  - stream: rr
    generator:
      messages: [x1, x2, x3, x4]
routers:
  - stream: rr
    round_robin: {}
producers:
  - stream: rr
    capture:
      key: rr_a
  - stream: rr
    capture:
      key: rr_b";

    register_test_plugins();

    let pipeline = Runtime::from_config(config).await.unwrap();
    pipeline.run().await.unwrap();

    let a = capture::captured("rr_a");
    let b = capture::captured("rr_b");
    assert_eq!(a.len(), 2, "a={a:?} b={b:?}");
    assert_eq!(b.len(), 2, "a={a:?} b={b:?}");

    // the interleaved union preserves input order
    let mut merged: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
    merged.sort();
    assert_eq!(merged, vec!["x1", "x2", "x3", "x4"]);
    assert!(a == vec!["x2", "x4"] || a == vec!["x1", "x3"], "a={a:?}");
}

#[tokio::test]
async fn regex_filter_drops_matching_messages() {
    let config = "consumers:
  - stream: filt
    modulators:
      - regex_filter:
          deny: Z
    generator:
      messages: [abc, 123Z, def]
producers:
  - stream: filt
    capture:
      key: filtered_out";

    register_test_plugins();

    let pipeline = Runtime::from_config(config).await.unwrap();
    pipeline.run().await.unwrap();

    assert_eq!(capture::captured("filtered_out"), vec!["abc", "def"]);
    assert_eq!(pipeline.telemetry().value("messages.filtered"), 1);
}

#[tokio::test]
async fn file_rotation_by_size_loses_no_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let chunk = "x".repeat(99); // 100 bytes per line with the newline
    let lines = std::iter::repeat(chunk.as_str())
        .take(30)
        .collect::<Vec<_>>()
        .join(", ");
    let config = format!(
        "consumers:
  - stream: logs
    generator:
      messages: [{lines}]
producers:
  - stream: logs
    file:
      path: {}/data.log
      timestamp_pattern: gen
      max_size: 1kb
      batch:
        count: 8
        timeout: 50ms",
        dir.path().display()
    );

    register_test_plugins();

    let pipeline = Runtime::from_config(&config).await.unwrap();
    pipeline.run().await.unwrap();
    // detached rotation finalizers
    sleep(Duration::from_millis(300)).await;

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert!(names.len() >= 3, "expected at least three files: {names:?}");

    let mut total = 0u64;
    for name in &names {
        let size = std::fs::metadata(dir.path().join(name)).unwrap().len();
        assert!(size <= 1024, "{name} is {size} bytes");
        total += size;
    }
    assert_eq!(total, 30 * 100, "no lost bytes across {names:?}");
}

#[tokio::test]
async fn saturated_producer_falls_back_instead_of_dropping() {
    let config = "shutdown_timeout: 10s
consumers:
  - stream: busy
    generator:
      messages: [m0, m1, m2, m3, m4, m5, m6, m7, m8, m9]
producers:
  - label: narrow
    stream: busy
    channel: 2
    timeout: 100ms
    fallback: drops
    stall:
      key: saturated
  - label: overflow
    stream: drops
    capture:
      key: drops_capture";

    register_test_plugins();

    let pipeline = Arc::new(Runtime::from_config(config).await.unwrap());
    let runner = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run().await }
    });

    // wait for the narrow producer to saturate and divert the rest
    let mut waited = Duration::ZERO;
    while capture::captured("drops_capture").len() < 7 && waited < Duration::from_secs(5) {
        sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    stall::release("saturated");

    runner.await.unwrap().unwrap();

    let diverted = capture::captured("drops_capture").len() as u64;
    let written = stall::written("saturated");
    assert!(diverted >= 7, "expected most messages on the fallback, got {diverted}");
    assert_eq!(diverted + written, 10, "no message may be lost");
}

#[tokio::test]
async fn metadata_router_redirects_to_named_stream() {
    let config = "consumers:
  - stream: meta
    metagen:
      events:
        - payload: boom
          metadata:
            Stream: errors
        - payload: plain
routers:
  - stream: meta
    metadata:
      key: Stream
producers:
  - label: errors_sink
    stream: errors
    capture:
      key: meta_errors
  - label: default_sink
    stream: meta
    capture:
      key: meta_default";

    register_test_plugins();

    let pipeline = Runtime::from_config(config).await.unwrap();
    pipeline.run().await.unwrap();

    assert_eq!(capture::captured("meta_errors"), vec!["boom"]);
    assert_eq!(capture::captured("meta_default"), vec!["plain"]);
}

#[tokio::test]
async fn producer_modulators_apply_after_routing() {
    let config = "consumers:
  - stream: wrap
    generator:
      messages: [one, two]
producers:
  - stream: wrap
    modulators:
      - envelope:
          prefix: '<'
          postfix: '>'
    capture:
      key: wrapped";

    register_test_plugins();

    let pipeline = Runtime::from_config(config).await.unwrap();
    pipeline.run().await.unwrap();

    assert_eq!(capture::captured("wrapped"), vec!["<one>", "<two>"]);
}

#[tokio::test]
async fn distribute_copies_across_streams() {
    let config = "consumers:
  - stream: src
    generator:
      messages: [evt]
routers:
  - stream: src
    distribute:
      targets: [copy_a, copy_b]
producers:
  - stream: copy_a
    capture:
      key: dist_a
  - stream: copy_b
    capture:
      key: dist_b";

    register_test_plugins();

    let pipeline = Runtime::from_config(config).await.unwrap();
    pipeline.run().await.unwrap();

    assert_eq!(capture::captured("dist_a"), vec!["evt"]);
    assert_eq!(capture::captured("dist_b"), vec!["evt"]);
}

#[tokio::test]
async fn stream_route_formatter_moves_messages() {
    let config = "consumers:
  - stream: origin
    modulators:
      - stream_route:
          stream: elsewhere
    generator:
      messages: [hop]
producers:
  - stream: elsewhere
    capture:
      key: rerouted
  - stream: origin
    capture:
      key: origin_sink";

    register_test_plugins();

    let pipeline = Runtime::from_config(config).await.unwrap();
    pipeline.run().await.unwrap();

    assert_eq!(capture::captured("rerouted"), vec!["hop"]);
    assert!(capture::captured("origin_sink").is_empty());
}
