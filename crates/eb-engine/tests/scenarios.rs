//! End-to-end pipeline scenarios, exercised against in-memory fakes instead
//! of real connectors: pass-through, predicate gating, per-message error
//! isolation, and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eb_core::{
    BridgeConfig, ConnectorRegistry, EventBridgeError, Message, MessageStream, Operator,
    ReplyData, Result, Runner, RunnerConfig, Source, SourceAdapter, SourceConfig, Target,
    TargetConfig,
};
use eb_engine::Bridge;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct TestAdapter {
    acks: Arc<Mutex<Vec<Vec<u8>>>>,
    naks: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl SourceAdapter for TestAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(vec![])
    }
    async fn ack(&self, id: &[u8]) -> anyhow::Result<()> {
        self.acks.lock().await.push(id.to_vec());
        Ok(())
    }
    async fn nak(&self, id: &[u8]) -> anyhow::Result<()> {
        self.naks.lock().await.push(id.to_vec());
        Ok(())
    }
    async fn reply(&self, _id: &[u8], _reply: ReplyData) -> anyhow::Result<bool> {
        Ok(false)
    }
}

type SourceItem = (Vec<u8>, HashMap<String, String>, Vec<u8>);

struct VecSource {
    items: Vec<SourceItem>,
    adapter: Arc<TestAdapter>,
}

impl Operator for VecSource {
    fn name(&self) -> &str {
        "vec-source"
    }
}

#[async_trait]
impl Source for VecSource {
    async fn produce(&mut self, _buffer: usize) -> Result<MessageStream> {
        let adapter: Arc<dyn SourceAdapter> = self.adapter.clone();
        let items = std::mem::take(&mut self.items);
        let stream = futures::stream::iter(items.into_iter().map(move |(id, meta, payload)| {
            Message::with_source_data(id, adapter.clone(), meta, payload)
        }));
        Ok(Box::pin(stream))
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct AppendRunner {
    name: String,
    suffix: &'static str,
}

impl Operator for AppendRunner {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Runner for AppendRunner {
    async fn process(&mut self, msg: &mut Message) -> Result<()> {
        let mut data = msg.data().await?.to_vec();
        data.extend_from_slice(self.suffix.as_bytes());
        msg.set_data(data);
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct UppercaseRunner;

impl Operator for UppercaseRunner {
    fn name(&self) -> &str {
        "uppercase"
    }
}

#[async_trait]
impl Runner for UppercaseRunner {
    async fn process(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_ascii_uppercase();
        msg.set_data(data);
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ErroringRunner;

impl Operator for ErroringRunner {
    fn name(&self) -> &str {
        "erroring-runner"
    }
}

#[async_trait]
impl Runner for ErroringRunner {
    async fn process(&mut self, msg: &mut Message) -> Result<()> {
        let data = msg.data().await?.to_vec();
        if data == b"bad" {
            return Err(EventBridgeError::RunnerProcess(anyhow::anyhow!("boom")));
        }
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct RecordingTarget {
    seen: Arc<Mutex<Vec<String>>>,
    fail_first: Arc<AtomicUsize>,
}

impl Operator for RecordingTarget {
    fn name(&self) -> &str {
        "recording-target"
    }
}

#[async_trait]
impl Target for RecordingTarget {
    async fn consume(&mut self, msg: &mut Message) -> Result<()> {
        // `fetch_sub` on an already-zero counter would underflow, so guard
        // with a compare-and-swap instead of blindly decrementing.
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(EventBridgeError::TargetConsume(anyhow::anyhow!("transient")));
        }
        let data = msg.data().await?.to_vec();
        self.seen
            .lock()
            .await
            .push(String::from_utf8_lossy(&data).into_owned());
        Ok(())
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn source_config(kind: &str) -> SourceConfig {
    SourceConfig {
        kind: kind.to_string(),
        buffer: 16,
        options: Value::Null,
    }
}

fn runner_config(kind: &str, if_expr: Option<&str>, filter_expr: Option<&str>) -> RunnerConfig {
    RunnerConfig {
        kind: kind.to_string(),
        routines: 1,
        if_expr: if_expr.map(String::from),
        filter_expr: filter_expr.map(String::from),
        options: Value::Null,
    }
}

fn target_config(kind: &str) -> TargetConfig {
    TargetConfig {
        kind: kind.to_string(),
        routines: 1,
        options: Value::Null,
    }
}

fn new_adapter() -> (Arc<TestAdapter>, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let acks = Arc::new(Mutex::new(Vec::new()));
    let naks = Arc::new(Mutex::new(Vec::new()));
    let adapter = Arc::new(TestAdapter {
        acks: acks.clone(),
        naks: naks.clone(),
    });
    (adapter, acks, naks)
}

#[tokio::test]
async fn s1_pass_through_single_runner_single_target() {
    let (adapter, acks, naks) = new_adapter();
    let items = vec![
        (b"a".to_vec(), HashMap::new(), b"1".to_vec()),
        (b"b".to_vec(), HashMap::new(), b"2".to_vec()),
        (b"c".to_vec(), HashMap::new(), b"3".to_vec()),
    ];

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "vec",
        Box::new(move |_| {
            Ok(Box::new(VecSource {
                items: items.clone(),
                adapter: adapter.clone(),
            }) as Box<dyn Source>)
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        registry.register_target(
            "recording",
            Box::new(move |_| {
                Ok(Box::new(RecordingTarget {
                    seen: seen.clone(),
                    fail_first: Arc::new(AtomicUsize::new(0)),
                }) as Box<dyn Target>)
            }),
        );
    }

    let config = BridgeConfig {
        source: source_config("vec"),
        runners: vec![runner_config("pass", None, None)],
        target: Some(target_config("recording")),
        services: vec![],
    };

    let bridge = Bridge::build(config, &registry).unwrap();
    let mut running = bridge.spawn(CancellationToken::new()).await.unwrap();
    running.join().await;
    running.close().await.unwrap();

    assert_eq!(*seen.lock().await, vec!["1", "2", "3"]);
    assert_eq!(*acks.lock().await, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    assert!(naks.lock().await.is_empty());
}

#[tokio::test]
async fn s2_runner_rewrites_payload() {
    let (adapter, acks, naks) = new_adapter();
    let items = vec![(b"a".to_vec(), HashMap::new(), b"hello".to_vec())];

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "vec",
        Box::new(move |_| {
            Ok(Box::new(VecSource {
                items: items.clone(),
                adapter: adapter.clone(),
            }) as Box<dyn Source>)
        }),
    );
    registry.register_runner("uppercase", Box::new(|_| Ok(Box::new(UppercaseRunner) as Box<dyn Runner>)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        registry.register_target(
            "recording",
            Box::new(move |_| {
                Ok(Box::new(RecordingTarget {
                    seen: seen.clone(),
                    fail_first: Arc::new(AtomicUsize::new(0)),
                }) as Box<dyn Target>)
            }),
        );
    }

    let config = BridgeConfig {
        source: source_config("vec"),
        runners: vec![runner_config("uppercase", None, None)],
        target: Some(target_config("recording")),
        services: vec![],
    };

    let bridge = Bridge::build(config, &registry).unwrap();
    let mut running = bridge.spawn(CancellationToken::new()).await.unwrap();
    running.join().await;
    running.close().await.unwrap();

    assert_eq!(*seen.lock().await, vec!["HELLO"]);
    assert_eq!(acks.lock().await.len(), 1);
    assert!(naks.lock().await.is_empty());
}

#[tokio::test]
async fn s3_if_expr_skips_a_runner() {
    let (adapter, acks, naks) = new_adapter();
    let mut flag_yes = HashMap::new();
    flag_yes.insert("flag".to_string(), "yes".to_string());
    let mut flag_no = HashMap::new();
    flag_no.insert("flag".to_string(), "no".to_string());
    let items = vec![
        (b"a".to_vec(), flag_yes, b"A".to_vec()),
        (b"b".to_vec(), flag_no, b"B".to_vec()),
    ];

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "vec",
        Box::new(move |_| {
            Ok(Box::new(VecSource {
                items: items.clone(),
                adapter: adapter.clone(),
            }) as Box<dyn Source>)
        }),
    );
    registry.register_runner(
        "append1",
        Box::new(|_| {
            Ok(Box::new(AppendRunner {
                name: "r1".to_string(),
                suffix: "-r1",
            }) as Box<dyn Runner>)
        }),
    );
    registry.register_runner(
        "append2",
        Box::new(|_| {
            Ok(Box::new(AppendRunner {
                name: "r2".to_string(),
                suffix: "-r2",
            }) as Box<dyn Runner>)
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        registry.register_target(
            "recording",
            Box::new(move |_| {
                Ok(Box::new(RecordingTarget {
                    seen: seen.clone(),
                    fail_first: Arc::new(AtomicUsize::new(0)),
                }) as Box<dyn Target>)
            }),
        );
    }

    let config = BridgeConfig {
        source: source_config("vec"),
        runners: vec![
            runner_config("append1", None, None),
            runner_config("append2", Some(r#"metadata("flag") == "yes""#), None),
        ],
        target: Some(target_config("recording")),
        services: vec![],
    };

    let bridge = Bridge::build(config, &registry).unwrap();
    let mut running = bridge.spawn(CancellationToken::new()).await.unwrap();
    running.join().await;
    running.close().await.unwrap();

    assert_eq!(*seen.lock().await, vec!["A-r1-r2", "B-r1"]);
    assert_eq!(acks.lock().await.len(), 2);
    assert!(naks.lock().await.is_empty());
}

#[tokio::test]
async fn s4_filter_expr_drops_with_ack() {
    let (adapter, acks, naks) = new_adapter();
    let items = vec![(b"a".to_vec(), HashMap::new(), Vec::new())];

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "vec",
        Box::new(move |_| {
            Ok(Box::new(VecSource {
                items: items.clone(),
                adapter: adapter.clone(),
            }) as Box<dyn Source>)
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        registry.register_target(
            "recording",
            Box::new(move |_| {
                Ok(Box::new(RecordingTarget {
                    seen: seen.clone(),
                    fail_first: Arc::new(AtomicUsize::new(0)),
                }) as Box<dyn Target>)
            }),
        );
    }

    let config = BridgeConfig {
        source: source_config("vec"),
        runners: vec![runner_config("pass", None, Some("data_len > 0"))],
        target: Some(target_config("recording")),
        services: vec![],
    };

    let bridge = Bridge::build(config, &registry).unwrap();
    let mut running = bridge.spawn(CancellationToken::new()).await.unwrap();
    running.join().await;
    running.close().await.unwrap();

    assert!(seen.lock().await.is_empty());
    assert_eq!(acks.lock().await.len(), 1);
    assert!(naks.lock().await.is_empty());
}

#[tokio::test]
async fn s5_runner_error_naks_and_does_not_stall() {
    let (adapter, acks, naks) = new_adapter();
    let items = vec![
        (b"a".to_vec(), HashMap::new(), b"bad".to_vec()),
        (b"b".to_vec(), HashMap::new(), b"good".to_vec()),
    ];

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "vec",
        Box::new(move |_| {
            Ok(Box::new(VecSource {
                items: items.clone(),
                adapter: adapter.clone(),
            }) as Box<dyn Source>)
        }),
    );
    registry.register_runner("erroring", Box::new(|_| Ok(Box::new(ErroringRunner) as Box<dyn Runner>)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        registry.register_target(
            "recording",
            Box::new(move |_| {
                Ok(Box::new(RecordingTarget {
                    seen: seen.clone(),
                    fail_first: Arc::new(AtomicUsize::new(0)),
                }) as Box<dyn Target>)
            }),
        );
    }

    let config = BridgeConfig {
        source: source_config("vec"),
        runners: vec![runner_config("erroring", None, None)],
        target: Some(target_config("recording")),
        services: vec![],
    };

    let bridge = Bridge::build(config, &registry).unwrap();
    let mut running = bridge.spawn(CancellationToken::new()).await.unwrap();
    running.join().await;
    running.close().await.unwrap();

    assert_eq!(*seen.lock().await, vec!["good"]);
    assert_eq!(*naks.lock().await, vec![b"a".to_vec()]);
    assert_eq!(*acks.lock().await, vec![b"b".to_vec()]);
}

#[tokio::test]
async fn s6_target_error_then_success() {
    let (adapter, acks, naks) = new_adapter();
    let items = vec![
        (b"a".to_vec(), HashMap::new(), b"first".to_vec()),
        (b"b".to_vec(), HashMap::new(), b"second".to_vec()),
    ];

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "vec",
        Box::new(move |_| {
            Ok(Box::new(VecSource {
                items: items.clone(),
                adapter: adapter.clone(),
            }) as Box<dyn Source>)
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        registry.register_target(
            "flaky",
            Box::new(move |_| {
                Ok(Box::new(RecordingTarget {
                    seen: seen.clone(),
                    fail_first: Arc::new(AtomicUsize::new(1)),
                }) as Box<dyn Target>)
            }),
        );
    }

    let config = BridgeConfig {
        source: source_config("vec"),
        runners: vec![runner_config("pass", None, None)],
        target: Some(target_config("flaky")),
        services: vec![],
    };

    let bridge = Bridge::build(config, &registry).unwrap();
    let mut running = bridge.spawn(CancellationToken::new()).await.unwrap();
    running.join().await;
    running.close().await.unwrap();

    assert_eq!(*seen.lock().await, vec!["second"]);
    assert_eq!(*naks.lock().await, vec![b"a".to_vec()]);
    assert_eq!(*acks.lock().await, vec![b"b".to_vec()]);
}

#[tokio::test]
async fn s7_cancellation_mid_flight_drains_without_hanging() {
    let (adapter, acks, naks) = new_adapter();
    let items: Vec<SourceItem> = (0..50u32)
        .map(|i| (i.to_be_bytes().to_vec(), HashMap::new(), b"x".to_vec()))
        .collect();
    let total = items.len();

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "vec",
        Box::new(move |_| {
            Ok(Box::new(VecSource {
                items: items.clone(),
                adapter: adapter.clone(),
            }) as Box<dyn Source>)
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        registry.register_target(
            "recording",
            Box::new(move |_| {
                Ok(Box::new(RecordingTarget {
                    seen: seen.clone(),
                    fail_first: Arc::new(AtomicUsize::new(0)),
                }) as Box<dyn Target>)
            }),
        );
    }

    let config = BridgeConfig {
        source: source_config("vec"),
        runners: vec![runner_config("pass", None, None)],
        target: Some(target_config("recording")),
        services: vec![],
    };

    let bridge = Bridge::build(config, &registry).unwrap();
    let cancel = CancellationToken::new();
    let mut running = bridge.spawn(cancel.clone()).await.unwrap();

    cancel.cancel();
    let joined = tokio::time::timeout(std::time::Duration::from_secs(5), running.join()).await;
    assert!(joined.is_ok(), "pipeline did not drain after cancellation");

    assert!(running.close().await.is_ok());
    // Idempotent: a second close call reports the same (empty) result.
    assert!(running.close().await.is_ok());

    let terminated = acks.lock().await.len() + naks.lock().await.len();
    assert!(terminated <= total);
}
