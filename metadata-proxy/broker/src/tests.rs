use super::*;
use chrono::{TimeZone, Utc};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

const ROLE: &str = "arn:aws:iam::111122223333:role/payments-svc";

/// Stands in for STS, replaying scripted results after a fixed delay.
#[derive(Default)]
struct MockSts {
    delay: Duration,
    script: parking_lot::Mutex<VecDeque<Result<(), AssumeRoleError>>>,
    requests: parking_lot::Mutex<Vec<AssumeRoleRequest>>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl AssumeRole for MockSts {
    async fn assume_role(&self, req: AssumeRoleRequest) -> Result<Credentials, AssumeRoleError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(req);
        time::sleep(self.delay).await;
        let next = self.script.lock().pop_front().unwrap_or(Ok(()));
        next.map(|()| {
            let issued = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            Credentials::issued(
                format!("AKIA{n}"),
                "secret",
                "token",
                issued + chrono::Duration::minutes(30),
                issued,
            )
        })
    }
}

impl MockSts {
    fn scripted(results: impl IntoIterator<Item = Result<(), AssumeRoleError>>) -> Arc<Self> {
        Arc::new(Self {
            script: parking_lot::Mutex::new(results.into_iter().collect()),
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn broker(sts: Arc<MockSts>) -> (Broker, BrokerMetrics) {
    let metrics = BrokerMetrics::default();
    let config = Config {
        backoff: Backoff {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(10),
            max_elapsed_time: Duration::from_secs(1),
            multiplier: 1.0,
            randomization_factor: 0.0,
        },
        ..Config::default()
    };
    (Broker::new(sts, config, metrics.clone()), metrics)
}

fn caller() -> IpAddr {
    "10.0.0.5".parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_call() {
    let sts = Arc::new(MockSts {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let (broker, metrics) = broker(sts.clone());

    let results = futures::future::join_all((0..16).map(|_| broker.assume(ROLE, None, caller()))).await;

    assert_eq!(sts.calls(), 1);
    let first = results[0].as_ref().unwrap();
    for res in &results {
        assert!(Arc::ptr_eq(first, res.as_ref().unwrap()));
    }
    assert_eq!(metrics.counts(), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_call_across_tasks() {
    let sts = Arc::new(MockSts {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let (broker, _) = broker(sts.clone());

    let tasks = (0..8)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.assume(ROLE, None, caller()).await })
        })
        .collect::<Vec<_>>();
    let mut keys = Vec::new();
    for task in tasks {
        keys.push(task.await.unwrap().unwrap().access_key_id.clone());
    }

    assert_eq!(sts.calls(), 1);
    assert!(keys.iter().all(|k| k == "AKIA0"));
}

#[tokio::test(start_paused = true)]
async fn cached_until_ttl_expires() {
    let sts = MockSts::scripted([]);
    let (broker, metrics) = broker(sts.clone());

    let a = broker.assume(ROLE, None, caller()).await.unwrap();
    time::advance(Duration::from_secs(29)).await;
    let b = broker.assume(ROLE, None, caller()).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(sts.calls(), 1);

    time::advance(Duration::from_secs(2)).await;
    let c = broker.assume(ROLE, None, caller()).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(c.access_key_id, "AKIA1");
    assert_eq!(sts.calls(), 2);
    assert_eq!(metrics.counts(), (1, 2));
}

#[tokio::test(start_paused = true)]
async fn cache_is_per_role() {
    let sts = MockSts::scripted([]);
    let (broker, _) = broker(sts.clone());

    broker.assume(ROLE, None, caller()).await.unwrap();
    broker
        .assume("arn:aws:iam::111122223333:role/ledger", None, caller())
        .await
        .unwrap();
    assert_eq!(sts.calls(), 2);

    broker.clear();
    broker.assume(ROLE, None, caller()).await.unwrap();
    assert_eq!(sts.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let sts = MockSts::scripted([
        Err(AssumeRoleError::Throttled("slow down".into())),
        Err(AssumeRoleError::Timeout),
        Ok(()),
    ]);
    let (broker, _) = broker(sts.clone());

    let creds = broker.assume(ROLE, None, caller()).await.unwrap();
    assert_eq!(creds.access_key_id, "AKIA2");
    assert_eq!(sts.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_failures_are_not_retried_or_cached() {
    let denied = AssumeRoleError::Denied("not authorized".into());
    let sts = MockSts::scripted([Err(denied.clone())]);
    let (broker, _) = broker(sts.clone());

    let err = broker.assume(ROLE, None, caller()).await.unwrap_err();
    assert_eq!(err.assume_role_error(), Some(&denied));
    assert_eq!(sts.calls(), 1);

    // The failure is not cached.
    broker.assume(ROLE, None, caller()).await.unwrap();
    assert_eq!(sts.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn request_carries_session_and_duration() {
    let sts = MockSts::scripted([]);
    let (broker, _) = broker(sts.clone());

    broker
        .assume(ROLE, Some("ext-1".to_string()), caller())
        .await
        .unwrap();

    let requests = sts.requests.lock();
    assert_eq!(
        requests.as_slice(),
        &[AssumeRoleRequest {
            role_arn: ROLE.to_string(),
            session_name: session_name(ROLE, caller()),
            external_id: Some("ext-1".to_string()),
            duration: Duration::from_secs(30 * 60),
        }]
    );
    assert!(requests[0].session_name.ends_with("-payments-svc"));
}

/// Panics on its first call and succeeds afterwards.
#[derive(Default)]
struct PanicsOnce {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl AssumeRole for PanicsOnce {
    async fn assume_role(&self, _: AssumeRoleRequest) -> Result<Credentials, AssumeRoleError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("sts client exploded");
        }
        let issued = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Ok(Credentials::issued(
            "AKIARECOVERED",
            "secret",
            "token",
            issued + chrono::Duration::minutes(30),
            issued,
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_client_does_not_poison_role() {
    let sts = Arc::new(PanicsOnce::default());
    let broker = Broker::new(sts.clone(), Config::default(), BrokerMetrics::default());

    let err = broker.assume(ROLE, None, caller()).await.unwrap_err();
    assert_eq!(
        err,
        BrokerError::Panicked {
            role: ROLE.to_string(),
            message: "sts client exploded".to_string(),
        }
    );
    assert_eq!(err.assume_role_error(), None);

    let creds = broker.assume(ROLE, None, caller()).await.unwrap();
    assert_eq!(creds.access_key_id, "AKIARECOVERED");
    assert_eq!(sts.calls.load(Ordering::SeqCst), 2);
}
