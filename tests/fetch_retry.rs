mod upstream_stub;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sa_findings::fetch::{FetchConfig, FetchError, HttpFetcher, PageSource};
use sa_findings::key::{Key, State, Target};
use upstream_stub::{UpstreamStub, findings_html, listing_html};

fn fetcher(stub: &UpstreamStub, max_attempts: u32, min_delay_ms: u64) -> anyhow::Result<HttpFetcher> {
    let mut config = FetchConfig::new(url::Url::parse(&stub.base_url)?);
    config.max_attempts = max_attempts;
    config.backoff = Duration::from_millis(1);
    config.min_delay = Duration::from_millis(min_delay_ms);
    config.timeout = Duration::from_secs(5);
    HttpFetcher::new(config)
}

#[tokio::test]
async fn server_errors_are_retried_up_to_the_attempt_limit() -> anyhow::Result<()> {
    let stub = UpstreamStub::spawn(|_| (503, "busy".to_owned()));
    let key = Key::new(State::Kerala, "GP-001", 2015);

    let err = fetcher(&stub, 3, 0)?
        .fetch(&key)
        .await
        .expect_err("always 503");
    assert!(
        matches!(&err, FetchError::Unavailable { attempts: 3, target, .. } if *target == Target::GpYear(key.clone())),
        "{err}"
    );
    assert_eq!(stub.requests().len(), 3);
    Ok(())
}

#[tokio::test]
async fn slow_responses_time_out_and_count_as_attempts() -> anyhow::Result<()> {
    let stub = UpstreamStub::spawn(|_| {
        std::thread::sleep(Duration::from_millis(300));
        (200, findings_html(&[]))
    });
    let mut config = FetchConfig::new(url::Url::parse(&stub.base_url)?);
    config.max_attempts = 2;
    config.backoff = Duration::from_millis(1);
    config.min_delay = Duration::ZERO;
    config.timeout = Duration::from_millis(100);
    let key = Key::new(State::Kerala, "GP-001", 2015);

    let started = Instant::now();
    let err = HttpFetcher::new(config)?
        .fetch(&key)
        .await
        .expect_err("every attempt outlives the timeout");
    assert!(started.elapsed() < Duration::from_millis(290), "took {:?}", started.elapsed());
    assert!(
        matches!(&err, FetchError::Unavailable { attempts: 2, .. }),
        "{err}"
    );

    // the stub serves one request at a time; let it drain before counting
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(stub.requests().len(), 2);
    Ok(())
}

#[tokio::test]
async fn not_found_is_not_retried() -> anyhow::Result<()> {
    let stub = UpstreamStub::spawn(|_| (404, "no such GP".to_owned()));
    let key = Key::new(State::Kerala, "GP-404", 2015);

    let err = fetcher(&stub, 5, 0)?
        .fetch(&key)
        .await
        .expect_err("404");
    assert_eq!(
        err,
        FetchError::NotFound {
            target: Target::GpYear(key),
            status: 404,
        }
    );
    assert_eq!(stub.requests().len(), 1);
    Ok(())
}

#[tokio::test]
async fn transient_failures_recover_within_the_limit() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let stub = UpstreamStub::spawn(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            (502, "bad gateway".to_owned())
        } else {
            (200, findings_html(&[("Grievance", "Job card withheld", "")]))
        }
    });

    let page = fetcher(&stub, 3, 0)?
        .fetch(&Key::new(State::Kerala, "GP-001", 2015))
        .await?;
    assert_eq!(page.status, 200);
    assert!(page.html.contains("Job card withheld"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn requests_carry_the_key_as_query_parameters() -> anyhow::Result<()> {
    let stub = UpstreamStub::spawn(|req| match req.param("page") {
        "S" => (200, listing_html(&["GP-001"])),
        _ => (200, findings_html(&[])),
    });
    let fetcher = fetcher(&stub, 1, 0)?;

    fetcher.fetch_listing(State::TamilNadu, 2017).await?;
    fetcher
        .fetch(&Key::new(State::TamilNadu, "2901003", 2017))
        .await?;

    let requests = stub.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].param("page"), "S");
    assert_eq!(requests[0].param("state_name"), "TAMIL NADU");
    assert_eq!(requests[0].param("audit_year"), "2017-2018");
    assert_eq!(requests[0].param("panchayat_code"), "");
    assert_eq!(requests[1].param("page"), "GP");
    assert_eq!(requests[1].param("lflag"), "eng");
    assert_eq!(requests[1].param("state_code"), "29");
    assert_eq!(requests[1].param("panchayat_code"), "2901003");
    Ok(())
}

#[tokio::test]
async fn rate_limit_spaces_requests_across_concurrent_callers() -> anyhow::Result<()> {
    let stub = UpstreamStub::spawn(|_| (200, findings_html(&[])));
    let fetcher = fetcher(&stub, 1, 150)?;

    let keys = (1..=3)
        .map(|n| Key::new(State::Kerala, format!("GP-00{n}"), 2015))
        .collect::<Vec<_>>();
    let (a, b, c) = tokio::join!(
        fetcher.fetch(&keys[0]),
        fetcher.fetch(&keys[1]),
        fetcher.fetch(&keys[2])
    );
    a?;
    b?;
    c?;

    let requests = stub.requests();
    assert_eq!(requests.len(), 3);
    for pair in requests.windows(2) {
        let gap = pair[1].received_at.duration_since(pair[0].received_at);
        assert!(gap >= Duration::from_millis(120), "requests only {gap:?} apart");
    }
    Ok(())
}
